use crate::{
    backend::BackendFactory,
    envelope::{envelope, timestamp},
    error::ServiceError,
    registry::SessionRegistry,
    session::SessionId,
};
use model_server_proto::{
    model_server_server::ModelServer, BboxResponse, Empty, Envelope, Session,
};
use std::{sync::Arc, time::Instant};
use tonic::{async_trait, Request, Response, Status};
use tracing::instrument;

pub struct ModelServerService<F: BackendFactory> {
    registry: Arc<SessionRegistry<F>>,
}

impl<F: BackendFactory> ModelServerService<F> {
    pub fn new(registry: Arc<SessionRegistry<F>>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl<F: BackendFactory> ModelServer for ModelServerService<F> {
    #[instrument(skip_all, fields(session_id = %request.get_ref().session_id))]
    async fn register(&self, request: Request<Session>) -> Result<Response<Envelope>, Status> {
        let session = request.into_inner();
        let session_id = SessionId::try_from(session.session_id.as_str())?;

        let start = Instant::now();
        self.registry
            .ensure(&session_id)
            .await
            .map_err(ServiceError::from)?;
        let timestamp = timestamp();
        let elapsed = start.elapsed();

        tracing::debug!("{} sessions registered", self.registry.len());
        Ok(Response::new(envelope(session, timestamp, elapsed)))
    }

    #[instrument(skip_all, fields(session_id = %request.get_ref().session_id))]
    async fn dummy_computation(
        &self,
        request: Request<Session>,
    ) -> Result<Response<Envelope>, Status> {
        let session = request.into_inner();
        let session_id = SessionId::try_from(session.session_id.as_str())?;

        let start = Instant::now();
        let worker = self.registry.lookup(&session_id).map_err(ServiceError::from)?;
        let timestamp = worker.probe().await.map_err(ServiceError::from)?;
        let elapsed = start.elapsed();

        tracing::info!("Got this message {:?} at {}", session, timestamp);
        Ok(Response::new(envelope(session, timestamp, elapsed)))
    }

    #[instrument(skip_all, fields(session_id = %request.get_ref().session_id))]
    async fn model_computation(
        &self,
        request: Request<Session>,
    ) -> Result<Response<BboxResponse>, Status> {
        let session = request.into_inner();
        let session_id = SessionId::try_from(session.session_id.as_str())?;

        let start = Instant::now();
        let worker = self.registry.lookup(&session_id).map_err(ServiceError::from)?;
        let (bboxes, timestamp) = worker
            .detect(&session.message)
            .await
            .map_err(ServiceError::from)?;
        let elapsed = start.elapsed();

        tracing::debug!("Returning {} detections", bboxes.len());
        Ok(Response::new(BboxResponse {
            envelope: Some(envelope(session, timestamp, elapsed)),
            bboxes,
        }))
    }

    #[instrument(skip_all, fields(session_id = %request.get_ref().session_id))]
    async fn kill_actor(&self, request: Request<Session>) -> Result<Response<Empty>, Status> {
        let session_id = SessionId::try_from(request.into_inner().session_id)?;

        let removed = self.registry.terminate(&session_id).await;
        tracing::debug!(removed, "{} sessions remain", self.registry.len());

        Ok(Response::new(Empty {}))
    }
}
