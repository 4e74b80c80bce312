use crate::{
    backend::BackendFactory,
    config::Config,
    fetch::HttpImageFetcher,
    ort_backend::OrtBackendFactory,
    registry::SessionRegistry,
    service::ModelServerService,
};
use model_server_proto::model_server_server::ModelServerServer;
use std::{net::SocketAddr, sync::Arc};
use tokio::signal;
use tonic::transport::server::Router;
use tonic::transport::Server;

pub struct GrpcServer<F: BackendFactory> {
    router: Router,
    registry: Arc<SessionRegistry<F>>,
    addr: String,
}

impl<F: BackendFactory> GrpcServer<F> {
    pub async fn new(
        registry: Arc<SessionRegistry<F>>,
        addr: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let model_service = ModelServerService::new(registry.clone());
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(model_server_proto::FILE_DESCRIPTOR_SET)
            .build_v1alpha()?;
        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<ModelServerServer<ModelServerService<F>>>()
            .await;

        let router = Server::builder()
            .add_service(health_service)
            .add_service(ModelServerServer::new(model_service))
            .add_service(reflection_service);

        Ok(Self {
            router,
            registry,
            addr: addr.to_string(),
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let addr: SocketAddr = self.addr.parse()?;

        tracing::info!("Model server listening on {}", self.addr);

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        self.router.serve_with_shutdown(addr, shutdown).await?;

        let disposed = self.registry.shutdown_all().await;
        tracing::info!("Disposed {} session workers", disposed);
        Ok(())
    }
}

pub async fn start_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let factory = OrtBackendFactory::new(&config.model);
    let fetcher = HttpImageFetcher::new(&config.fetch)?;
    let registry = Arc::new(SessionRegistry::new(
        factory,
        Arc::new(fetcher),
        config.worker.mailbox_capacity,
    ));

    let addr = config.server.get_address();
    let grpc_server = GrpcServer::new(registry, &addr).await?;

    grpc_server.run().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
