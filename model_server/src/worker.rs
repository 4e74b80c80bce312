//! Per-session worker actor.
//!
//! Each worker owns one backend and drains a single mailbox, so commands sent
//! to the same session run one at a time in the order they were sent.

use crate::{
    backend::{region_to_bbox, Backend},
    envelope::timestamp,
    error::{ComputeError, WorkerError},
    fetch::ImageFetcher,
    session::SessionId,
};
use model_server_proto::Bbox;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Detected boxes plus the worker time at which inference finished.
pub type Detection = (Vec<Bbox>, String);

type DetectReply = oneshot::Sender<Result<Detection, ComputeError>>;

pub enum WorkerCommand {
    Probe {
        reply: oneshot::Sender<String>,
    },
    Detect {
        url: String,
        reply: DetectReply,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable address of a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    session_id: SessionId,
    tx: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    /// True when both handles address the same worker.
    pub fn same_worker(&self, other: &WorkerHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    async fn send(&self, command: WorkerCommand) -> Result<(), WorkerError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| WorkerError::Stopped(self.session_id.clone()))
    }

    /// Time observed inside the worker once every earlier command has finished.
    pub async fn probe(&self) -> Result<String, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(WorkerCommand::Probe { reply: reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| WorkerError::Stopped(self.session_id.clone()))
    }

    pub async fn detect(&self, url: &str) -> Result<Detection, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(WorkerCommand::Detect {
            url: url.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| WorkerError::Stopped(self.session_id.clone()))?
            .map_err(|source| WorkerError::Compute {
                session: self.session_id.clone(),
                source,
            })
    }

    /// Stops the worker after everything already queued has run, then drops the backend.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .send(WorkerCommand::Shutdown { reply: reply_tx })
            .await
            .is_err()
        {
            debug!("Worker for session {} already stopped", self.session_id);
            return;
        }
        let _ = reply_rx.await;
    }
}

pub struct WorkerActor<B: Backend> {
    session_id: SessionId,
    backend: Arc<Mutex<B>>,
    fetcher: Arc<dyn ImageFetcher>,
    rx: mpsc::Receiver<WorkerCommand>,
}

impl<B: Backend> WorkerActor<B> {
    pub fn create(
        session_id: SessionId,
        backend: B,
        fetcher: Arc<dyn ImageFetcher>,
        mailbox_capacity: usize,
    ) -> (WorkerHandle, Self) {
        let (tx, rx) = mpsc::channel(mailbox_capacity);

        let handle = WorkerHandle {
            session_id: session_id.clone(),
            tx,
        };

        let actor = Self {
            session_id,
            backend: Arc::new(Mutex::new(backend)),
            fetcher,
            rx,
        };

        (handle, actor)
    }

    pub async fn run(mut self) {
        info!("Worker started for session {}", self.session_id);
        let mut shutdown_replies = Vec::new();

        while let Some(command) = self.rx.recv().await {
            match command {
                WorkerCommand::Probe { reply } => {
                    let _ = reply.send(timestamp());
                }
                WorkerCommand::Detect { url, mut reply } => {
                    if let Some(result) = self.detect(&url, &mut reply).await {
                        if let Err(e) = &result {
                            warn!("Detection failed for session {}: {}", self.session_id, e);
                        }
                        let _ = reply.send(result);
                    }
                }
                WorkerCommand::Shutdown { reply } => {
                    // Remaining queued commands still run before recv returns None
                    self.rx.close();
                    shutdown_replies.push(reply);
                }
            }
        }

        let session_id = self.session_id.clone();
        drop(self);
        info!("Worker stopped for session {}", session_id);

        for reply in shutdown_replies {
            let _ = reply.send(());
        }
    }

    /// Returns `None` when the caller went away before inference started.
    async fn detect(
        &self,
        url: &str,
        reply: &mut DetectReply,
    ) -> Option<Result<Detection, ComputeError>> {
        if reply.is_closed() {
            debug!("Skipping detection for session {}, caller gone", self.session_id);
            return None;
        }

        let image = tokio::select! {
            _ = reply.closed() => {
                debug!("Abandoned fetch of {} for session {}", url, self.session_id);
                return None;
            }
            image = self.fetcher.fetch(url) => image,
        };
        let image = match image {
            Ok(image) => image,
            Err(e) => return Some(Err(e.into())),
        };

        let backend = self.backend.clone();
        let regions = tokio::task::spawn_blocking(move || backend.lock().infer(&image)).await;

        let result = match regions {
            Ok(Ok(regions)) => Ok((regions.iter().map(region_to_bbox).collect(), timestamp())),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(ComputeError::Aborted(e.to_string())),
        };
        Some(result)
    }
}
