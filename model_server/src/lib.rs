mod backend;
mod envelope;
mod error;
mod fetch;
mod ort_backend;
mod registry;
mod server;
mod service;
mod session;
mod worker;

#[cfg(test)]
mod testing;

pub mod config;

pub use backend::{region_to_bbox, Backend, BackendFactory, Region};
pub use error::{BackendError, ComputeError, FetchError, RegistryError, ServiceError, WorkerError};
pub use fetch::{HttpImageFetcher, ImageFetcher};
pub use model_server_proto as proto;
pub use ort_backend::{OrtBackend, OrtBackendFactory};
pub use registry::SessionRegistry;
pub use server::{start_server, GrpcServer};
pub use service::ModelServerService;
pub use session::SessionId;
pub use worker::WorkerHandle;
