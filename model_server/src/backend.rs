use crate::{error::BackendError, session::SessionId};
use image::DynamicImage;
use model_server_proto::Bbox;

/// A detected region as `(top, left, bottom, right)` in source image pixels.
pub type Region = [f32; 4];

/// One loaded model instance. Not safe to call concurrently, hence `&mut self`.
pub trait Backend: Send + 'static {
    fn infer(&mut self, image: &DynamicImage) -> Result<Vec<Region>, BackendError>;
}

/// Builds a fresh backend for every session from the same fixed model configuration.
pub trait BackendFactory: Send + Sync + 'static {
    type Backend: Backend;

    fn create(&self, session_id: &SessionId) -> Result<Self::Backend, BackendError>;
}

pub fn region_to_bbox(region: &Region) -> Bbox {
    Bbox {
        x: region[0],
        y: region[1],
        h: region[2] - region[0],
        w: region[3] - region[1],
    }
}
