//! Stub collaborators shared by unit tests.

use crate::{
    backend::{Backend, BackendFactory, Region},
    error::{BackendError, FetchError},
    fetch::ImageFetcher,
    session::SessionId,
};
use image::DynamicImage;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tonic::async_trait;

pub const CANNED_REGIONS: [Region; 2] = [[10.0, 20.0, 110.0, 70.0], [200.0, 50.0, 300.0, 200.0]];

#[derive(Clone, Default)]
pub struct Recorder {
    pub intervals: Arc<Mutex<Vec<(Instant, Instant)>>>,
    pub dropped: Arc<AtomicUsize>,
}

pub struct StubBackend {
    recorder: Recorder,
    delay: Duration,
}

impl StubBackend {
    pub fn new(recorder: Recorder, delay: Duration) -> Self {
        Self { recorder, delay }
    }
}

impl Backend for StubBackend {
    fn infer(&mut self, image: &DynamicImage) -> Result<Vec<Region>, BackendError> {
        let entered = Instant::now();
        std::thread::sleep(self.delay);
        self.recorder
            .intervals
            .lock()
            .push((entered, Instant::now()));

        if image.width() == 1 {
            return Err(BackendError::Inference("image too small".to_string()));
        }
        Ok(CANNED_REGIONS.to_vec())
    }
}

impl Drop for StubBackend {
    fn drop(&mut self) {
        self.recorder.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct StubFactory {
    pub created: Arc<AtomicUsize>,
    pub fail: Arc<AtomicBool>,
    pub create_delay: Duration,
    pub infer_delay: Duration,
    pub recorder: Recorder,
}

impl BackendFactory for StubFactory {
    type Backend = StubBackend;

    fn create(&self, _session_id: &SessionId) -> Result<StubBackend, BackendError> {
        std::thread::sleep(self.create_delay);
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackendError::Load("weights missing".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(StubBackend::new(self.recorder.clone(), self.infer_delay))
    }
}

/// `http://bad` fails, `http://one-pixel` makes the stub backend fail,
/// `http://slow` takes 200ms, anything else is a 4x4 image.
pub struct StubFetcher;

#[async_trait]
impl ImageFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<DynamicImage, FetchError> {
        match url {
            "http://bad" => Err(FetchError::Status(404)),
            "http://one-pixel" => Ok(DynamicImage::new_rgb8(1, 1)),
            "http://slow" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(DynamicImage::new_rgb8(4, 4))
            }
            _ => Ok(DynamicImage::new_rgb8(4, 4)),
        }
    }
}
