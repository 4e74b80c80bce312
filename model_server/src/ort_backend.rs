use crate::{
    backend::{Backend, BackendFactory, Region},
    config::ModelConfig,
    error::BackendError,
    session::SessionId,
};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{s, Array, Axis, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
}

impl Candidate {
    fn into_region(self) -> Region {
        [self.y1, self.x1, self.y2, self.x2]
    }
}

fn intersection(box1: &Candidate, box2: &Candidate) -> f32 {
    let w = box1.x2.min(box2.x2) - box1.x1.max(box2.x1);
    let h = box1.y2.min(box2.y2) - box1.y1.max(box2.y1);
    w.max(0.0) * h.max(0.0)
}

fn union(box1: &Candidate, box2: &Candidate) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn non_max_suppression(mut boxes: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));
    let mut result = Vec::new();

    while let Some(&best) = boxes.first() {
        result.push(best);
        boxes.retain(|other| {
            let union = union(&best, other);
            union > 0.0 && intersection(&best, other) / union < iou_threshold
        });
    }

    result
}

fn transform_image(image: &DynamicImage, input_size: u32) -> Array<f32, Ix4> {
    let size = input_size as usize;
    let img = image.resize_exact(input_size, input_size, FilterType::CatmullRom);

    let mut input = Array::zeros((1, 3, size, size));
    for pixel in img.pixels() {
        let x = pixel.0 as _;
        let y = pixel.1 as _;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

fn load_session(path: &Path) -> Result<Session, ort::Error> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(path)?;
    Ok(session)
}

/// YOLO detector running on ONNX Runtime. One instance per session.
pub struct OrtBackend {
    session: Session,
    input_size: u32,
    min_probability: f32,
    iou_threshold: f32,
}

impl OrtBackend {
    fn run_inference(&mut self, input: &Array<f32, Ix4>) -> Result<ndarray::ArrayD<f32>, BackendError> {
        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| BackendError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| BackendError::Inference(e.to_string()))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| BackendError::Inference(format!("failed to extract tensor: {}", e)))?;

        ndarray::ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| BackendError::Inference(format!("invalid tensor shape: {}", e)))
    }

    fn decode_candidates(
        &self,
        outputs: &ndarray::ArrayD<f32>,
        img_width: u32,
        img_height: u32,
    ) -> Result<Vec<Candidate>, BackendError> {
        if outputs.ndim() != 3 {
            return Err(BackendError::Inference(format!(
                "expected a rank 3 output, got shape {:?}",
                outputs.shape()
            )));
        }

        let scale = self.input_size as f32;
        let (img_width, img_height) = (img_width as f32, img_height as f32);
        // [1, 4 + classes, anchors] -> [anchors, 4 + classes]
        let transposed = outputs.t();
        let output = transposed.slice(s![.., .., 0]);

        let mut boxes = Vec::new();
        for row in output.axis_iter(Axis(0)) {
            let row: Vec<_> = row.iter().copied().collect();
            let Some(prob) = row.iter().skip(4).copied().reduce(f32::max) else {
                continue;
            };
            if prob < self.min_probability {
                continue;
            }

            let xc = row[0] / scale * img_width;
            let yc = row[1] / scale * img_height;
            let w = row[2] / scale * img_width;
            let h = row[3] / scale * img_height;

            boxes.push(Candidate {
                x1: (xc - w / 2.).max(0.0),
                y1: (yc - h / 2.).max(0.0),
                x2: (xc + w / 2.).min(img_width),
                y2: (yc + h / 2.).min(img_height),
                confidence: prob,
            });
        }

        Ok(boxes)
    }
}

impl Backend for OrtBackend {
    fn infer(&mut self, image: &DynamicImage) -> Result<Vec<Region>, BackendError> {
        let (img_width, img_height) = image.dimensions();
        let input = transform_image(image, self.input_size);
        let outputs = self.run_inference(&input)?;
        let candidates = self.decode_candidates(&outputs, img_width, img_height)?;

        let regions: Vec<Region> = non_max_suppression(candidates, self.iou_threshold)
            .into_iter()
            .map(Candidate::into_region)
            .collect();

        tracing::debug!("Detected {} regions", regions.len());
        Ok(regions)
    }
}

#[derive(Debug, Clone)]
pub struct OrtBackendFactory {
    model: ModelConfig,
}

impl OrtBackendFactory {
    pub fn new(model: &ModelConfig) -> Self {
        Self {
            model: model.clone(),
        }
    }
}

impl BackendFactory for OrtBackendFactory {
    type Backend = OrtBackend;

    fn create(&self, session_id: &SessionId) -> Result<OrtBackend, BackendError> {
        let path = self.model.get_path();
        let session = load_session(&path).map_err(|e| BackendError::Load(e.to_string()))?;
        tracing::info!("Loaded {:?} for session {}", path, session_id);

        Ok(OrtBackend {
            session,
            input_size: self.model.input_size,
            min_probability: self.model.min_probability,
            iou_threshold: self.model.iou_threshold,
        })
    }
}
