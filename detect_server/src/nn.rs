//! Neural network models and their post-processing.
//!
//! Three ONNX models are run with `tract`:
//! - `YoloModel`: object detector producing one row of class scores per cell.
//! - `UltrafaceModel`: face detector used by the emotion stream.
//! - `FerPlusModel`: emotion classifier for grayscale face crops.
use std::path::Path;

use anyhow::{Context, Result};
use image::{GrayImage, RgbImage};
use itertools::Itertools;
use ndarray::{s, Array2, ArrayView2, Axis, Ix3};
use tract_onnx::prelude::*;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// IoU above which two boxes count as the same object.
pub const NMS_MAX_IOU: f32 = 0.4;

/// Object detector.
///
/// `run` returns one row per cell: `[cx, cy, w, h, score_0, .., score_n]`, where the box
/// is normalized to `[0, 1]` relative to the input frame.
pub trait InferModel: Send + Sync {
    fn run(&self, input: &RgbImage) -> Result<Array2<f32>>;
}

/// Face detector returning normalized `[x_tl, y_tl, x_br, y_br]` boxes with confidences.
pub trait FaceDetector: Send + Sync {
    fn detect_faces(&self, input: &RgbImage) -> Result<Vec<([f32; 4], f32)>>;
}

/// Emotion classifier returning one probability per entry of `EMOTIONS`.
pub trait EmotionClassifier: Send + Sync {
    fn classify(&self, face: &GrayImage) -> Result<[f32; 8]>;
}

/// Labels of the FER+ output classes, in output order.
pub const EMOTIONS: [&str; 8] = [
    "neutral",
    "happiness",
    "surprise",
    "sadness",
    "anger",
    "disgust",
    "fear",
    "contempt",
];

/// Candidate box after thresholding, before suppression.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    /// `[x, y, width, height]` in pixels.
    pub bbox: [i32; 4],
    pub confidence: f32,
    pub class_id: usize,
}

/// YOLOv8 detector with a square input.
pub struct YoloModel {
    model: NnModel,
    size: u32,
}

impl YoloModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let size = 640;
        let model = load_plan(path.as_ref(), [1, 3, size as usize, size as usize])?;
        Ok(Self { model, size })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        // Plain resize without letterboxing, the aspect ratio is restored by the normalized
        // output coordinates.
        let resized: RgbImage = image::imageops::resize(
            input,
            self.size,
            self.size,
            image::imageops::FilterType::Triangle,
        );

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.size as usize, self.size as usize),
            |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into()
    }
}

impl InferModel for YoloModel {
    fn run(&self, input: &RgbImage) -> Result<Array2<f32>> {
        let raw_nn_out = self.model.run(tvec!(self.preproc(input).into()))?;

        // Output has shape `[1, 4 + classes, cells]`
        let output = raw_nn_out[0]
            .to_array_view::<f32>()?
            .into_dimensionality::<Ix3>()
            .context("unexpected detector output shape")?;
        let mut rows = output.index_axis(Axis(0), 0).t().to_owned();

        let size = self.size as f32;
        rows.slice_mut(s![.., 0..4]).mapv_inplace(|v| v / size);

        Ok(rows)
    }
}

/// Ultraface face detector, RFB-320 variant.
pub struct UltrafaceModel {
    model: NnModel,
    width: u32,
    height: u32,
    min_confidence: f32,
}

impl UltrafaceModel {
    pub fn load(path: impl AsRef<Path>, min_confidence: f32) -> Result<Self> {
        let (width, height) = (320, 240);
        let model = load_plan(path.as_ref(), [1, 3, height as usize, width as usize])?;
        Ok(Self {
            model,
            width,
            height,
            min_confidence,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            input,
            self.width,
            self.height,
            image::imageops::FilterType::Triangle,
        );

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, c, y, x)| {
                // Note: Mean/std are from MobileNet, not from Ultraface, but work well
                let mean = [0.485, 0.456, 0.406][c];
                let std = [0.229, 0.224, 0.225][c];
                (resized[(x as _, y as _)][c] as f32 / 255.0 - mean) / std
            },
        )
        .into()
    }
}

impl FaceDetector for UltrafaceModel {
    fn detect_faces(&self, input: &RgbImage) -> Result<Vec<([f32; 4], f32)>> {
        let raw_nn_out = self.model.run(tvec!(self.preproc(input).into()))?;

        // Scores have shape `[1, cells, 2]` with background/face, boxes `[1, cells, 4]`
        let confidences = raw_nn_out[0]
            .to_array_view::<f32>()?
            .slice(s![0, .., 1])
            .to_vec();
        let bboxes: Vec<f32> = raw_nn_out[1].to_array_view::<f32>()?.iter().cloned().collect();

        let faces = confidences
            .into_iter()
            .zip(bboxes.chunks_exact(4))
            .filter(|(confidence, _)| *confidence > self.min_confidence)
            .map(|(confidence, bbox)| ([bbox[0], bbox[1], bbox[2], bbox[3]], confidence))
            .collect();

        Ok(faces)
    }
}

/// FER+ emotion classifier on 64x64 grayscale crops.
pub struct FerPlusModel {
    model: NnModel,
}

impl FerPlusModel {
    pub const INPUT_SIZE: u32 = 64;

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let size = Self::INPUT_SIZE as usize;
        let model = load_plan(path.as_ref(), [1, 1, size, size])?;
        Ok(Self { model })
    }
}

impl EmotionClassifier for FerPlusModel {
    fn classify(&self, face: &GrayImage) -> Result<[f32; 8]> {
        let size = Self::INPUT_SIZE;
        let resized = image::imageops::resize(
            face,
            size,
            size,
            image::imageops::FilterType::Triangle,
        );

        // FER+ takes raw pixel intensities
        let shape = (1, 1, size as usize, size as usize);
        let input: Tensor = tract_ndarray::Array4::from_shape_fn(shape, |(_, _, y, x)| {
            resized[(x as _, y as _)][0] as f32
        })
        .into();

        let raw_nn_out = self.model.run(tvec!(input.into()))?;
        let logits: Vec<f32> = raw_nn_out[0].to_array_view::<f32>()?.iter().cloned().collect();
        anyhow::ensure!(
            logits.len() == EMOTIONS.len(),
            "expected {} emotion scores, got {}",
            EMOTIONS.len(),
            logits.len()
        );

        Ok(softmax(&logits))
    }
}

fn load_plan(path: &Path, shape: [usize; 4]) -> Result<NnModel> {
    let input_fact = InferenceFact::dt_shape(
        f32::datum_type(),
        tvec!(shape[0], shape[1], shape[2], shape[3]),
    );
    let model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to read model {}", path.display()))?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    log::info!("Loaded model {}", path.display());

    Ok(model)
}

fn softmax(logits: &[f32]) -> [f32; 8] {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();

    let mut probabilities = [0.0; 8];
    for (p, e) in probabilities.iter_mut().zip(exps) {
        *p = e / sum;
    }
    probabilities
}

/// Turn detector rows into pixel-space candidates.
///
/// Every row is reduced to its best class. Rows whose best score is not strictly above
/// `min_confidence` are dropped, as are rows with non-finite values. Boxes are converted from
/// center/size to top-left/size and clipped to the frame; boxes without area inside the frame
/// are dropped.
pub fn decode_candidates(
    rows: ArrayView2<f32>,
    width: u32,
    height: u32,
    min_confidence: f32,
) -> Vec<Candidate> {
    if rows.ncols() < 5 {
        return Vec::new();
    }

    let (frame_w, frame_h) = (i64::from(width), i64::from(height));
    let (width, height) = (width as f32, height as f32);

    rows.outer_iter()
        .filter_map(|row| {
            if !row.iter().all(|value| value.is_finite()) {
                return None;
            }

            let scores = row.slice(s![4..]);
            let class_id = scores.iter().position_max_by(|a, b| a.total_cmp(b))?;
            let confidence = scores[class_id];
            if confidence <= min_confidence {
                return None;
            }

            let center_x = (row[0] * width) as i64;
            let center_y = (row[1] * height) as i64;
            let w = (row[2] * width) as i64;
            let h = (row[3] * height) as i64;
            let x = (center_x as f64 - w as f64 / 2.0) as i64;
            let y = (center_y as f64 - h as f64 / 2.0) as i64;

            let x_tl = x.clamp(0, frame_w);
            let y_tl = y.clamp(0, frame_h);
            let x_br = x.saturating_add(w).clamp(0, frame_w);
            let y_br = y.saturating_add(h).clamp(0, frame_h);
            if x_br <= x_tl || y_br <= y_tl {
                return None;
            }

            Some(Candidate {
                bbox: [
                    x_tl as i32,
                    y_tl as i32,
                    (x_br - x_tl) as i32,
                    (y_br - y_tl) as i32,
                ],
                confidence,
                class_id,
            })
        })
        .collect()
}

/// Run non-maximum-suppression on candidate bounding boxes.
///
/// Start with the most confident bounding box and iterate over all other bounding boxes in the
/// order of sinking confidence. Grow the vector of selected bounding boxes by adding only those
/// candidates which do not have an IoU above `max_iou` with already chosen bounding boxes.
/// Classes are not taken into account.
pub fn non_maximum_suppression(mut candidates: Vec<Candidate>, max_iou: f32) -> Vec<Candidate> {
    // Ascending, so that the most confident box is at the back
    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut selected: Vec<Candidate> = Vec::with_capacity(candidates.len());
    'candidates: while let Some(candidate) = candidates.pop() {
        for chosen in selected.iter() {
            if iou(&candidate.bbox, &chosen.bbox) > max_iou {
                continue 'candidates;
            }
        }

        selected.push(candidate);
    }

    selected
}

/// Calculate the intersection-over-union metric for two `[x, y, width, height]` boxes.
pub fn iou(bbox_a: &[i32; 4], bbox_b: &[i32; 4]) -> f32 {
    let (a, b) = (corners(bbox_a), corners(bbox_b));
    // If the boxes do not overlap, the overlap box is ill defined and its area is zero.
    let overlap_box = [a[0].max(b[0]), a[1].max(b[1]), a[2].min(b[2]), a[3].min(b[3])];
    let overlap_area = corner_area(&overlap_box);

    let union_area = corner_area(&a) + corner_area(&b) - overlap_area;

    // Avoid division-by-zero with `EPS`
    overlap_area / (union_area + EPS)
}

/// `[x_tl, y_tl, x_br, y_br]` of a `[x, y, width, height]` box, negative sizes count as zero.
fn corners(bbox: &[i32; 4]) -> [i64; 4] {
    let [x, y, w, h] = bbox.map(i64::from);
    [x, y, x + w.max(0), y + h.max(0)]
}

/// Area of a `[x_tl, y_tl, x_br, y_br]` box, zero if the corners are swapped.
fn corner_area(corners: &[i64; 4]) -> f32 {
    let width = corners[2] - corners[0];
    let height = corners[3] - corners[1];
    if width < 0 || height < 0 {
        return 0.0;
    }

    width as f32 * height as f32
}
