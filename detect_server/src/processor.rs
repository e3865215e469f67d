//! Frame processing: detection, suppression and annotation of a single frame.
//!
use std::time::Instant;

use anyhow::Result;
use common::{Detection, Settings};
use image::{Rgb, RgbImage};
use rusttype::Font;
use tokio_util::sync::CancellationToken;

use crate::{
    nn::{decode_candidates, non_maximum_suppression, InferModel, NMS_MAX_IOU},
    overlay::{darken, layout, paint, palette, vignette},
    state::AppState,
};

/// Frame rate reported when a frame took no measurable time.
pub const NOMINAL_FPS: f32 = 30.0;

/// Annotated frame with the detections drawn onto it.
pub struct Annotated {
    pub frame: RgbImage,
    pub detections: Vec<Detection>,
}

/// Anything that turns a camera frame into an annotated frame.
pub trait Annotate: Send + Sync {
    /// Annotate `frame` according to `settings`. `fps` is the frame rate to display.
    fn annotate(&self, frame: RgbImage, settings: &Settings, fps: f32) -> Result<Annotated>;
}

/// Object detection annotator.
pub struct FrameProcessor {
    model: Box<dyn InferModel>,
    labels: Vec<String>,
    colors: Vec<Rgb<u8>>,
    font: Option<Font<'static>>,
}

impl FrameProcessor {
    /// Create a processor. Without a font, boxes are drawn but no text.
    pub fn new(
        model: Box<dyn InferModel>,
        labels: Vec<String>,
        font: Option<Font<'static>>,
    ) -> Self {
        let colors = palette(labels.len());
        Self {
            model,
            labels,
            colors,
            font,
        }
    }

    fn label(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class {class_id}"))
    }

    fn color(&self, class_id: usize) -> Rgb<u8> {
        match self.colors.is_empty() {
            true => Rgb([0, 255, 0]),
            false => self.colors[class_id % self.colors.len()],
        }
    }
}

impl Annotate for FrameProcessor {
    fn annotate(&self, mut frame: RgbImage, settings: &Settings, fps: f32) -> Result<Annotated> {
        let (width, height) = frame.dimensions();

        if settings.fancy_boxes {
            vignette(&mut frame);
        }

        let rows = self.model.run(&frame)?;
        let candidates =
            decode_candidates(rows.view(), width, height, settings.confidence_threshold);
        let num_candidates = candidates.len();
        let selected = non_maximum_suppression(candidates, NMS_MAX_IOU);
        log::debug!(
            "Kept {} of {} candidates",
            selected.len(),
            num_candidates
        );

        if settings.dark_mode {
            darken(&mut frame);
        }

        let colored: Vec<(Detection, Rgb<u8>)> = selected
            .iter()
            .map(|candidate| {
                (
                    Detection::new(
                        self.label(candidate.class_id),
                        candidate.confidence,
                        candidate.bbox,
                    ),
                    self.color(candidate.class_id),
                )
            })
            .collect();

        let marks = layout(&colored, settings, fps);
        paint(&mut frame, &marks, self.font.as_ref());

        Ok(Annotated {
            frame,
            detections: colored.into_iter().map(|(detection, _)| detection).collect(),
        })
    }
}

/// Process one frame of a streaming session.
///
/// Reads the current settings, annotates the frame and publishes detections and frame rate
/// to `state`. The frame rate shown on the frame is the one of the previous frame.
pub fn process_frame(
    annotator: &dyn Annotate,
    frame: RgbImage,
    state: &AppState,
    session: &CancellationToken,
) -> Result<RgbImage> {
    let start = Instant::now();
    let settings = state.settings();

    let annotated = annotator.annotate(frame, &settings, state.fps())?;

    let elapsed = start.elapsed();
    state.meter().record_processed(elapsed);
    let fps = fps_from_elapsed(elapsed.as_secs_f32());
    state.publish(session, annotated.detections, fps);

    Ok(annotated.frame)
}

/// Instantaneous frame rate for a frame which took `elapsed` seconds.
pub fn fps_from_elapsed(elapsed: f32) -> f32 {
    match elapsed > 0.0 {
        true => 1.0 / elapsed,
        false => NOMINAL_FPS,
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use ndarray::{array, Array2};

    /// Detector returning the same rows for every frame.
    struct FixedModel(Array2<f32>);

    impl InferModel for FixedModel {
        fn run(&self, _input: &RgbImage) -> Result<Array2<f32>> {
            Ok(self.0.clone())
        }
    }

    fn processor(rows: Array2<f32>) -> FrameProcessor {
        FrameProcessor::new(
            Box::new(FixedModel(rows)),
            vec!["person".into(), "dog".into()],
            None,
        )
    }

    /// Two duplicates of one person and a dog, on a 100x100 frame.
    fn scene() -> Array2<f32> {
        array![
            [0.5, 0.5, 0.4, 0.4, 0.9, 0.05],
            [0.5, 0.48, 0.4, 0.36, 0.6, 0.1],
            [0.1, 0.1, 0.1, 0.1, 0.2, 0.55],
        ]
    }

    #[test]
    fn duplicates_are_merged() -> Result<()> {
        let annotated = processor(scene()).annotate(
            RgbImage::new(100, 100),
            &Settings::default(),
            0.0,
        )?;

        assert_eq!(
            annotated.detections,
            vec![
                Detection::new("person", 0.9, [30, 30, 40, 40]),
                Detection::new("dog", 0.55, [5, 5, 10, 10]),
            ]
        );

        Ok(())
    }

    #[test]
    fn threshold_filters_detections() -> Result<()> {
        let processor = processor(scene());

        for threshold in [0.0, 0.3, 0.56, 0.95] {
            let settings = Settings {
                confidence_threshold: threshold,
                ..Settings::default()
            };
            let annotated = processor.annotate(RgbImage::new(100, 100), &settings, 0.0)?;
            assert!(annotated
                .detections
                .iter()
                .all(|d| d.confidence >= threshold));
        }

        Ok(())
    }

    #[test]
    fn empty_detections_are_fine() -> Result<()> {
        let annotated = processor(Array2::zeros((0, 6))).annotate(
            RgbImage::new(10, 10),
            &Settings::default(),
            0.0,
        )?;

        assert!(annotated.detections.is_empty());
        assert_eq!(annotated.frame, RgbImage::new(10, 10));

        Ok(())
    }

    #[test]
    fn boxes_are_drawn_in_class_color() -> Result<()> {
        let processor = processor(scene());
        let annotated =
            processor.annotate(RgbImage::new(100, 100), &Settings::default(), 0.0)?;

        assert_eq!(*annotated.frame.get_pixel(30, 50), processor.color(0));
        assert_eq!(*annotated.frame.get_pixel(50, 50), Rgb([0, 0, 0]));

        Ok(())
    }

    #[test]
    fn process_frame_publishes_results() -> Result<()> {
        let state = AppState::default();
        let session = state.begin_session();

        process_frame(&processor(scene()), RgbImage::new(100, 100), &state, &session)?;

        assert_eq!(state.detections().len(), 2);
        assert!(state.fps() > 0.0);
        assert_eq!(state.meter().take_report().map(|r| r.processed), Some(1));

        Ok(())
    }

    #[test]
    fn fps_falls_back_to_nominal() {
        assert_eq!(fps_from_elapsed(0.0), NOMINAL_FPS);
        assert_eq!(fps_from_elapsed(-1.0), NOMINAL_FPS);
        assert_eq!(fps_from_elapsed(0.5), 2.0);
    }
}
