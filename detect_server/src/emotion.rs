//! Emotion annotator: a face detector chained into an emotion classifier.
//!
use anyhow::Result;
use common::{Detection, Settings};
use image::{imageops, Rgb, RgbImage};
use itertools::Itertools;
use rusttype::Font;

use crate::{
    nn::{non_maximum_suppression, Candidate, EmotionClassifier, FaceDetector, EMOTIONS},
    overlay::{darken, layout, paint, vignette},
    processor::{Annotate, Annotated},
};

/// IoU above which two face boxes are merged.
const FACE_MAX_IOU: f32 = 0.5;

const FACE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

pub struct EmotionAnnotator {
    faces: Box<dyn FaceDetector>,
    emotions: Box<dyn EmotionClassifier>,
    font: Option<Font<'static>>,
}

impl EmotionAnnotator {
    pub fn new(
        faces: Box<dyn FaceDetector>,
        emotions: Box<dyn EmotionClassifier>,
        font: Option<Font<'static>>,
    ) -> Self {
        Self {
            faces,
            emotions,
            font,
        }
    }

    /// Face boxes in pixels, clipped to the frame.
    fn face_boxes(&self, frame: &RgbImage) -> Result<Vec<Candidate>> {
        let (width, height) = frame.dimensions();
        let (fw, fh) = (width as f32, height as f32);

        let candidates = self
            .faces
            .detect_faces(frame)?
            .into_iter()
            .filter_map(|(bbox, confidence)| {
                let x_tl = (bbox[0] * fw).clamp(0.0, fw) as i32;
                let y_tl = (bbox[1] * fh).clamp(0.0, fh) as i32;
                let x_br = (bbox[2] * fw).clamp(0.0, fw) as i32;
                let y_br = (bbox[3] * fh).clamp(0.0, fh) as i32;
                (x_br > x_tl && y_br > y_tl).then_some(Candidate {
                    bbox: [x_tl, y_tl, x_br - x_tl, y_br - y_tl],
                    confidence,
                    class_id: 0,
                })
            })
            .collect();

        Ok(non_maximum_suppression(candidates, FACE_MAX_IOU))
    }

    /// Dominant emotion and its probability for one face.
    fn dominant_emotion(&self, frame: &RgbImage, face: &Candidate) -> Result<(usize, f32)> {
        let [x, y, w, h] = face.bbox;
        let crop = imageops::crop_imm(frame, x as u32, y as u32, w as u32, h as u32).to_image();
        let gray = imageops::grayscale(&crop);

        let probabilities = self.emotions.classify(&gray)?;
        let emotion = probabilities
            .iter()
            .position_max_by(|a, b| a.total_cmp(b))
            .unwrap_or(0);

        Ok((emotion, probabilities[emotion]))
    }
}

impl Annotate for EmotionAnnotator {
    fn annotate(&self, mut frame: RgbImage, settings: &Settings, fps: f32) -> Result<Annotated> {
        let faces = self.face_boxes(&frame)?;

        let mut colored = Vec::with_capacity(faces.len());
        for face in faces.iter() {
            let (emotion, probability) = self.dominant_emotion(&frame, face)?;
            colored.push((
                Detection::new(EMOTIONS[emotion], probability, face.bbox),
                FACE_COLOR,
            ));
        }

        // Effects are applied after classification so the crops see the raw frame
        if settings.fancy_boxes {
            vignette(&mut frame);
        }
        if settings.dark_mode {
            darken(&mut frame);
        }

        let marks = layout(&colored, settings, fps);
        paint(&mut frame, &marks, self.font.as_ref());

        Ok(Annotated {
            frame,
            detections: colored.into_iter().map(|(detection, _)| detection).collect(),
        })
    }
}
