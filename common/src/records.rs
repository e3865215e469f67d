//! JSON records exchanged over the HTTP API.
//!
use serde::{Deserialize, Serialize};

/// One detected object of a processed frame.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Detection {
    /// Name of the detected class (or emotion, for the emotion stream).
    #[serde(rename = "class")]
    pub label: String,
    pub confidence: f32,
    /// `[x, y, width, height]` in pixels, origin at the top left corner.
    #[serde(rename = "box")]
    pub bbox: [i32; 4],
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: [i32; 4]) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }
}

/// Overlay and detection toggles read on every frame.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Settings {
    pub show_fps: bool,
    pub dark_mode: bool,
    pub fancy_boxes: bool,
    pub confidence_threshold: f32,
    pub hide_labels: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            show_fps: false,
            dark_mode: false,
            fancy_boxes: false,
            confidence_threshold: 0.5,
            hide_labels: false,
        }
    }
}

/// Partial settings update.
///
/// Every field is optional and keys which are not a setting name are dropped
/// during deserialization.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub show_fps: Option<bool>,
    pub dark_mode: Option<bool>,
    pub fancy_boxes: Option<bool>,
    pub confidence_threshold: Option<f32>,
    pub hide_labels: Option<bool>,
}

impl Settings {
    /// Merge a partial update into these settings.
    ///
    /// The confidence threshold is clamped into `[0, 1]`; a NaN threshold is
    /// ignored.
    pub fn merge(&mut self, patch: SettingsPatch) {
        if let Some(show_fps) = patch.show_fps {
            self.show_fps = show_fps;
        }
        if let Some(dark_mode) = patch.dark_mode {
            self.dark_mode = dark_mode;
        }
        if let Some(fancy_boxes) = patch.fancy_boxes {
            self.fancy_boxes = fancy_boxes;
        }
        if let Some(threshold) = patch.confidence_threshold {
            if !threshold.is_nan() {
                self.confidence_threshold = threshold.clamp(0.0, 1.0);
            }
        }
        if let Some(hide_labels) = patch.hide_labels {
            self.hide_labels = hide_labels;
        }
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn detection_uses_api_field_names() -> Result<(), serde_json::Error> {
        let detection = Detection::new("person", 0.75, [10, 20, 30, 40]);
        let json = serde_json::to_value(&detection)?;

        assert_eq!(json["class"], "person");
        assert_eq!(json["box"], serde_json::json!([10, 20, 30, 40]));

        Ok(())
    }

    #[test]
    fn patch_ignores_unknown_keys() -> Result<(), serde_json::Error> {
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"hide_labels": true, "turbo": 11}"#)?;

        let mut settings = Settings::default();
        settings.merge(patch);

        assert_eq!(
            settings,
            Settings {
                hide_labels: true,
                ..Settings::default()
            }
        );

        Ok(())
    }

    #[test]
    fn threshold_is_clamped() {
        let mut settings = Settings::default();

        settings.merge(SettingsPatch {
            confidence_threshold: Some(1.7),
            ..Default::default()
        });
        assert_eq!(settings.confidence_threshold, 1.0);

        settings.merge(SettingsPatch {
            confidence_threshold: Some(-0.2),
            ..Default::default()
        });
        assert_eq!(settings.confidence_threshold, 0.0);

        settings.merge(SettingsPatch {
            confidence_threshold: Some(f32::NAN),
            ..Default::default()
        });
        assert_eq!(settings.confidence_threshold, 0.0);
    }
}
