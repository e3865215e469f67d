//! Model artifacts: download on first run and loading at startup.
//!
use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use rusttype::Font;

use crate::{
    emotion::EmotionAnnotator,
    nn::{FerPlusModel, UltrafaceModel, YoloModel},
    processor::FrameProcessor,
};

/// A file fetched from a fixed URL into the model directory.
#[derive(Clone, Copy, Debug)]
pub struct Artifact {
    pub file_name: &'static str,
    pub url: &'static str,
}

pub const DETECTOR_WEIGHTS: Artifact = Artifact {
    file_name: "yolov8n.onnx",
    url: "https://github.com/ultralytics/assets/releases/download/v8.2.0/yolov8n.onnx",
};

pub const DETECTOR_LABELS: Artifact = Artifact {
    file_name: "coco.names",
    url: "https://raw.githubusercontent.com/pjreddie/darknet/master/data/coco.names",
};

pub const LABEL_FONT: Artifact = Artifact {
    file_name: "UbuntuMono-Regular.ttf",
    url: "https://github.com/google/fonts/raw/main/ufl/ubuntumono/UbuntuMono-Regular.ttf",
};

pub const FACE_DETECTOR: Artifact = Artifact {
    file_name: "version-RFB-320.onnx",
    url: "https://github.com/onnx/models/raw/5faef4c33eba0395177850e1e31c4a6a9e634c82/vision/body_analysis/ultraface/models/version-RFB-320.onnx",
};

pub const EMOTION_CLASSIFIER: Artifact = Artifact {
    file_name: "emotion-ferplus-8.onnx",
    url: "https://github.com/onnx/models/raw/5faef4c33eba0395177850e1e31c4a6a9e634c82/vision/body_analysis/emotion_ferplus/model/emotion-ferplus-8.onnx",
};

/// Minimum face confidence of the emotion stream.
const MIN_FACE_CONFIDENCE: f32 = 0.5;

/// Loaded models, ready for annotating frames.
pub struct Models {
    pub objects: FrameProcessor,
    pub emotions: Option<EmotionAnnotator>,
}

/// Make sure all artifacts are present in `model_dir` and load them.
///
/// Artifacts are only downloaded when missing. With `emotions`, the face detector and the
/// emotion classifier are loaded as well.
pub async fn initialize(model_dir: &Path, emotions: bool) -> Result<Models> {
    fs::create_dir_all(model_dir)
        .with_context(|| format!("failed to create {}", model_dir.display()))?;

    let client = Client::new();
    let weights = ensure_artifact(&client, model_dir, &DETECTOR_WEIGHTS).await?;
    let labels = ensure_artifact(&client, model_dir, &DETECTOR_LABELS).await?;
    let font = ensure_artifact(&client, model_dir, &LABEL_FONT).await?;
    let emotion_paths = match emotions {
        true => Some((
            ensure_artifact(&client, model_dir, &FACE_DETECTOR).await?,
            ensure_artifact(&client, model_dir, &EMOTION_CLASSIFIER).await?,
        )),
        false => None,
    };

    log::info!("Loading models...");
    let models = tokio::task::spawn_blocking(move || -> Result<Models> {
        let font = load_font(&font)?;
        let labels = read_labels(&labels)?;
        log::info!("Read {} labels", labels.len());

        let objects = FrameProcessor::new(
            Box::new(YoloModel::load(&weights)?),
            labels,
            Some(font.clone()),
        );

        let emotions = match emotion_paths {
            Some((faces, classifier)) => Some(EmotionAnnotator::new(
                Box::new(UltrafaceModel::load(&faces, MIN_FACE_CONFIDENCE)?),
                Box::new(FerPlusModel::load(&classifier)?),
                Some(font),
            )),
            None => None,
        };

        Ok(Models { objects, emotions })
    })
    .await??;
    log::info!("Models initialized successfully");

    Ok(models)
}

/// Path of `artifact` in `dir`, downloading it first if it does not exist.
pub async fn ensure_artifact(client: &Client, dir: &Path, artifact: &Artifact) -> Result<PathBuf> {
    let path = dir.join(artifact.file_name);
    if path.exists() {
        log::info!("{} already exists", path.display());
        return Ok(path);
    }

    log::info!("Downloading {}...", path.display());
    download_file(client, artifact.url, &path)
        .await
        .with_context(|| format!("failed to download {}", artifact.url))?;
    log::info!("Downloaded {}", path.display());

    Ok(path)
}

/// Download a file from a URL to a given filepath.
///
/// The content is written to a temporary file next to `filepath` and renamed when complete.
pub async fn download_file(client: &Client, url: &str, filepath: &Path) -> Result<()> {
    let resp = client.get(url).send().await?.error_for_status()?;
    let content = resp.bytes().await?;

    let partial = filepath.with_extension("part");
    fs::write(&partial, &content)?;
    if let Err(e) = fs::rename(&partial, filepath) {
        fs::remove_file(&partial).ok();
        return Err(e.into());
    }

    Ok(())
}

/// Read class labels, one per line.
pub fn read_labels(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read labels {}", path.display()))?;
    Ok(parse_labels(&content))
}

fn parse_labels(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Load a TrueType font for the overlay text.
pub fn load_font(path: &Path) -> Result<Font<'static>> {
    let data =
        fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
    Font::try_from_vec(data).ok_or_else(|| anyhow!("invalid font file {}", path.display()))
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn labels_are_trimmed() {
        let labels = parse_labels("person\r\nbicycle \n\n  car\n");
        assert_eq!(labels, vec!["person", "bicycle", "car"]);
    }

    #[tokio::test]
    async fn existing_artifact_is_not_downloaded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("coco.names"), "person\n")?;

        // Nothing listens on the discard port, a download attempt would fail
        let artifact = Artifact {
            file_name: "coco.names",
            url: "http://127.0.0.1:9/coco.names",
        };
        let path = ensure_artifact(&Client::new(), dir.path(), &artifact).await?;

        assert_eq!(read_labels(&path)?, vec!["person"]);

        Ok(())
    }

    #[tokio::test]
    async fn failed_download_leaves_no_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let artifact = Artifact {
            file_name: "weights.onnx",
            url: "http://127.0.0.1:9/weights.onnx",
        };

        assert!(ensure_artifact(&Client::new(), dir.path(), &artifact)
            .await
            .is_err());
        assert!(!dir.path().join("weights.onnx").exists());
        assert!(!dir.path().join("weights.part").exists());

        Ok(())
    }

    #[test]
    fn invalid_font_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.ttf");
        fs::write(&path, b"not a font")?;

        assert!(load_font(&path).is_err());

        Ok(())
    }
}
