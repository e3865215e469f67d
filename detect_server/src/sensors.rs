//! Camera capture: the V4L2 device and the shared handle used by all streams.
//!
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use rscam::{Camera, Config};

/// Source of camera frames.
pub trait FrameSource: Send {
    /// Capture the next frame.
    fn read(&mut self) -> Result<RgbImage>;
}

/// Function opening a frame source, called lazily on the first stream request.
pub type SourceOpener = Box<dyn Fn() -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// V4L2 camera delivering MJPG frames.
pub struct V4lCamera {
    cam: Camera,
}

impl V4lCamera {
    /// Open a video device on a Linux machine.
    ///
    /// Without explicit values, the highest resolution and frame rate the device supports
    /// for MJPG are used.
    pub fn open(
        device_name: &str,
        resolution: Option<(u32, u32)>,
        frame_rate: Option<(u32, u32)>,
    ) -> Result<Self> {
        let format = b"MJPG";
        let mut cam = Camera::new(device_name)
            .with_context(|| format!("failed to open camera {device_name}"))?;

        log::info!("Using camera {}", device_name);

        let resolution = match resolution {
            Some(resolution) => resolution,
            None => get_max_resolution(&cam, format)?,
        };
        let frame_rate = match frame_rate {
            Some(frame_rate) => frame_rate,
            None => get_max_frame_rate(&cam, format, resolution)?,
        };
        log::debug!(
            "Camera resolution {:?}, interval {:?}",
            resolution,
            frame_rate
        );

        cam.start(&Config {
            interval: frame_rate,
            resolution,
            format,
            ..Default::default()
        })
        .context("failed to start capturing")?;

        Ok(Self { cam })
    }

    /// Opener for `device_name`, for use with `SharedCamera`.
    pub fn opener(
        device_name: impl Into<String>,
        resolution: Option<(u32, u32)>,
        frame_rate: Option<(u32, u32)>,
    ) -> SourceOpener {
        let device_name = device_name.into();
        Box::new(move || {
            let camera = V4lCamera::open(&device_name, resolution, frame_rate)?;
            Ok(Box::new(camera) as Box<dyn FrameSource>)
        })
    }
}

impl FrameSource for V4lCamera {
    fn read(&mut self) -> Result<RgbImage> {
        let frame = self.cam.capture().context("failed to capture frame")?;
        let image: RgbImage =
            turbojpeg::decompress_image(&frame[..]).context("failed to decompress frame")?;
        Ok(image)
    }
}

/// The single capture device of the process.
///
/// The device is opened on first use and stays open until `release`. Reads are serialized
/// by a lock.
pub struct SharedCamera {
    opener: SourceOpener,
    source: Mutex<Option<Box<dyn FrameSource>>>,
}

impl SharedCamera {
    pub fn new(opener: SourceOpener) -> Self {
        Self {
            opener,
            source: Mutex::new(None),
        }
    }

    /// Open the device unless it is open already.
    pub fn ensure_open(&self) -> Result<()> {
        let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        if source.is_none() {
            *source = Some((self.opener)()?);
        }
        Ok(())
    }

    /// Read one frame under the camera lock.
    pub fn read(&self) -> Result<RgbImage> {
        let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        source
            .as_mut()
            .ok_or_else(|| anyhow!("camera is not open"))?
            .read()
    }

    pub fn is_open(&self) -> bool {
        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Close the device.
    pub fn release(&self) {
        if self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            log::info!("Camera released");
        }
    }
}

/// Parse a resolution given as `<width>x<height>`, e.g. `1280x720`.
pub fn parse_resolution(value: &str) -> Result<(u32, u32)> {
    let (width, height) = value
        .split_once('x')
        .ok_or_else(|| anyhow!("expected <width>x<height>, got `{value}`"))?;
    let resolution = (width.trim().parse::<u32>()?, height.trim().parse::<u32>()?);
    if resolution.0 == 0 || resolution.1 == 0 {
        return Err(anyhow!("resolution must not be empty"));
    }
    Ok(resolution)
}

/// Frame interval `(1, fps)` for a frame rate given in frames per second.
pub fn parse_frame_rate(value: &str) -> Result<(u32, u32)> {
    let fps: u32 = value.trim().parse()?;
    if fps == 0 {
        return Err(anyhow!("frame rate must be positive"));
    }
    Ok((1, fps))
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32)> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .into_iter()
            // Get the highest resolution in terms of number of pixels
            .max_by_key(|res| res.0 * res.1),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| anyhow!("no resolution found"))
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(cam: &Camera, format: &[u8], resolution: (u32, u32)) -> Result<(u32, u32)> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        // Intervals are (numerator, denominator) of seconds per frame
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .into_iter()
            .max_by(|a, b| (a.1 * b.0).cmp(&(b.1 * a.0))),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| anyhow!("no frame rate found"))
}

#[cfg(test)]
mod test {

    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    struct Blank;

    impl FrameSource for Blank {
        fn read(&mut self) -> Result<RgbImage> {
            Ok(RgbImage::new(4, 3))
        }
    }

    #[test]
    fn opens_lazily_and_once() -> Result<()> {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        let camera = SharedCamera::new(Box::new(move || -> Result<Box<dyn FrameSource>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Blank) as Box<dyn FrameSource>)
        }));

        assert!(!camera.is_open());
        assert!(camera.read().is_err());

        camera.ensure_open()?;
        camera.ensure_open()?;
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(camera.read()?.dimensions(), (4, 3));

        camera.release();
        assert!(!camera.is_open());

        Ok(())
    }

    #[test]
    fn failed_open_leaves_camera_closed() {
        let camera = SharedCamera::new(Box::new(|| -> Result<Box<dyn FrameSource>> {
            Err(anyhow!("no such device"))
        }));

        assert!(camera.ensure_open().is_err());
        assert!(!camera.is_open());
    }

    #[test]
    fn camera_options_are_parsed() -> Result<()> {
        assert_eq!(parse_resolution("1280x720")?, (1280, 720));
        assert!(parse_resolution("1280").is_err());
        assert!(parse_resolution("0x720").is_err());

        assert_eq!(parse_frame_rate("30")?, (1, 30));
        assert!(parse_frame_rate("0").is_err());
        assert!(parse_frame_rate("fast").is_err());

        Ok(())
    }

    #[test]
    fn get_cam_info_if_available() -> Result<()> {
        let cam_name = "/dev/video0";
        let cam = Camera::new(cam_name);

        match cam {
            Err(err) => println!("Could not initialize camera (maybe non available): {err}"),
            Ok(cam) => {
                let format = b"MJPG";
                match get_max_resolution(&cam, format) {
                    Ok(resolution) => {
                        println!("Selected resolution: {resolution:?}");
                        let frame_rate = get_max_frame_rate(&cam, format, resolution);
                        println!("Selected frame interval: {frame_rate:?}");
                    }
                    Err(err) => println!("Camera does not support MJPG: {err}"),
                }
            }
        }

        Ok(())
    }
}
