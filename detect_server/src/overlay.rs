//! Frame effects and the annotation overlay.
//!
//! Drawing happens in two steps. `layout` turns detections and settings into a list of
//! `Mark`s, `paint` rasterizes them onto the frame.
use common::{Detection, Settings};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_ellipse_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
    filter::gaussian_blur_f32,
    rect::Rect,
};
use rusttype::{Font, Scale};

/// Share of the original brightness kept at the frame border by the vignette.
pub const VIGNETTE_ALPHA: f32 = 0.85;

/// Weight of the dark tint in dark mode.
pub const DARK_TINT_ALPHA: f32 = 0.2;

const DARK_TINT: [u8; 3] = [20, 20, 20];

/// Blur of the vignette mask, equivalent to a 51 px Gaussian kernel.
const VIGNETTE_SIGMA: f32 = 8.0;

/// Height of the label banner drawn above fancy boxes.
const BANNER_HEIGHT: u32 = 20;

const LABEL_SCALE: f32 = 16.0;
const FPS_SCALE: f32 = 22.0;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

/// One drawing primitive of the overlay.
#[derive(Clone, Debug, PartialEq)]
pub enum Mark {
    /// Hollow rectangle with a 2 px border.
    Frame { rect: Rect, color: Rgb<u8> },
    /// Filled rectangle.
    Banner { rect: Rect, color: Rgb<u8> },
    /// Text with its top left corner at `(x, y)`.
    Text {
        x: i32,
        y: i32,
        scale: f32,
        color: Rgb<u8>,
        text: String,
    },
}

/// Darken the frame towards its borders.
pub fn vignette(frame: &mut RgbImage) {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    let mut mask = GrayImage::new(width, height);
    draw_filled_ellipse_mut(
        &mut mask,
        ((width / 2) as i32, (height / 2) as i32),
        (width / 2) as i32,
        (height / 2) as i32,
        Luma([255]),
    );
    let mask = gaussian_blur_f32(&mask, VIGNETTE_SIGMA);

    for (pixel, weight) in frame.pixels_mut().zip(mask.pixels()) {
        let factor = weight[0] as f32 / 255.0 * (1.0 - VIGNETTE_ALPHA) + VIGNETTE_ALPHA;
        for channel in pixel.0.iter_mut() {
            *channel = (*channel as f32 * factor) as u8;
        }
    }
}

/// Blend a dark tint over the whole frame.
pub fn darken(frame: &mut RgbImage) {
    for pixel in frame.pixels_mut() {
        for (channel, tint) in pixel.0.iter_mut().zip(DARK_TINT) {
            let blended =
                tint as f32 * DARK_TINT_ALPHA + *channel as f32 * (1.0 - DARK_TINT_ALPHA);
            *channel = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Plan the overlay for a set of detections, each paired with its box color.
///
/// `fps` is only drawn when enabled in `settings`.
pub fn layout(detections: &[(Detection, Rgb<u8>)], settings: &Settings, fps: f32) -> Vec<Mark> {
    let mut marks = Vec::with_capacity(detections.len() * 3 + 1);

    for (detection, color) in detections {
        let [x, y, w, h] = detection.bbox;
        marks.push(Mark::Frame {
            rect: rect(x, y, w, h),
            color: *color,
        });

        if settings.fancy_boxes {
            marks.push(Mark::Banner {
                rect: rect(x, y - BANNER_HEIGHT as i32, w, BANNER_HEIGHT as i32),
                color: *color,
            });
        }

        if !settings.hide_labels {
            let text = format!("{}: {:.2}", detection.label, detection.confidence);
            marks.push(match settings.fancy_boxes {
                true => Mark::Text {
                    x: x + 5,
                    y: y - BANNER_HEIGHT as i32 + 2,
                    scale: LABEL_SCALE,
                    color: WHITE,
                    text,
                },
                false => Mark::Text {
                    x,
                    y: y - 10 - LABEL_SCALE as i32,
                    scale: LABEL_SCALE,
                    color: *color,
                    text,
                },
            });
        }
    }

    if settings.show_fps {
        marks.push(Mark::Text {
            x: 10,
            y: 30 - FPS_SCALE as i32,
            scale: FPS_SCALE,
            color: if settings.dark_mode { WHITE } else { BLACK },
            text: format!("FPS: {fps:.1}"),
        });
    }

    marks
}

/// Rasterize marks onto the frame.
///
/// Text marks are skipped when no font is available.
pub fn paint(frame: &mut RgbImage, marks: &[Mark], font: Option<&Font<'static>>) {
    for mark in marks {
        match mark {
            Mark::Frame { rect, color } => {
                draw_hollow_rect_mut(frame, *rect, *color);
                if rect.width() > 2 && rect.height() > 2 {
                    let inner = Rect::at(rect.left() + 1, rect.top() + 1)
                        .of_size(rect.width() - 2, rect.height() - 2);
                    draw_hollow_rect_mut(frame, inner, *color);
                }
            }
            Mark::Banner { rect, color } => draw_filled_rect_mut(frame, *rect, *color),
            Mark::Text {
                x,
                y,
                scale,
                color,
                text,
            } => {
                if let Some(font) = font {
                    draw_text_mut(frame, *color, *x, *y, Scale::uniform(*scale), font, text);
                }
            }
        }
    }
}

/// Deterministic, well separated box colors, one per class.
pub fn palette(num_classes: usize) -> Vec<Rgb<u8>> {
    // Golden ratio steps spread neighbouring class ids across the hue circle
    const GOLDEN_RATIO_CONJUGATE: f32 = 0.618_034;

    (0..num_classes)
        .map(|class_id| {
            let hue = (0.42 + class_id as f32 * GOLDEN_RATIO_CONJUGATE).fract();
            let saturation = if class_id % 2 == 0 { 0.85 } else { 0.65 };
            hsv_to_rgb(hue, saturation, 0.95)
        })
        .collect()
}

fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> Rgb<u8> {
    let sector = hue * 6.0;
    let fraction = sector.fract();
    let p = value * (1.0 - saturation);
    let q = value * (1.0 - saturation * fraction);
    let t = value * (1.0 - saturation * (1.0 - fraction));

    let (r, g, b) = match sector as u32 % 6 {
        0 => (value, t, p),
        1 => (q, value, p),
        2 => (p, value, t),
        3 => (p, q, value),
        4 => (t, p, value),
        _ => (value, p, q),
    };

    Rgb([(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8])
}

/// Build a rectangle, degenerate sizes are widened to one pixel.
fn rect(x: i32, y: i32, width: i32, height: i32) -> Rect {
    Rect::at(x, y).of_size(width.max(1) as u32, height.max(1) as u32)
}
