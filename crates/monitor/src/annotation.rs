//! Overlay rendering for the preview stream.

use anyhow::{Result, anyhow, ensure};
use image::{DynamicImage, ImageBuffer, Rgba, codecs::jpeg::JpegEncoder};
use pose_core::{LandmarkId, LandmarkSet, PostureLabel};
use video_ingest::{Frame, FrameFormat};

const LANDMARK_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
const SPINE_COLOR: Rgba<u8> = Rgba([255, 200, 0, 255]);
const BAR_COLOR: Rgba<u8> = Rgba([0, 0, 0, 180]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const VISIBILITY_THRESHOLD: f32 = 0.5;

type Canvas = ImageBuffer<Rgba<u8>, Vec<u8>>;

/// What to draw on top of a frame.
pub struct Overlay<'a> {
    pub landmarks: Option<&'a LandmarkSet>,
    pub posture: PostureLabel,
    pub emotion: &'a str,
    pub frame_number: u64,
}

/// Draw landmarks, the spine axis and a status bar onto a copy of `frame`.
pub fn annotate_frame(frame: &Frame, overlay: &Overlay<'_>) -> Result<Frame> {
    ensure!(
        frame.format == FrameFormat::Bgr8 && frame.data.len() == frame.expected_len(),
        "frame payload does not match {}x{} BGR",
        frame.width,
        frame.height
    );
    let width = frame.width as u32;
    let height = frame.height as u32;
    let mut image = Canvas::from_vec(width, height, bgr_to_rgba(&frame.data))
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    if let Some(landmarks) = overlay.landmarks {
        draw_skeleton(&mut image, landmarks);
    }

    let status = format!(
        "{:06} {} {}",
        overlay.frame_number,
        overlay.posture.as_str(),
        overlay.emotion
    );
    let bar_width = (status.chars().count() as i32 * 6 + 4).min(width as i32);
    let bar_y = (height as i32 - 12).max(0);
    fill_rect(&mut image, 0, bar_y, bar_width, bar_y + 9, BAR_COLOR);
    draw_label(&mut image, 2, bar_y + 1, &status, TEXT_COLOR);

    Ok(Frame {
        data: rgba_to_bgr(image.as_raw()),
        width: frame.width,
        height: frame.height,
        timestamp_ms: frame.timestamp_ms,
        captured_at: frame.captured_at,
        format: FrameFormat::Bgr8,
    })
}

/// JPEG-encode a BGR frame for streaming consumers.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let image = Canvas::from_vec(
        frame.width as u32,
        frame.height as u32,
        bgr_to_rgba(&frame.data),
    )
    .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;
    let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

fn draw_skeleton(image: &mut Canvas, landmarks: &LandmarkSet) {
    let width = image.width() as f32;
    let height = image.height() as f32;
    let to_px = |id: LandmarkId| {
        let p = landmarks.get(id);
        ((p.x * width).round() as i32, (p.y * height).round() as i32)
    };

    let shoulders = midpoint(to_px(LandmarkId::LeftShoulder), to_px(LandmarkId::RightShoulder));
    let hips = midpoint(to_px(LandmarkId::LeftHip), to_px(LandmarkId::RightHip));
    draw_segment(image, shoulders, hips, SPINE_COLOR);

    for point in landmarks.points() {
        if !point.is_visible(VISIBILITY_THRESHOLD) {
            continue;
        }
        let x = (point.x * width).round() as i32;
        let y = (point.y * height).round() as i32;
        fill_rect(image, x - 2, y - 2, x + 2, y + 2, LANDMARK_COLOR);
    }
}

fn midpoint(a: (i32, i32), b: (i32, i32)) -> (i32, i32) {
    ((a.0 + b.0) / 2, (a.1 + b.1) / 2)
}

fn draw_segment(image: &mut Canvas, from: (i32, i32), to: (i32, i32), color: Rgba<u8>) {
    let steps = (to.0 - from.0).abs().max((to.1 - from.1).abs()).max(1);
    for step in 0..=steps {
        let t = step as f32 / steps as f32;
        let x = from.0 as f32 + (to.0 - from.0) as f32 * t;
        let y = from.1 as f32 + (to.1 - from.1) as f32 * t;
        let (x, y) = (x.round() as i32, y.round() as i32);
        fill_rect(image, x, y, x + 1, y + 1, color);
    }
}

fn bgr_to_rgba(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() / 3 * 4);
    for chunk in input.chunks_exact(3) {
        output.extend_from_slice(&[chunk[2], chunk[1], chunk[0], 255]);
    }
    output
}

fn rgba_to_bgr(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() / 4 * 3);
    for chunk in input.chunks_exact(4) {
        output.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    output
}

/// Alpha-blends `color` over the clipped rectangle.
fn fill_rect(image: &mut Canvas, left: i32, top: i32, right: i32, bottom: i32, color: Rgba<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 || right < 0 || bottom < 0 || left >= width || top >= height {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    let alpha = color[3] as u16;
    for y in top..=bottom {
        for x in left..=right {
            let pixel = image.get_pixel_mut(x as u32, y as u32);
            for channel in 0..3 {
                let blended = (color[channel] as u16 * alpha
                    + pixel[channel] as u16 * (255 - alpha))
                    / 255;
                pixel[channel] = blended as u8;
            }
        }
    }
}

fn draw_label(image: &mut Canvas, mut x: i32, y: i32, text: &str, color: Rgba<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    let px = x + col;
                    if (pattern >> (4 - col)) & 1 == 1 && px >= 0 && px < width {
                        *image.get_pixel_mut(px as u32, py as u32) = color;
                    }
                }
            }
        }
        x += 6;
    }
}

/// 5x7 bitmap glyphs, one byte per row, most significant of the low five
/// bits on the left.
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x19, 0x15, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1E, 0x01, 0x01, 0x0E, 0x01, 0x01, 0x1E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ' ' => [0x00; 7],
        _ => return None,
    };
    Some(rows)
}
