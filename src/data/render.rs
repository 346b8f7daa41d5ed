//! Landmark sketch rendering

use image::{Rgb, RgbImage};

use super::landmarks::Landmarks;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const GREEN: Rgb<u8> = Rgb([0, 128, 0]);
const ORANGE: Rgb<u8> = Rgb([255, 165, 0]);
const BLUE: Rgb<u8> = Rgb([0, 0, 255]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const PURPLE: Rgb<u8> = Rgb([128, 0, 128]);

/// Point ranges of each facial feature and the colour it is drawn in
pub const FEATURES: [(std::ops::Range<usize>, Rgb<u8>); 9] = [
    (0..17, GREEN),   // jaw
    (17..22, ORANGE), // right eyebrow
    (22..27, ORANGE), // left eyebrow
    (27..31, BLUE),   // nose bridge
    (31..36, BLUE),   // nose base
    (36..42, RED),    // right eye
    (42..48, RED),    // left eye
    (48..60, PURPLE), // outer lip
    (60..68, PURPLE), // inner lip
];

/// Number of features drawn; the inner lip is not part of the sketch
const DRAWN_FEATURES: usize = 8;

/// Draw a filled disc, clipped to the image
fn draw_disc(img: &mut RgbImage, cx: i32, cy: i32, radius: i32, color: Rgb<u8>) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let (x, y) = (cx + dx, cy + dy);
            if x >= 0 && y >= 0 && x < w && y < h {
                img.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

/// Clip the segment `from -> to` to `[min, max]` on both axes (Liang-Barsky)
///
/// Returns `None` when the segment misses the box or an endpoint is not finite.
fn clip_segment(from: [f32; 2], to: [f32; 2], min: [f64; 2], max: [f64; 2]) -> Option<([f64; 2], [f64; 2])> {
    if !from.iter().chain(to.iter()).all(|v| v.is_finite()) {
        return None;
    }
    let (x1, y1) = (from[0] as f64, from[1] as f64);
    let (dx, dy) = (to[0] as f64 - x1, to[1] as f64 - y1);

    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    for (p, q) in [
        (-dx, x1 - min[0]),
        (dx, max[0] - x1),
        (-dy, y1 - min[1]),
        (dy, max[1] - y1),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return None;
            }
            t1 = t1.min(r);
        }
    }

    Some((
        [x1 + t0 * dx, y1 + t0 * dy],
        [x1 + t1 * dx, y1 + t1 * dy],
    ))
}

/// Bresenham line with a round pen of `width` pixels
///
/// The segment is clipped to the image grown by the pen radius before stepping.
fn draw_line(img: &mut RgbImage, from: [f32; 2], to: [f32; 2], width: u32, color: Rgb<u8>) {
    let radius = (width.min(i32::MAX as u32) as i32 - 1) / 2;
    let r = radius as f64;
    let max = [img.width() as f64 - 1.0 + r, img.height() as f64 - 1.0 + r];
    let Some((from, to)) = clip_segment(from, to, [-r, -r], max) else {
        return;
    };
    let (x1, y1) = (from[0].round() as i32, from[1].round() as i32);
    let (x2, y2) = (to[0].round() as i32, to[1].round() as i32);

    let dx = (x2 - x1).abs();
    let dy = (y2 - y1).abs();
    let sx = if x1 < x2 { 1 } else { -1 };
    let sy = if y1 < y2 { 1 } else { -1 };
    let mut err = dx - dy;

    let mut x = x1;
    let mut y = y1;

    loop {
        draw_disc(img, x, y, radius, color);

        if x == x2 && y == y2 {
            break;
        }

        let e2 = 2 * err;
        if e2 > -dy {
            err -= dy;
            x += sx;
        }
        if e2 < dx {
            err += dx;
            y += sy;
        }
    }
}

/// Render the landmark sketch of a `width x height` frame
///
/// Each feature is an open polyline on a white background.
pub fn plot_landmarks(width: u32, height: u32, landmarks: &Landmarks, line_width: u32) -> RgbImage {
    let mut img = RgbImage::from_pixel(width, height, BACKGROUND);
    let line_width = line_width.max(1);

    for (range, color) in FEATURES.iter().take(DRAWN_FEATURES) {
        let points = &landmarks.points[range.clone()];
        for pair in points.windows(2) {
            draw_line(&mut img, pair[0], pair[1], line_width, *color);
        }
    }

    img
}
