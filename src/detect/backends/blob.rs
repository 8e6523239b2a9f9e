use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

use crate::detect::result::DetectedRegion;
use crate::model::BoundingBox;

/// Longest side used for blob analysis; larger images are downscaled first.
const ANALYSIS_MAX_SIDE: u32 = 512;
const BLUR_SIGMA: f32 = 1.1;
const MIN_SCORE: f32 = 0.4;
const MAX_SCORE: f32 = 0.9;
const FALLBACK_LABEL: &str = "object";

/// Full-frame region used when no blob can be extracted.
pub fn full_frame_region(width: u32, height: u32) -> DetectedRegion {
    DetectedRegion::new(
        BoundingBox::full_frame(width, height),
        FALLBACK_LABEL,
        MIN_SCORE,
    )
}

/// Bounding box of the largest contiguous foreground blob.
///
/// Foreground is separated with an Otsu threshold over a blurred grayscale copy.
/// The score is the blob's share of the frame, clamped to [0.4, 0.9].
pub fn largest_blob(image: &RgbImage) -> Option<DetectedRegion> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }

    let gray = imageops::grayscale(image);
    let scale = (ANALYSIS_MAX_SIDE as f32 / width.max(height) as f32).min(1.0);
    let gray = if scale < 1.0 {
        let w = ((width as f32 * scale).round() as u32).max(1);
        let h = ((height as f32 * scale).round() as u32).max(1);
        imageops::resize(&gray, w, h, FilterType::Triangle)
    } else {
        gray
    };
    let blurred = imageops::blur(&gray, BLUR_SIGMA);
    let threshold = otsu_threshold(&blurred);
    let (area, (x0, y0, x1, y1)) = largest_component(&blurred, threshold)?;

    let (aw, ah) = blurred.dimensions();
    let sx = width as f32 / aw as f32;
    let sy = height as f32 / ah as f32;
    let bbox = BoundingBox::new(
        x0 as f32 * sx,
        y0 as f32 * sy,
        (x1 + 1) as f32 * sx,
        (y1 + 1) as f32 * sy,
    )
    .ok()?;
    let ratio = area as f32 / (aw as f32 * ah as f32);
    Some(DetectedRegion::new(
        bbox,
        FALLBACK_LABEL,
        ratio.clamp(MIN_SCORE, MAX_SCORE),
    ))
}

fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in gray.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 0;
    }
    let sum_all: f64 = histogram
        .iter()
        .enumerate()
        .map(|(level, &count)| level as f64 * count as f64)
        .sum();

    let mut sum_bg = 0.0f64;
    let mut weight_bg = 0u64;
    let mut best_threshold = 0usize;
    let mut best_variance = 0.0f64;
    for (level, &count) in histogram.iter().enumerate() {
        weight_bg += count;
        if weight_bg == 0 {
            continue;
        }
        let weight_fg = total - weight_bg;
        if weight_fg == 0 {
            break;
        }
        sum_bg += level as f64 * count as f64;
        let mean_bg = sum_bg / weight_bg as f64;
        let mean_fg = (sum_all - sum_bg) / weight_fg as f64;
        let between = weight_bg as f64 * weight_fg as f64 * (mean_bg - mean_fg).powi(2);
        if between > best_variance {
            best_variance = between;
            best_threshold = level;
        }
    }
    best_threshold as u8
}

/// Largest 4-connected component of pixels above `threshold`: `(area, (min_x, min_y, max_x, max_y))`.
fn largest_component(gray: &GrayImage, threshold: u8) -> Option<(usize, (u32, u32, u32, u32))> {
    let width = gray.width() as usize;
    let height = gray.height() as usize;
    let foreground: Vec<bool> = gray.pixels().map(|p| p.0[0] > threshold).collect();
    let mut visited = vec![false; width * height];
    let mut stack = Vec::new();
    let mut best: Option<(usize, (u32, u32, u32, u32))> = None;

    for start in 0..width * height {
        if !foreground[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);

        let mut area = 0usize;
        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        while let Some(idx) = stack.pop() {
            let x = idx % width;
            let y = idx / width;
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            let neighbors = [
                (x > 0).then(|| idx - 1),
                (x + 1 < width).then(|| idx + 1),
                (y > 0).then(|| idx - width),
                (y + 1 < height).then(|| idx + width),
            ];
            for next in neighbors.into_iter().flatten() {
                if foreground[next] && !visited[next] {
                    visited[next] = true;
                    stack.push(next);
                }
            }
        }

        if best.map_or(true, |(best_area, _)| area > best_area) {
            best = Some((
                area,
                (min_x as u32, min_y as u32, max_x as u32, max_y as u32),
            ));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn square_on_black(size: u32, from: u32, to: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if (from..to).contains(&x) && (from..to).contains(&y) {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    #[test]
    fn finds_bright_square() {
        let image = square_on_black(100, 30, 60);
        let region = largest_blob(&image).expect("blob");
        assert_eq!(region.label, "object");
        assert!(region.bbox.x1 >= 24.0 && region.bbox.x1 <= 30.0);
        assert!(region.bbox.y1 >= 24.0 && region.bbox.y1 <= 30.0);
        assert!(region.bbox.x2 >= 60.0 && region.bbox.x2 <= 66.0);
        assert!(region.bbox.y2 >= 60.0 && region.bbox.y2 <= 66.0);
        assert!(region.score >= MIN_SCORE && region.score <= MAX_SCORE);
    }

    #[test]
    fn picks_largest_of_two_blobs() {
        let image = RgbImage::from_fn(120, 60, |x, y| {
            let small = (5..15).contains(&x) && (5..15).contains(&y);
            let large = (50..110).contains(&x) && (10..50).contains(&y);
            if small || large {
                Rgb([240, 240, 240])
            } else {
                Rgb([10, 10, 10])
            }
        });
        let region = largest_blob(&image).expect("blob");
        assert!(region.bbox.x1 >= 40.0);
        assert!(region.bbox.x2 <= 120.0);
    }

    #[test]
    fn black_frame_has_no_blob() {
        let image = RgbImage::new(10, 10);
        assert!(largest_blob(&image).is_none());
    }

    #[test]
    fn large_images_are_scaled_back_to_pixel_space() {
        let image = RgbImage::from_fn(1024, 1024, |x, y| {
            if (256..768).contains(&x) && (256..768).contains(&y) {
                Rgb([200, 200, 200])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let region = largest_blob(&image).expect("blob");
        assert!(region.bbox.x1 >= 240.0 && region.bbox.x1 <= 258.0);
        assert!(region.bbox.x2 >= 766.0 && region.bbox.x2 <= 786.0);
    }

    #[test]
    fn full_frame_region_covers_image() {
        let region = full_frame_region(10, 20);
        assert_eq!(region.bbox, BoundingBox::full_frame(10, 20));
        assert_eq!(region.score, MIN_SCORE);
    }
}
