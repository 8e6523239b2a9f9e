use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};

use super::FrameSource;

const DEFAULT_FRAMES: u64 = 30;
const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 48;

/// Deterministic in-memory video for tests and dry runs.
///
/// `stub://<name>?frames=N&width=W&height=H&report_total=false`. Each frame is
/// a dark background with a bright square that drifts to the right.
pub struct SyntheticVideo {
    frames: u64,
    width: u32,
    height: u32,
    report_total: bool,
    produced: u64,
}

impl SyntheticVideo {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("not a synthetic video uri: {}", uri))?;
        let mut video = Self {
            frames: DEFAULT_FRAMES,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            report_total: true,
            produced: 0,
        };
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(video);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub parameter '{}'", pair))?;
            match key {
                "frames" => video.frames = parse_num(key, value)?,
                "width" => video.width = parse_num::<u32>(key, value)?.max(8),
                "height" => video.height = parse_num::<u32>(key, value)?.max(8),
                "report_total" => video.report_total = value != "false",
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        Ok(video)
    }

    fn render(&self, index: u64) -> RgbImage {
        let mut image = RgbImage::from_pixel(self.width, self.height, Rgb([20, 20, 24]));
        let side = (self.width.min(self.height) / 3).max(2);
        let travel = (self.width - side) as u64;
        let x0 = if travel == 0 { 0 } else { (index % travel) as u32 };
        let y0 = (self.height - side) / 2;
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                image.put_pixel(x, y, Rgb([230, 220, 200]));
            }
        }
        image
    }
}

impl FrameSource for SyntheticVideo {
    fn total_frames(&self) -> Option<u64> {
        self.report_total.then_some(self.frames)
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.produced >= self.frames {
            return Ok(None);
        }
        let frame = self.render(self.produced);
        self.produced += 1;
        Ok(Some(frame))
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("stub parameter '{}' must be a number", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_parameters() {
        let video = SyntheticVideo::from_uri("stub://clip?frames=5&width=32&report_total=false").unwrap();
        assert_eq!(video.total_frames(), None);
        assert_eq!(video.width, 32);
        assert!(SyntheticVideo::from_uri("stub://clip?fps=5").is_err());
    }

    #[test]
    fn yields_exactly_the_requested_frames() {
        let mut video = SyntheticVideo::from_uri("stub://clip?frames=3").unwrap();
        let mut count = 0;
        while let Some(frame) = video.next_frame().unwrap() {
            assert_eq!(frame.dimensions(), (DEFAULT_WIDTH, DEFAULT_HEIGHT));
            count += 1;
        }
        assert_eq!(count, 3);
    }
}
