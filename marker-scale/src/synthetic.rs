//! In-memory test scenes: anti-aliased square markers (dark frame holding a 2x2 grid of
//! bright sub-squares) on a light background.

use image::{Rgb, RgbImage};

use crate::geometry::Coord;

pub const BACKGROUND: u8 = 240;
pub const INK: u8 = 20;
pub const PAPER: u8 = 235;

const SUPERSAMPLE: u32 = 4;

#[derive(Clone, Copy, Debug)]
pub struct MarkerSpec {
    pub cx: f64,
    pub cy: f64,
    pub side: f64,
    pub angle_deg: f64,
}

impl MarkerSpec {
    pub fn new(cx: f64, cy: f64, side: f64, angle_deg: f64) -> MarkerSpec {
        MarkerSpec {
            cx,
            cy,
            side,
            angle_deg,
        }
    }

    /// Intensity at a continuous image position, `None` outside the marker.
    fn sample(&self, px: f64, py: f64) -> Option<u8> {
        let (s, c) = self.angle_deg.to_radians().sin_cos();
        let (dx, dy) = (px - self.cx, py - self.cy);
        let half = self.side / 2.0;
        let u = dx * c + dy * s + half;
        let v = -dx * s + dy * c + half;
        if !(0.0..self.side).contains(&u) || !(0.0..self.side).contains(&v) {
            return None;
        }
        let in_cell = |t: f64| {
            let f = t / self.side;
            (0.15..0.45).contains(&f) || (0.55..0.85).contains(&f)
        };
        Some(if in_cell(u) && in_cell(v) { PAPER } else { INK })
    }

    /// Outer corners in image coordinates.
    pub fn corners(&self) -> [Coord; 4] {
        let (s, c) = self.angle_deg.to_radians().sin_cos();
        let half = self.side / 2.0;
        [(-half, -half), (half, -half), (half, half), (-half, half)]
            .map(|(u, v)| Coord(self.cx + u * c - v * s, self.cy + u * s + v * c))
    }
}

/// Render markers over a uniform background with `SUPERSAMPLE^2` samples per pixel.
pub fn render_scene(width: u32, height: u32, markers: &[MarkerSpec]) -> RgbImage {
    let n = SUPERSAMPLE * SUPERSAMPLE;
    RgbImage::from_fn(width, height, |x, y| {
        let mut acc = 0u32;
        for i in 0..SUPERSAMPLE {
            for j in 0..SUPERSAMPLE {
                let px = x as f64 + (i as f64 + 0.5) / SUPERSAMPLE as f64;
                let py = y as f64 + (j as f64 + 0.5) / SUPERSAMPLE as f64;
                let v = markers
                    .iter()
                    .find_map(|m| m.sample(px, py))
                    .unwrap_or(BACKGROUND);
                acc += v as u32;
            }
        }
        let v = ((acc + n / 2) / n) as u8;
        Rgb([v, v, v])
    })
}

/// Uniform background with a smooth horizontal brightness ramp and no dark regions.
pub fn blank_scene(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, _| {
        let v = 200 + (40 * x / width.max(1)) as u8;
        Rgb([v, v, v])
    })
}

#[cfg(test)]
mod tests {
    use super::{render_scene, MarkerSpec, BACKGROUND, INK, PAPER};

    #[test]
    fn test_render_layout() {
        let img = render_scene(200, 200, &[MarkerSpec::new(100.0, 100.0, 100.0, 0.0)]);
        assert_eq!(img.get_pixel(10, 10)[0], BACKGROUND);
        // frame
        assert_eq!(img.get_pixel(55, 100)[0], INK);
        // first sub-square spans 65..95
        assert_eq!(img.get_pixel(80, 80)[0], PAPER);
        // gap between sub-squares
        assert_eq!(img.get_pixel(100, 80)[0], INK);
        assert_eq!(img.get_pixel(49, 100)[0], BACKGROUND);
        assert_eq!(img.get_pixel(50, 100)[0], INK);
    }
}
