use image::imageops::{self, FilterType};
use image::{ImageBuffer, Pixel};
use slog::o;
use slog::Drain;
use slog::FnValue;
use slog::Logger;
use std::time::Instant;

use crate::geometry::Region;

pub struct ImageUtil {}
impl ImageUtil {
    /// Copy out `region`, clipped to the image frame.
    pub fn crop<P>(image: &ImageBuffer<P, Vec<P::Subpixel>>, region: &Region) -> ImageBuffer<P, Vec<P::Subpixel>>
    where
        P: Pixel + 'static,
        P::Subpixel: 'static,
    {
        let r = region.clamp_to(image.width(), image.height());
        if r.is_empty() {
            return ImageBuffer::new(0, 0);
        }
        imageops::crop_imm(image, r.x as u32, r.y as u32, r.w as u32, r.h as u32).to_image()
    }

    /// Resize by a uniform factor; factors close to 1 return a copy.
    pub fn rescale<P>(image: &ImageBuffer<P, Vec<P::Subpixel>>, scale: f64) -> ImageBuffer<P, Vec<P::Subpixel>>
    where
        P: Pixel + 'static,
        P::Subpixel: 'static,
    {
        if (scale - 1.0).abs() < 1e-9 {
            return image.clone();
        }
        let w = ((image.width() as f64 * scale).round() as u32).max(1);
        let h = ((image.height() as f64 * scale).round() as u32).max(1);
        imageops::resize(image, w, h, FilterType::Triangle)
    }
}

/// Seconds since `tick`, millisecond resolution.
pub fn elapsed_secs(tick: &Instant) -> f64 {
    tick.elapsed().as_millis() as f64 / 1000.0
}

/// Terminal logger behind an async drain; every record carries its source location.
pub fn set_log_config() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(
        drain,
        o!("place" =>
         FnValue(move |info| {
             format!("{}:{} {}",
                     info.file(),
                     info.line(),
                     info.module(),
                     )
         })
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::{set_log_config, ImageUtil};
    use crate::geometry::Region;
    use image::{GrayImage, Luma};
    use slog::info;

    #[test]
    fn test_crop_clips_to_frame() {
        let log = set_log_config();
        let img = GrayImage::from_fn(20, 10, |x, y| Luma([(x + y) as u8]));
        let crop = ImageUtil::crop(&img, &Region::new(15, -5, 10, 10));
        info!(log, "crop {:?}", crop.dimensions());
        assert_eq!(crop.dimensions(), (5, 5));
        assert_eq!(crop.get_pixel(0, 0)[0], 15);
        let empty = ImageUtil::crop(&img, &Region::new(30, 30, 5, 5));
        assert_eq!(empty.dimensions(), (0, 0));
    }

    #[test]
    fn test_rescale() {
        let img = GrayImage::from_pixel(100, 50, Luma([90]));
        let small = ImageUtil::rescale(&img, 0.8);
        assert_eq!(small.dimensions(), (80, 40));
        assert_eq!(small.get_pixel(40, 20)[0], 90);
        assert_eq!(ImageUtil::rescale(&img, 1.0), img);
    }
}
