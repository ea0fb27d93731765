use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

/// Draw a closed polyline through `pts` with the given stroke thickness.
///
/// Thick strokes are rendered as a fan of parallel one-pixel segments plus round joins.
pub fn draw_closed_polyline(canvas: &mut RgbImage, pts: &[(f32, f32)], color: Rgb<u8>, thickness: u32) {
    if pts.len() < 2 {
        return;
    }
    let half = thickness.max(1) as f32 / 2.0;
    for (i, &start) in pts.iter().enumerate() {
        let end = pts[(i + 1) % pts.len()];
        let (dx, dy) = (end.0 - start.0, end.1 - start.1);
        let len = (dx * dx + dy * dy).sqrt();
        if len < f32::EPSILON {
            continue;
        }
        let (nx, ny) = (-dy / len, dx / len);
        let mut offset = -half + 0.5;
        while offset <= half - 0.5 + f32::EPSILON {
            draw_line_segment_mut(
                canvas,
                (start.0 + nx * offset, start.1 + ny * offset),
                (end.0 + nx * offset, end.1 + ny * offset),
                color,
            );
            offset += 0.5;
        }
        if thickness > 2 {
            draw_filled_circle_mut(
                canvas,
                (start.0.round() as i32, start.1.round() as i32),
                half.floor() as i32,
                color,
            );
        }
    }
}

/// Draw a two-tone dot at every point: an `outer` disc with an `inner` disc on top.
pub fn draw_corner_dots(
    canvas: &mut RgbImage,
    pts: &[(f32, f32)],
    outer: (i32, Rgb<u8>),
    inner: (i32, Rgb<u8>),
) {
    for &(x, y) in pts {
        let center = (x.round() as i32, y.round() as i32);
        draw_filled_circle_mut(canvas, center, outer.0, outer.1);
        draw_filled_circle_mut(canvas, center, inner.0, inner.1);
    }
}

/// Outline axis-aligned boxes `(x, y, w, h)`, e.g. ranked detector candidates.
pub fn draw_boxes(canvas: &mut RgbImage, boxes: &[(i32, i32, u32, u32)], color: Rgb<u8>, thickness: u32) {
    for &(x, y, w, h) in boxes {
        for t in 0..thickness.max(1) {
            let (tw, th) = (w + 2 * t, h + 2 * t);
            if tw == 0 || th == 0 {
                continue;
            }
            draw_hollow_rect_mut(canvas, Rect::at(x - t as i32, y - t as i32).of_size(tw, th), color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{draw_boxes, draw_closed_polyline, draw_corner_dots};
    use image::{Rgb, RgbImage};

    const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);

    #[test]
    fn test_polyline_thickness() {
        let mut canvas = RgbImage::new(60, 60);
        let square = [(10.0, 10.0), (50.0, 10.0), (50.0, 50.0), (10.0, 50.0)];
        draw_closed_polyline(&mut canvas, &square, YELLOW, 4);
        assert_eq!(canvas.get_pixel(30, 10), &YELLOW);
        assert_eq!(canvas.get_pixel(30, 11), &YELLOW);
        assert_eq!(canvas.get_pixel(30, 30), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_corner_dots_and_boxes() {
        let mut canvas = RgbImage::new(40, 40);
        draw_corner_dots(&mut canvas, &[(20.0, 20.0)], (6, Rgb([1, 1, 1])), (3, YELLOW));
        assert_eq!(canvas.get_pixel(20, 20), &YELLOW);
        assert_eq!(canvas.get_pixel(25, 20), &Rgb([1, 1, 1]));

        draw_boxes(&mut canvas, &[(2, 2, 10, 10)], YELLOW, 1);
        assert_eq!(canvas.get_pixel(2, 6), &YELLOW);
        assert_eq!(canvas.get_pixel(6, 6), &Rgb([0, 0, 0]));
    }
}
