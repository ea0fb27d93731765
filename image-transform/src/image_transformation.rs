use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

fn as_pairs(pts: &[[f32; 2]; 4]) -> [(f32, f32); 4] {
    pts.map(|p| (p[0], p[1]))
}

/// Estimate the homography that maps each `src[i]` onto `dst[i]`.
///
/// Both point sets use center-based pixel coordinates, which is also the convention
/// `imageproc` uses when warping, so no corner/center correction is applied here.
/// Returns `None` when no projection fits the correspondences.
pub fn perspective_transform(src: &[[f32; 2]; 4], dst: &[[f32; 2]; 4]) -> Option<Projection> {
    Projection::from_control_points(as_pairs(src), as_pairs(dst))
}

//Generic projective point transform
pub fn transform_points(pts: &[[f32; 2]], transform: &Projection) -> Vec<[f32; 2]> {
    pts.iter()
        .map(|p| {
            let (x, y) = *transform * (p[0], p[1]);
            [x, y]
        })
        .collect()
}

/// Rectify the quadrilateral `quad` (ordered TL, TR, BR, BL) into a `size x size` square.
///
/// Pixels that map outside the source image are painted white.
pub fn warp_quad_to_square(image: &RgbImage, quad: &[[f32; 2]; 4], size: u32) -> Option<RgbImage> {
    if size < 2 {
        return None;
    }
    let far = (size - 1) as f32;
    let target = [[0.0, 0.0], [far, 0.0], [far, far], [0.0, far]];
    let projection = perspective_transform(quad, &target)?;

    // OpenCV uses bilinear by default for their warpPerspective.
    let interpolation = Interpolation::Bilinear;
    let default_pixel_color = Rgb([255u8, 255u8, 255u8]);
    let mut warped = RgbImage::new(size, size);
    warp_into(
        image,
        &projection,
        interpolation,
        default_pixel_color,
        &mut warped,
    );
    Some(warped)
}

#[cfg(test)]
mod tests {
    use super::{perspective_transform, transform_points, warp_quad_to_square};
    use assert_approx_eq::assert_approx_eq;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_identity_transform() {
        let pts = [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]];
        let transform = perspective_transform(&pts, &pts).unwrap();
        let mapped = transform_points(&[[3.0, 7.0]], &transform);
        assert_approx_eq!(mapped[0][0], 3.0, 1e-3);
        assert_approx_eq!(mapped[0][1], 7.0, 1e-3);
    }

    #[test]
    fn test_transform_maps_correspondences() {
        let src = [[12.0, 8.0], [90.0, 15.0], [84.0, 95.0], [5.0, 80.0]];
        let dst = [[0.0, 0.0], [63.0, 0.0], [63.0, 63.0], [0.0, 63.0]];
        let transform = perspective_transform(&src, &dst).unwrap();
        let mapped = transform_points(&src, &transform);
        for (m, d) in mapped.iter().zip(dst.iter()) {
            assert_approx_eq!(m[0], d[0], 0.05);
            assert_approx_eq!(m[1], d[1], 0.05);
        }
    }

    #[test]
    fn test_warp_quad_to_square() {
        // dark square at [20, 60) on a white canvas
        let mut image = RgbImage::from_pixel(80, 80, Rgb([255, 255, 255]));
        for y in 20..60 {
            for x in 20..60 {
                image.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        let quad = [[20.0, 20.0], [59.0, 20.0], [59.0, 59.0], [20.0, 59.0]];
        let warped = warp_quad_to_square(&image, &quad, 32).unwrap();
        assert_eq!(warped.dimensions(), (32, 32));
        assert_eq!(warped.get_pixel(16, 16), &Rgb([0, 0, 0]));
        assert!(warp_quad_to_square(&image, &quad, 1).is_none());
    }
}
