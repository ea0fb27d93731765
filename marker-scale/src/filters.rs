use image::{GrayImage, Luma};
use imageproc::morphology::{grayscale_dilate, grayscale_erode, Mask};
use itertools::Itertools;
use ndarray::{arr2, s, Array2};

/// Sobel vertical `South` gradient operator.
#[rustfmt::skip]
pub const SOBEL_SOUTH: [[f32; 3]; 3] = [
    [-1.0, -2.0, -1.0,],
    [0.0, 0.0, 0.0,],
    [1.0, 2.0, 1.0,],
];

/// Sobel horizontal `East` gradient operator.
#[rustfmt::skip]
pub const SOBEL_EAST: [[f32; 3]; 3] = [
    [-1.0, 0.0, 1.0,],
    [-2.0, 0.0, 2.0,],
    [-1.0, 0.0, 1.0,],
];

pub fn spot_convolve_2d(image: &Array2<f32>, kernel: &Array2<f32>, i: usize, j: usize) -> f32 {
    let window = &image.slice(s![i - 1..i + 2, j - 1..j + 2]);
    (window * kernel).sum() / 4.0
}

/// Sobel response normalized by 4, zero on the one-pixel frame.
pub fn sobel(image: &Array2<f32>, kernel: &[[f32; 3]; 3]) -> Array2<f32> {
    let kernel: Array2<f32> = arr2(kernel);
    let mut out = Array2::zeros(image.dim());
    if image.nrows() < 3 || image.ncols() < 3 {
        return out;
    }
    (1..image.dim().0 - 1)
        .cartesian_product(1..image.dim().1 - 1)
        .for_each(|(i, j)| out[[i, j]] = spot_convolve_2d(image, &kernel, i, j));
    out
}

/// Sum over the `(2r + 1)^2` neighbourhood of every pixel, clamped at the borders.
pub fn box_sum(image: &Array2<f32>, radius: usize) -> Array2<f32> {
    let (rows, cols) = image.dim();
    let mut out = Array2::zeros(image.dim());
    for (i, j) in (0..rows).cartesian_product(0..cols) {
        let r0 = i.saturating_sub(radius);
        let c0 = j.saturating_sub(radius);
        let r1 = (i + radius + 1).min(rows);
        let c1 = (j + radius + 1).min(cols);
        out[[i, j]] = image.slice(s![r0..r1, c0..c1]).sum();
    }
    out
}

/// Grayscale morphological gradient (dilation minus erosion) with a square element.
pub fn morphological_gradient(image: &GrayImage, radius: u8) -> GrayImage {
    let mask = Mask::square(radius);
    let dilated = grayscale_dilate(image, &mask);
    let eroded = grayscale_erode(image, &mask);
    let (w, h) = image.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        Luma([dilated.get_pixel(x, y)[0] - eroded.get_pixel(x, y)[0]])
    })
}
