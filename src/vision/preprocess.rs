//! Frame preprocessing: 3x3 Gaussian smoothing, 5-aperture Laplacian edge
//! enhancement and a to-zero threshold, in that order.
//!
//! Both filters run through imageproc kernels over a reflect-101 padded
//! copy of the frame. Output saturates at 8 bits, so negative Laplacian
//! responses clamp to zero.

use image::{imageops, GrayImage};
use imageproc::filter::Kernel;

use crate::error::{TensiometerError, TensiometerResult};

/// Fixed 3x3 Gaussian (sigma 0.8): outer product of `[1, 2, 1] / 4`.
const GAUSSIAN_3X3: [f32; 9] = [
    1.0 / 16.0,
    2.0 / 16.0,
    1.0 / 16.0,
    2.0 / 16.0,
    4.0 / 16.0,
    2.0 / 16.0,
    1.0 / 16.0,
    2.0 / 16.0,
    1.0 / 16.0,
];

/// Second-derivative and smoothing taps for aperture 5.
const DERIV2_5: [f32; 5] = [1.0, 0.0, -2.0, 0.0, 1.0];
const SMOOTH_5: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];

pub const DEFAULT_THRESHOLD: u8 = 25;

/// Turns a grayscale frame into an edge mask of identical dimensions.
///
/// Pixels at or below `threshold` become zero; the rest keep their Laplacian
/// magnitude.
pub fn prep_frame(gray: &GrayImage, threshold: u8) -> TensiometerResult<GrayImage> {
    if gray.width() == 0 || gray.height() == 0 {
        return Err(TensiometerError::InvalidFrame(format!(
            "cannot preprocess a {}x{} frame",
            gray.width(),
            gray.height()
        )));
    }

    let smoothed = convolve(gray, &GAUSSIAN_3X3, 3);
    let mut edges = convolve(&smoothed, &laplacian_kernel(), 5);
    threshold_to_zero(&mut edges, threshold);
    Ok(edges)
}

/// d2/dx2 + d2/dy2 with Sobel-style smoothing across the other axis.
pub fn laplacian_kernel() -> [f32; 25] {
    let mut kernel = [0.0f32; 25];
    for row in 0..5 {
        for col in 0..5 {
            kernel[row * 5 + col] = DERIV2_5[col] * SMOOTH_5[row] + SMOOTH_5[col] * DERIV2_5[row];
        }
    }
    kernel
}

/// Zeroes every pixel `<= threshold`; brighter pixels pass unchanged.
pub fn threshold_to_zero(image: &mut GrayImage, threshold: u8) {
    for pixel in image.pixels_mut() {
        if pixel.0[0] <= threshold {
            pixel.0[0] = 0;
        }
    }
}

/// Correlates `src` with a square kernel. The frame is padded with a
/// reflect-101 border first so the kernel never sees imageproc's
/// edge-replicating padding, then cropped back to the frame size.
fn convolve(src: &GrayImage, kernel: &[f32], size: u32) -> GrayImage {
    let (width, height) = src.dimensions();
    let radius = size / 2;
    let padded = GrayImage::from_fn(width + 2 * radius, height + 2 * radius, |x, y| {
        let sx = reflect_101(x as i64 - radius as i64, width as i64);
        let sy = reflect_101(y as i64 - radius as i64, height as i64);
        *src.get_pixel(sx as u32, sy as u32)
    });

    let filtered: GrayImage = Kernel::new(kernel, size, size)
        .filter(&padded, |channel, acc: f32| *channel = saturate_u8(acc));
    imageops::crop_imm(&filtered, radius, radius, width, height).to_image()
}

/// `gfedcb|abcdefgh|gfedcba` border extension.
fn reflect_101(index: i64, len: i64) -> usize {
    if len == 1 {
        return 0;
    }
    let mut i = index;
    loop {
        if i < 0 {
            i = -i;
        } else if i >= len {
            i = 2 * (len - 1) - i;
        } else {
            return i as usize;
        }
    }
}

fn saturate_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
