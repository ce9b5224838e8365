//! Binarization of luma images into "dark" masks.

use image::GrayImage;

/// Row-major boolean image; `true` marks a dark pixel.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Mask {
    pub width: usize,
    pub height: usize,
    pub data: Vec<bool>,
}

impl Mask {
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> bool {
        self.data[y * self.width + x]
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&d| d).count()
    }
}

fn histogram(image: &GrayImage) -> [u32; 256] {
    let mut hist = [0u32; 256];
    for &v in image.as_raw() {
        hist[v as usize] += 1;
    }
    hist
}

/// Difference between the 95th and 5th intensity percentiles.
///
/// Used as the fast check: an image without this much contrast cannot
/// contain a printed target.
pub(crate) fn percentile_contrast(image: &GrayImage) -> u8 {
    let total = image.as_raw().len() as u64;
    if total == 0 {
        return 0;
    }
    let hist = histogram(image);
    let lo_rank = total * 5 / 100;
    let hi_rank = total * 95 / 100;

    let mut lo = None;
    let mut hi = 255u8;
    let mut seen = 0u64;
    for (v, &h) in hist.iter().enumerate() {
        seen += h as u64;
        if lo.is_none() && seen > lo_rank {
            lo = Some(v as u8);
        }
        if seen > hi_rank {
            hi = v as u8;
            break;
        }
    }
    hi.saturating_sub(lo.unwrap_or(0))
}

/// Otsu threshold of the whole image.
pub(crate) fn otsu_threshold(image: &GrayImage) -> u8 {
    let hist = histogram(image);
    let total: f64 = image.as_raw().len() as f64;
    if total == 0.0 {
        return 127;
    }

    let sum_total: f64 = hist
        .iter()
        .enumerate()
        .map(|(i, &h)| i as f64 * h as f64)
        .sum();

    let mut sum_b = 0f64;
    let mut w_b = 0f64;
    let mut best_var = -1f64;
    let mut best_t = 127u8;

    for (t, &h) in hist.iter().enumerate() {
        w_b += h as f64;
        if w_b < 1.0 {
            continue;
        }
        let w_f = total - w_b;
        if w_f < 1.0 {
            break;
        }

        sum_b += t as f64 * h as f64;
        let m_b = sum_b / w_b;
        let m_f = (sum_total - sum_b) / w_f;

        let var_between = w_b * w_f * (m_b - m_f) * (m_b - m_f);
        if var_between > best_var {
            best_var = var_between;
            best_t = t as u8;
        }
    }
    best_t
}

/// Pixels at or below `threshold` are dark.
pub(crate) fn global_dark_mask(image: &GrayImage, threshold: u8) -> Mask {
    Mask {
        width: image.width() as usize,
        height: image.height() as usize,
        data: image.as_raw().iter().map(|&v| v <= threshold).collect(),
    }
}

/// Summed-area table with one extra leading row and column of zeros.
struct IntegralImage {
    stride: usize,
    sums: Vec<u64>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        let w = image.width() as usize;
        let h = image.height() as usize;
        let stride = w + 1;
        let mut sums = vec![0u64; stride * (h + 1)];
        let raw = image.as_raw();
        for y in 0..h {
            let mut row = 0u64;
            for x in 0..w {
                row += raw[y * w + x] as u64;
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        IntegralImage { stride, sums }
    }

    /// Sum over the half-open box `[x0, x1) x [y0, y1)`.
    fn box_sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> u64 {
        let s = self.stride;
        self.sums[y1 * s + x1] + self.sums[y0 * s + x0] - self.sums[y0 * s + x1] - self.sums[y1 * s + x0]
    }
}

/// Local mean thresholding: a pixel is dark when it is more than `offset`
/// below the mean of the `(2 * half + 1)^2` box around it (clipped to the
/// image).
pub(crate) fn adaptive_dark_mask(image: &GrayImage, half: usize, offset: f64) -> Mask {
    let w = image.width() as usize;
    let h = image.height() as usize;
    let integral = IntegralImage::new(image);
    let raw = image.as_raw();

    let mut data = vec![false; w * h];
    for y in 0..h {
        let y0 = y.saturating_sub(half);
        let y1 = (y + half + 1).min(h);
        for x in 0..w {
            let x0 = x.saturating_sub(half);
            let x1 = (x + half + 1).min(w);
            let area = ((x1 - x0) * (y1 - y0)) as f64;
            let mean = integral.box_sum(x0, y0, x1, y1) as f64 / area;
            data[y * w + x] = (raw[y * w + x] as f64) < mean - offset;
        }
    }
    Mask {
        width: w,
        height: h,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn two_tone(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, _| if x < w / 2 { Luma([40]) } else { Luma([200]) })
    }

    #[test]
    fn test_otsu_splits_two_tones() {
        let img = two_tone(20, 10);
        let t = otsu_threshold(&img);
        assert!((40..200).contains(&t), "threshold {} not between tones", t);
        let mask = global_dark_mask(&img, t);
        assert_eq!(mask.count(), 100);
        assert!(mask.get(0, 0));
        assert!(!mask.get(19, 9));
    }

    #[test]
    fn test_percentile_contrast() {
        assert_eq!(percentile_contrast(&two_tone(20, 10)), 160);
        assert_eq!(percentile_contrast(&GrayImage::from_pixel(8, 8, Luma([90]))), 0);
    }

    #[test]
    fn test_adaptive_mask_marks_dark_side_of_edge() {
        let img = two_tone(20, 10);
        let mask = adaptive_dark_mask(&img, 3, 5.0);
        // Near the edge the dark side is below the local mean.
        assert!(mask.get(9, 5));
        assert!(!mask.get(10, 5));
        // Far from the edge the box is uniform and nothing is marked.
        assert!(!mask.get(1, 5));
        assert!(!mask.get(18, 5));
    }
}
