//! 4-connected component labelling of dark masks.

use nalgebra::Point2;

use super::threshold::Mask;

/// One connected dark region.
#[derive(Debug, Clone)]
pub(crate) struct Blob {
    pub pixels: Vec<(usize, usize)>,
    pub min_x: usize,
    pub min_y: usize,
    pub max_x: usize,
    pub max_y: usize,
}

impl Blob {
    pub fn area(&self) -> usize {
        self.pixels.len()
    }

    pub fn centroid(&self) -> Point2<f64> {
        let n = self.pixels.len() as f64;
        let (sx, sy) = self
            .pixels
            .iter()
            .fold((0.0, 0.0), |(sx, sy), &(x, y)| (sx + x as f64, sy + y as f64));
        Point2::new(sx / n, sy / n)
    }

    /// Eigenvalues `(major, minor)` of the pixel covariance.
    pub fn principal_variances(&self) -> (f64, f64) {
        let c = self.centroid();
        let n = self.pixels.len() as f64;
        let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
        for &(x, y) in &self.pixels {
            let dx = x as f64 - c.x;
            let dy = y as f64 - c.y;
            sxx += dx * dx;
            sxy += dx * dy;
            syy += dy * dy;
        }
        sxx /= n;
        sxy /= n;
        syy /= n;

        let mean = 0.5 * (sxx + syy);
        let diff = (0.25 * (sxx - syy).powi(2) + sxy * sxy).sqrt();
        (mean + diff, (mean - diff).max(0.0))
    }

    pub fn touches_border(&self, width: usize, height: usize) -> bool {
        self.min_x == 0 || self.min_y == 0 || self.max_x + 1 >= width || self.max_y + 1 >= height
    }
}

/// Labels the dark regions of `mask`, keeping those with
/// `min_area <= area <= max_area`.
pub(crate) fn connected_components(mask: &Mask, min_area: usize, max_area: usize) -> Vec<Blob> {
    let (w, h) = (mask.width, mask.height);
    let mut visited = vec![false; w * h];
    let mut blobs = Vec::new();
    let mut stack = Vec::new();

    for start in 0..w * h {
        if visited[start] || !mask.data[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);

        let mut blob = Blob {
            pixels: Vec::new(),
            min_x: usize::MAX,
            min_y: usize::MAX,
            max_x: 0,
            max_y: 0,
        };

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            blob.pixels.push((x, y));
            blob.min_x = blob.min_x.min(x);
            blob.min_y = blob.min_y.min(y);
            blob.max_x = blob.max_x.max(x);
            blob.max_y = blob.max_y.max(y);

            let mut visit = |n: usize| {
                if !visited[n] && mask.data[n] {
                    visited[n] = true;
                    stack.push(n);
                }
            };
            if x > 0 {
                visit(idx - 1);
            }
            if x + 1 < w {
                visit(idx + 1);
            }
            if y > 0 {
                visit(idx - w);
            }
            if y + 1 < h {
                visit(idx + w);
            }
        }

        if (min_area..=max_area).contains(&blob.area()) {
            blobs.push(blob);
        }
    }
    blobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mask_from(rows: &[&str]) -> Mask {
        let height = rows.len();
        let width = rows[0].len();
        let data = rows
            .iter()
            .flat_map(|r| r.chars().map(|c| c == '#'))
            .collect();
        Mask {
            width,
            height,
            data,
        }
    }

    #[test]
    fn test_components_are_four_connected() {
        let mask = mask_from(&[
            "##....", //
            "##....", //
            "..#...", //
            "...###", //
        ]);
        let blobs = connected_components(&mask, 1, 100);
        assert_eq!(blobs.len(), 3);
        let mut areas: Vec<_> = blobs.iter().map(|b| b.area()).collect();
        areas.sort();
        assert_eq!(areas, vec![1, 3, 4]);

        let filtered = connected_components(&mask, 2, 3);
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].touches_border(6, 4));
    }

    #[test]
    fn test_blob_moments() {
        let mask = mask_from(&[
            "........", //
            ".######.", //
            ".######.", //
            "........", //
        ]);
        let blobs = connected_components(&mask, 1, 100);
        assert_eq!(blobs.len(), 1);
        let blob = &blobs[0];
        assert!(!blob.touches_border(8, 4));
        let c = blob.centroid();
        assert_relative_eq!(c.x, 3.5);
        assert_relative_eq!(c.y, 1.5);
        let (major, minor) = blob.principal_variances();
        // Variance of 0..6 is 35/12, of 0..2 is 1/4.
        assert_relative_eq!(major, 35.0 / 12.0, epsilon = 1e-12);
        assert_relative_eq!(minor, 0.25, epsilon = 1e-12);
    }
}
