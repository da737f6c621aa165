//! Appearance signatures for visual re-identification
//!
//! A signature is three hue histograms stacked top to bottom (head, body,
//! legs), each 60 bins over the 0..180 half-degree hue scale and min-max
//! normalized to [0, 1]. Signatures are compared with Pearson correlation.

use image::RgbImage;

pub const BANDS: usize = 3;
pub const HUE_BINS: usize = 60;
pub const SIGNATURE_LEN: usize = BANDS * HUE_BINS;

/// Hue scale upper bound (degrees / 2, as in 8-bit HSV)
const HUE_RANGE: f32 = 180.0;

#[derive(Debug, Clone, PartialEq)]
pub struct AppearanceSignature(Vec<f32>);

impl AppearanceSignature {
    /// Build the signature for a person crop.
    ///
    /// Rows are split into three bands of `height / 3`; the last band takes
    /// the remainder. A band with no pixels contributes 60 zeros.
    pub fn from_crop(crop: &RgbImage) -> Self {
        let (width, height) = crop.dimensions();
        let band_h = height / 3;
        let bounds = [(0, band_h), (band_h, 2 * band_h), (2 * band_h, height)];

        let mut values = Vec::with_capacity(SIGNATURE_LEN);
        for (start, end) in bounds {
            let mut hist = [0f32; HUE_BINS];
            if width > 0 {
                for y in start..end {
                    for x in 0..width {
                        let [r, g, b] = crop.get_pixel(x, y).0;
                        hist[hue_bin(r, g, b)] += 1.0;
                    }
                }
            }
            normalize_min_max(&mut hist);
            values.extend_from_slice(&hist);
        }
        Self(values)
    }

    pub fn from_values(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// Pearson correlation in [-1, 1].
    ///
    /// Returns 0.0 when lengths differ or either side has zero variance, so a
    /// blank crop never counts as a match.
    pub fn correlation(&self, other: &AppearanceSignature) -> f64 {
        let a = &self.0;
        let b = &other.0;
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }

        let n = a.len() as f64;
        let mean_a = a.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        let mean_b = b.iter().map(|&v| f64::from(v)).sum::<f64>() / n;

        let mut cov = 0.0;
        let mut var_a = 0.0;
        let mut var_b = 0.0;
        for (&va, &vb) in a.iter().zip(b.iter()) {
            let da = f64::from(va) - mean_a;
            let db = f64::from(vb) - mean_b;
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }

        let denom = (var_a * var_b).sqrt();
        if denom <= f64::EPSILON {
            return 0.0;
        }
        cov / denom
    }

    /// Exponential smoothing toward an observation: `alpha * observed + (1 - alpha) * self`
    pub fn blend(&mut self, observed: &AppearanceSignature, alpha: f64) {
        if observed.0.len() != self.0.len() {
            self.0 = observed.0.clone();
            return;
        }
        let alpha = alpha as f32;
        for (old, &new) in self.0.iter_mut().zip(observed.0.iter()) {
            *old = alpha * new + (1.0 - alpha) * *old;
        }
    }
}

/// Hue bin for one pixel. Achromatic pixels land in bin 0.
fn hue_bin(r: u8, g: u8, b: u8) -> usize {
    let r = f32::from(r);
    let g = f32::from(g);
    let b = f32::from(b);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta <= 0.0 {
        return 0;
    }

    let mut degrees = if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if degrees < 0.0 {
        degrees += 360.0;
    }

    let hue = degrees / 2.0;
    let bin = (hue / (HUE_RANGE / HUE_BINS as f32)) as usize;
    bin.min(HUE_BINS - 1)
}

fn normalize_min_max(hist: &mut [f32; HUE_BINS]) {
    let max = hist.iter().copied().fold(f32::MIN, f32::max);
    let min = hist.iter().copied().fold(f32::MAX, f32::min);
    let range = max - min;
    if range <= 0.0 {
        hist.fill(0.0);
        return;
    }
    for v in hist.iter_mut() {
        *v = (*v - min) / range;
    }
}
