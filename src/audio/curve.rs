//! Resampling of per-character control curves (speed, loudness).
//!
//! Upsampling interpolates linearly. Downsampling evaluates a natural cubic
//! spline through the original points, which keeps the curve's shape better
//! than box averaging for short outputs.

/// Smallest value a spline evaluation may return.
pub const SPLINE_FLOOR: f64 = 1e-5;

/// Resample `values` to `new_size` points.
///
/// # Returns
/// An empty vector for empty input or `new_size == 0`, a copy when the size
/// is unchanged, otherwise exactly `new_size` values.
pub fn resample(values: &[f64], new_size: usize) -> Vec<f64> {
    if values.is_empty() || new_size == 0 {
        return Vec::new();
    }
    if new_size == values.len() {
        return values.to_vec();
    }
    if new_size > values.len() { upsample_linear(values, new_size) } else { downsample_spline(values, new_size) }
}

/// Linear interpolation onto `new_size` evenly spaced positions.
fn upsample_linear(values: &[f64], new_size: usize) -> Vec<f64> {
    if new_size == 1 {
        return vec![values[0]];
    }
    let old_size = values.len();
    (0..new_size)
        .map(|i| {
            let pos = i as f64 * (old_size - 1) as f64 / (new_size - 1) as f64;
            let i0 = pos.floor() as usize;
            let i1 = (i0 + 1).min(old_size - 1);
            let t = pos - i0 as f64;
            (1.0 - t) * values[i0] + t * values[i1]
        })
        .collect()
}

fn downsample_spline(values: &[f64], new_size: usize) -> Vec<f64> {
    let spline = NaturalSpline::fit(values);
    if new_size == 1 {
        return vec![spline.eval(0.0)];
    }
    let x_max = (values.len() - 1) as f64;
    (0..new_size).map(|i| spline.eval(x_max * i as f64 / (new_size - 1) as f64)).collect()
}

/// Natural cubic spline over unit-spaced points.
///
/// Segment `i` covers `[i, i+1]` with
/// `S(x) = a[i] + b[i]dx + c[i]dx² + d[i]dx³`.
struct NaturalSpline {
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
    d: Vec<f64>,
}

impl NaturalSpline {
    /// Fit through at least two points.
    fn fit(y: &[f64]) -> Self {
        let n = y.len();
        let segments = n - 1;
        let a = y.to_vec();

        let mut alpha = vec![0.0; n];
        for i in 1..segments {
            alpha[i] = 3.0 * (a[i + 1] - 2.0 * a[i] + a[i - 1]);
        }

        // Tridiagonal solve for c
        let mut l = vec![1.0; n];
        let mut mu = vec![0.0; n];
        let mut z = vec![0.0; n];
        for i in 1..n {
            l[i] = 4.0 - mu[i - 1];
            mu[i] = 1.0 / l[i];
            z[i] = (alpha[i] - z[i - 1]) / l[i];
        }

        let mut c = vec![0.0; n];
        c[n - 1] = z[n - 1];
        for j in (0..n - 1).rev() {
            c[j] = z[j] - mu[j] * c[j + 1];
        }

        let mut b = vec![0.0; segments];
        let mut d = vec![0.0; segments];
        for i in 0..segments {
            b[i] = a[i + 1] - a[i] - (c[i + 1] + 2.0 * c[i]) / 3.0;
            d[i] = (c[i + 1] - c[i]) / 3.0;
        }

        Self { a, b, c, d }
    }

    fn eval(&self, x: f64) -> f64 {
        let segments = self.b.len();
        let (i, x) = if x < 0.0 {
            (0, 0.0)
        } else if x.floor() as usize >= segments {
            (segments - 1, segments as f64)
        } else {
            (x.floor() as usize, x)
        };

        let dx = x - i as f64;
        let value = self.a[i] + self.b[i] * dx + self.c[i] * dx * dx + self.d[i] * dx * dx * dx;
        value.max(SPLINE_FLOOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_size_is_identity() {
        let values = vec![0.3, 1.2, 0.9];
        assert_eq!(resample(&values, 3), values);
    }

    #[test]
    fn test_invalid_input() {
        assert!(resample(&[], 5).is_empty());
        assert!(resample(&[1.0], 0).is_empty());
    }

    #[test]
    fn test_upsample_linear() {
        let out = resample(&[0.0, 1.0], 5);
        assert_eq!(out, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(resample(&[1.0], 11), vec![1.0; 11]);
    }

    #[test]
    fn test_downsample_constant() {
        let out = resample(&[2.0; 20], 7);
        assert_eq!(out.len(), 7);
        assert!(out.iter().all(|v| (v - 2.0).abs() < 1e-9));
    }

    #[test]
    fn test_downsample_with_zero_stays_positive() {
        let mut values: Vec<f64> = (0..100).map(|i| 1.0 + 0.5 * (i as f64 / 7.0).sin()).collect();
        values[37] = 0.0;
        values[99] = 0.0;
        let out = resample(&values, 10);
        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|&v| v >= SPLINE_FLOOR));
    }

    #[test]
    fn test_downsample_endpoints() {
        let values: Vec<f64> = (0..10).map(|i| 1.0 + i as f64).collect();
        let out = resample(&values, 4);
        assert!((out[0] - 1.0).abs() < 1e-9);
        assert!((out[3] - 10.0).abs() < 1e-9);
        assert_eq!(resample(&values, 1).len(), 1);
    }

    #[test]
    fn test_lengths() {
        let values: Vec<f64> = (0..13).map(|i| i as f64 * 0.1 + 0.5).collect();
        for size in 1..30 {
            assert_eq!(resample(&values, size).len(), size);
        }
    }
}
