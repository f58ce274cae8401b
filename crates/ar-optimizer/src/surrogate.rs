//! Gaussian-process surrogate with a Matérn 5/2 kernel.
//!
//! Inputs are encoded configurations in `[0, 1]^d`. Targets are standardized
//! before fitting and predictions are returned in the original units.

use nalgebra::{DMatrix, DVector};

const SQRT_5: f64 = 2.236_067_977_499_79;
/// Lower bound on per-dimension lengthscales.
const MIN_LENGTHSCALE: f64 = 0.1;

/// A fitted GP model ready for predictions.
pub struct GaussianProcess {
    /// Cholesky factor of K + σ²I.
    cholesky: nalgebra::linalg::Cholesky<f64, nalgebra::Dyn>,
    /// (K + σ²I)^{-1} y.
    alpha: DVector<f64>,
    x_train: Vec<Vec<f64>>,
    lengthscales: Vec<f64>,
    y_mean: f64,
    y_std: f64,
}

impl GaussianProcess {
    /// Fit on `(x, y)` pairs. Returns `None` for empty input or when the
    /// kernel matrix is not positive definite.
    pub fn fit(x_train: &[Vec<f64>], y_train: &[f64], noise_variance: f64) -> Option<Self> {
        let n = y_train.len();
        if n == 0 || x_train.len() != n {
            return None;
        }

        let y_mean = y_train.iter().sum::<f64>() / n as f64;
        let y_var = if n > 1 {
            y_train.iter().map(|&y| (y - y_mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            1.0
        };
        let y_std = y_var.sqrt().max(1e-10);
        let y_standardized: Vec<f64> = y_train.iter().map(|&y| (y - y_mean) / y_std).collect();

        // ARD lengthscales: per-dimension spread of the training inputs.
        let d = x_train[0].len();
        let lengthscales: Vec<f64> = (0..d)
            .map(|j| {
                let mean_j = x_train.iter().map(|x| x[j]).sum::<f64>() / n as f64;
                let var_j = x_train.iter().map(|x| (x[j] - mean_j).powi(2)).sum::<f64>() / n as f64;
                var_j.sqrt().max(MIN_LENGTHSCALE)
            })
            .collect();

        let k = DMatrix::from_fn(n, n, |i, j| {
            let k = matern52(&x_train[i], &x_train[j], &lengthscales);
            if i == j {
                k + noise_variance
            } else {
                k
            }
        });
        let cholesky = nalgebra::linalg::Cholesky::new(k)?;
        let alpha = cholesky.solve(&DVector::from_column_slice(&y_standardized));

        Some(Self {
            cholesky,
            alpha,
            x_train: x_train.to_vec(),
            lengthscales,
            y_mean,
            y_std,
        })
    }

    /// Posterior mean and standard deviation at `x`.
    pub fn predict(&self, x: &[f64]) -> (f64, f64) {
        let k_star = DVector::from_fn(self.x_train.len(), |i, _| {
            matern52(x, &self.x_train[i], &self.lengthscales)
        });
        let mean = k_star.dot(&self.alpha);
        let v = self.cholesky.solve(&k_star);
        let var = (1.0 - k_star.dot(&v)).max(0.0);
        (mean * self.y_std + self.y_mean, var.sqrt() * self.y_std)
    }
}

fn matern52(x1: &[f64], x2: &[f64], lengthscales: &[f64]) -> f64 {
    let r_sq: f64 = x1
        .iter()
        .zip(x2)
        .zip(lengthscales)
        .map(|((a, b), l)| ((a - b) / l).powi(2))
        .sum();
    let r = r_sq.sqrt();
    let sqrt5_r = SQRT_5 * r;
    (1.0 + sqrt5_r + 5.0 / 3.0 * r_sq) * (-sqrt5_r).exp()
}

fn norm_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

fn norm_cdf(x: f64) -> f64 {
    if x < -8.0 {
        return 0.0;
    }
    if x > 8.0 {
        return 1.0;
    }
    let abs_x = x.abs();
    let t = 1.0 / (1.0 + 0.231_641_9 * abs_x);
    let poly = t
        * (0.319_381_530
            + t * (-0.356_563_782 + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    let cdf = 1.0 - norm_pdf(abs_x) * poly;
    if x >= 0.0 {
        cdf
    } else {
        1.0 - cdf
    }
}

/// Expected improvement over `best` for a maximized quantity.
pub fn expected_improvement(mean: f64, std: f64, best: f64) -> f64 {
    if std < 1e-12 {
        return (mean - best).max(0.0);
    }
    let z = (mean - best) / std;
    ((mean - best) * norm_cdf(z) + std * norm_pdf(z)).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_training_points() {
        let x = vec![vec![0.0], vec![0.5], vec![1.0]];
        let y = vec![1.0, 3.0, 2.0];
        let gp = GaussianProcess::fit(&x, &y, 1e-8).unwrap();
        for (xi, yi) in x.iter().zip(&y) {
            let (mean, std) = gp.predict(xi);
            assert!((mean - yi).abs() < 1e-3, "mean {mean} vs {yi}");
            assert!(std < 1e-2);
        }
    }

    #[test]
    fn uncertainty_grows_away_from_data() {
        let x = vec![vec![0.0, 0.0], vec![0.1, 0.1]];
        let y = vec![0.2, 0.4];
        let gp = GaussianProcess::fit(&x, &y, 1e-6).unwrap();
        let (_, near) = gp.predict(&[0.05, 0.05]);
        let (_, far) = gp.predict(&[1.0, 1.0]);
        assert!(far > near);
    }

    #[test]
    fn fit_rejects_empty_input() {
        assert!(GaussianProcess::fit(&[], &[], 1e-6).is_none());
    }

    #[test]
    fn normal_cdf_is_sane() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!((norm_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!(norm_cdf(-9.0) == 0.0);
    }

    #[test]
    fn expected_improvement_prefers_high_mean_and_uncertainty() {
        let base = expected_improvement(0.5, 0.1, 0.5);
        assert!(expected_improvement(0.7, 0.1, 0.5) > base);
        assert!(expected_improvement(0.5, 0.3, 0.5) > base);
        assert_eq!(expected_improvement(0.2, 0.0, 0.5), 0.0);
    }
}
