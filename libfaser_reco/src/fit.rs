//! Bounded Levenberg-Marquardt least squares.
//!
//! Every fit returns a [`FitResult`] by value; nothing is cached between calls, so the
//! minimiser can be shared freely between threads.
use nalgebra::{DMatrix, DVector};

const INITIAL_LAMBDA: f64 = 1.0e-3;
const MAX_LAMBDA: f64 = 1.0e12;
const DERIVATIVE_STEP: f64 = 1.0e-7;

/// Starting value and allowed range of one fit parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub init: f64,
    pub lower: f64,
    pub upper: f64,
    pub fixed: bool,
}

impl ParamSpec {
    pub fn free(init: f64) -> Self {
        Self {
            init,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
            fixed: false,
        }
    }

    pub fn bounded(init: f64, lower: f64, upper: f64) -> Self {
        Self {
            init: init.clamp(lower, upper),
            lower,
            upper,
            fixed: false,
        }
    }

    pub fn fixed(value: f64) -> Self {
        Self {
            init: value,
            lower: value,
            upper: value,
            fixed: true,
        }
    }

    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.lower, self.upper)
    }

    fn at_bound(&self, value: f64) -> bool {
        value <= self.lower || value >= self.upper
    }
}

/// Outcome of a minimisation.
///
/// `edm` is the estimated vertical distance to the minimum, `r^T J (J^T J)^-1 J^T r`,
/// evaluated over the free parameters that are not pinned at a bound.
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    pub params: Vec<f64>,
    pub errors: Vec<f64>,
    pub chi2: f64,
    pub ndf: usize,
    pub edm: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl FitResult {
    fn failed(params: Vec<f64>, n_points: usize, n_free: usize) -> Self {
        let n_params = params.len();
        Self {
            params,
            errors: vec![0.0; n_params],
            chi2: f64::INFINITY,
            ndf: n_points.saturating_sub(n_free),
            edm: f64::INFINITY,
            iterations: 0,
            converged: false,
        }
    }

    /// chi2 / ndf, or zero when there are no degrees of freedom
    pub fn reduced_chi2(&self) -> f64 {
        if self.ndf == 0 {
            0.0
        } else {
            self.chi2 / self.ndf as f64
        }
    }

    /// The fit converged and every output is finite
    pub fn is_valid(&self) -> bool {
        self.converged
            && self.chi2.is_finite()
            && self.edm.is_finite()
            && self.params.iter().all(|p| p.is_finite())
    }
}

/// Levenberg-Marquardt minimiser of a sum of squared residuals
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeastSquares {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for LeastSquares {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1.0e-10,
        }
    }
}

impl LeastSquares {
    /// Minimise `sum(r_i^2)` where `residuals(params, r)` fills the `n_residuals` values of r.
    pub fn minimize<F>(&self, n_residuals: usize, residuals: F, specs: &[ParamSpec]) -> FitResult
    where
        F: Fn(&[f64], &mut [f64]),
    {
        let mut params: Vec<f64> = specs.iter().map(|s| s.clamp(s.init)).collect();
        let free: Vec<usize> = (0..specs.len()).filter(|&i| !specs[i].fixed).collect();
        if n_residuals < free.len() || n_residuals == 0 {
            return FitResult::failed(params, n_residuals, free.len());
        }

        let mut r = vec![0.0; n_residuals];
        residuals(&params, &mut r);
        let mut chi2 = sum_of_squares(&r);
        if !chi2.is_finite() {
            return FitResult::failed(params, n_residuals, free.len());
        }

        let mut lambda = INITIAL_LAMBDA;
        let mut converged = free.is_empty();
        let mut iterations = 0;
        let mut trial = params.clone();
        let mut r_trial = vec![0.0; n_residuals];

        while !converged && iterations < self.max_iterations {
            iterations += 1;
            let jac = jacobian(&residuals, &params, &r, specs, &free);
            let jt = jac.transpose();
            let a = &jt * &jac;
            let g = &jt * DVector::from_column_slice(&r);

            let mut improved = false;
            while lambda <= MAX_LAMBDA {
                let mut m = a.clone();
                for i in 0..free.len() {
                    m[(i, i)] += lambda * a[(i, i)].max(1.0e-12);
                }
                let Some(step) = solve(m, -&g) else {
                    lambda *= 10.0;
                    continue;
                };
                trial.copy_from_slice(&params);
                for (k, &i) in free.iter().enumerate() {
                    trial[i] = specs[i].clamp(params[i] + step[k]);
                }
                residuals(&trial, &mut r_trial);
                let chi2_trial = sum_of_squares(&r_trial);
                if chi2_trial.is_finite() && chi2_trial < chi2 {
                    let decrease = chi2 - chi2_trial;
                    let step_size: f64 = free
                        .iter()
                        .map(|&i| (trial[i] - params[i]).abs() / (params[i].abs() + 1.0e-12))
                        .fold(0.0, f64::max);
                    params.copy_from_slice(&trial);
                    r.copy_from_slice(&r_trial);
                    chi2 = chi2_trial;
                    lambda = (lambda / 10.0).max(1.0e-12);
                    improved = true;
                    if decrease <= self.tolerance * chi2.max(self.tolerance)
                        || step_size < self.tolerance
                    {
                        converged = true;
                    }
                    break;
                }
                lambda *= 10.0;
            }
            if !improved {
                // No step lowers chi2 any more: we are sitting in the minimum
                converged = true;
            }
        }

        let (edm, errors) = edm_and_errors(&residuals, &params, &r, specs, &free);
        let mut all_errors = vec![0.0; params.len()];
        for (k, &i) in free.iter().enumerate() {
            all_errors[i] = errors[k];
        }
        FitResult {
            params,
            errors: all_errors,
            chi2,
            ndf: n_residuals - free.len(),
            edm,
            iterations,
            converged,
        }
    }

    /// Fit `model(x, params)` to the points `(x, y)` with per-point errors.
    ///
    /// Points with a non-positive error are ignored.
    pub fn fit_curve<M>(
        &self,
        x: &[f64],
        y: &[f64],
        errors: &[f64],
        model: M,
        specs: &[ParamSpec],
    ) -> FitResult
    where
        M: Fn(f64, &[f64]) -> f64,
    {
        let points: Vec<(f64, f64, f64)> = x
            .iter()
            .zip(y.iter())
            .zip(errors.iter())
            .filter(|(_, e)| **e > 0.0)
            .map(|((x, y), e)| (*x, *y, *e))
            .collect();
        self.minimize(
            points.len(),
            |p, r| {
                for (ri, (x, y, e)) in r.iter_mut().zip(points.iter()) {
                    *ri = (model(*x, p) - y) / e;
                }
            },
            specs,
        )
    }
}

fn sum_of_squares(r: &[f64]) -> f64 {
    r.iter().map(|v| v * v).sum()
}

fn jacobian<F>(
    residuals: &F,
    params: &[f64],
    r0: &[f64],
    specs: &[ParamSpec],
    free: &[usize],
) -> DMatrix<f64>
where
    F: Fn(&[f64], &mut [f64]),
{
    let mut jac = DMatrix::<f64>::zeros(r0.len(), free.len());
    let mut shifted = params.to_vec();
    let mut r1 = vec![0.0; r0.len()];
    for (k, &i) in free.iter().enumerate() {
        let mut h = DERIVATIVE_STEP * params[i].abs().max(1.0e-3);
        if params[i] + h > specs[i].upper {
            h = -h;
        }
        shifted[i] = params[i] + h;
        residuals(&shifted, &mut r1);
        for (row, (a, b)) in r1.iter().zip(r0.iter()).enumerate() {
            jac[(row, k)] = (a - b) / h;
        }
        shifted[i] = params[i];
    }
    jac
}

fn solve(m: DMatrix<f64>, rhs: DVector<f64>) -> Option<DVector<f64>> {
    let step = match m.clone().cholesky() {
        Some(chol) => Some(chol.solve(&rhs)),
        None => m.lu().solve(&rhs),
    };
    step.filter(|s| s.iter().all(|v| v.is_finite()))
}

fn edm_and_errors<F>(
    residuals: &F,
    params: &[f64],
    r: &[f64],
    specs: &[ParamSpec],
    free: &[usize],
) -> (f64, Vec<f64>)
where
    F: Fn(&[f64], &mut [f64]),
{
    let mut errors = vec![0.0; free.len()];
    if free.is_empty() {
        return (0.0, errors);
    }
    let jac = jacobian(residuals, params, r, specs, free);
    let jt = jac.transpose();
    let a = &jt * &jac;
    let g = &jt * DVector::from_column_slice(r);

    let active: Vec<usize> = (0..free.len())
        .filter(|&k| !specs[free[k]].at_bound(params[free[k]]))
        .collect();
    if active.is_empty() {
        return (0.0, errors);
    }
    let a_active = DMatrix::from_fn(active.len(), active.len(), |i, j| a[(active[i], active[j])]);
    let g_active = DVector::from_fn(active.len(), |i, _| g[active[i]]);
    let Some(cov) = a_active.try_inverse() else {
        return (f64::INFINITY, errors);
    };
    for (i, &k) in active.iter().enumerate() {
        errors[k] = cov[(i, i)].max(0.0).sqrt();
    }
    let edm = (g_active.transpose() * &cov * &g_active)[(0, 0)];
    (edm.abs(), errors)
}

/// Gaussian `p0 * exp(-(x - p1)^2 / (2 p2^2))`
pub fn gaussian(x: f64, p: &[f64]) -> f64 {
    let z = (x - p[1]) / p[2];
    p[0] * (-0.5 * z * z).exp()
}

/// Crystal Ball shape `p0 * cb(x; mean=p1, sigma=p2, alpha=p3, n=p4)`.
///
/// A negative alpha puts the power-law tail on the high-x side.
pub fn crystal_ball(x: f64, p: &[f64]) -> f64 {
    let (amplitude, mean, sigma, alpha, n) = (p[0], p[1], p[2], p[3], p[4]);
    let mut z = (x - mean) / sigma;
    if alpha < 0.0 {
        z = -z;
    }
    let abs_alpha = alpha.abs();
    if abs_alpha < 1.0e-9 || z > -abs_alpha {
        return amplitude * (-0.5 * z * z).exp();
    }
    let n_over_alpha = n / abs_alpha;
    let aa = (-0.5 * abs_alpha * abs_alpha).exp();
    let b = n_over_alpha - abs_alpha;
    let arg = n_over_alpha / (b - z);
    amplitude * aa * arg.powf(n)
}

/// First crossing of `level` by `f` on `[start, stop]`, assuming `f` rises across it.
///
/// Returns `start` when `f` is already above the level there and None when it never
/// reaches it.
pub fn rising_crossing<F>(f: F, level: f64, start: f64, stop: f64) -> Option<f64>
where
    F: Fn(f64) -> f64,
{
    if !(start.is_finite() && stop.is_finite()) || stop < start {
        return None;
    }
    if f(start) >= level {
        return Some(start);
    }
    if f(stop) < level {
        return None;
    }
    let (mut lo, mut hi) = (start, stop);
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        if f(mid) >= level {
            hi = mid;
        } else {
            lo = mid;
        }
        if hi - lo < 1.0e-9 {
            break;
        }
    }
    Some(0.5 * (lo + hi))
}
