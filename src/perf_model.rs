//! Per-stage performance model (§4.1): fits the closed-form read/compute/write
//! functions to profiling data, collapses them into the five-coefficient
//! reduced form consumed by the emitter, and draws offline Monte-Carlo
//! parameter samples used as solver scenarios.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use statrs::statistics::{Data, OrderStatistics};

use crate::error::JolteonError;
use crate::linalg;

/// One training observation at a given `(d, k)` configuration.
#[derive(Debug, Clone, Copy)]
pub struct TrainingSample {
    pub d: f64,
    pub k: f64,
    pub parent_d: Option<f64>,
    pub read: f64,
    pub compute: f64,
    pub write: f64,
}

/// `f_io(x; a, b) = a/x + b`.
fn f_io(x: f64, p: &[f64]) -> f64 {
    p[0] / x + p[1]
}

fn j_io(x: f64, _p: &[f64]) -> Vec<f64> {
    vec![1.0 / x, 1.0]
}

/// `f_io2((x, parent_d); a, b, c) = a/x + b*parent_d + c`.
fn f_io2(x: f64, parent_d: f64, p: &[f64]) -> f64 {
    p[0] / x + p[1] * parent_d + p[2]
}

fn j_io2(x: f64, parent_d: f64, _p: &[f64]) -> Vec<f64> {
    vec![1.0 / x, parent_d, 1.0]
}

/// `f_cmp(x; a, b, c, d) = a/x + b*log(x)/x + c/x^2 + d`.
fn f_cmp(x: f64, p: &[f64]) -> f64 {
    p[0] / x + p[1] * x.ln() / x + p[2] / (x * x) + p[3]
}

fn j_cmp(x: f64, _p: &[f64]) -> Vec<f64> {
    vec![1.0 / x, x.ln() / x, 1.0 / (x * x), 1.0]
}

/// Outcome of fitting one closed-form model to one phase's data.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub params: Array1<f64>,
    pub covariance: Array2<f64>,
    pub mean_abs_rel_err: f64,
}

/// Levenberg-Marquardt with an analytic Jacobian, on dense `ndarray` arrays.
/// `eval`/`jac` take the row index and the current parameter vector.
fn levenberg_marquardt(
    ys: &[f64],
    initial: Vec<f64>,
    eval: impl Fn(usize, &[f64]) -> f64,
    jac: impl Fn(usize, &[f64]) -> Vec<f64>,
) -> FitResult {
    let n = ys.len();
    let p = initial.len();
    let mut params = initial;
    let mut lambda = 1e-3;

    let cost_of = |params: &[f64]| -> f64 {
        (0..n).map(|i| (ys[i] - eval(i, params)).powi(2)).sum::<f64>()
    };
    let mut cost = cost_of(&params);

    for _ in 0..200 {
        let mut jt_j = Array2::<f64>::zeros((p, p));
        let mut jt_r = Array1::<f64>::zeros(p);
        for i in 0..n {
            let row = jac(i, &params);
            let resid = ys[i] - eval(i, &params);
            for a in 0..p {
                jt_r[a] += row[a] * resid;
                for b in 0..p {
                    jt_j[[a, b]] += row[a] * row[b];
                }
            }
        }

        let mut accepted = false;
        for _ in 0..10 {
            let mut damped = jt_j.clone();
            for a in 0..p {
                damped[[a, a]] *= 1.0 + lambda;
            }
            let Some(delta) = linalg::solve(&damped, &jt_r) else {
                lambda *= 10.0;
                continue;
            };
            let candidate: Vec<f64> = params.iter().zip(delta.iter()).map(|(&p, &d)| p + d).collect();
            let candidate_cost = cost_of(&candidate);
            if candidate_cost.is_finite() && candidate_cost <= cost {
                let delta_norm: f64 = delta.iter().map(|v| v * v).sum::<f64>().sqrt();
                params = candidate;
                cost = candidate_cost;
                lambda = (lambda * 0.5).max(1e-12);
                accepted = delta_norm > 1e-10;
                break;
            } else {
                lambda *= 10.0;
            }
        }
        if !accepted {
            break;
        }
    }

    // sigma^2 (J^T J)^-1 covariance estimate at the converged point.
    let mut jt_j = Array2::<f64>::zeros((p, p));
    for i in 0..n {
        let row = jac(i, &params);
        for a in 0..p {
            for b in 0..p {
                jt_j[[a, b]] += row[a] * row[b];
            }
        }
    }
    let dof = (n.saturating_sub(p)).max(1) as f64;
    let sigma2 = cost / dof;
    let mut covariance = Array2::<f64>::zeros((p, p));
    for col in 0..p {
        let mut e = Array1::<f64>::zeros(p);
        e[col] = 1.0;
        if let Some(inv_col) = linalg::solve(&jt_j, &e) {
            for row in 0..p {
                covariance[[row, col]] = sigma2 * inv_col[row];
            }
        }
    }

    let mut rel_errs = Vec::with_capacity(n);
    for i in 0..n {
        let pred = eval(i, &params);
        if ys[i].abs() > 1e-9 {
            rel_errs.push(((ys[i] - pred) / ys[i]).abs());
        }
    }
    let mean_abs_rel_err = if rel_errs.is_empty() {
        0.0
    } else {
        rel_errs.iter().sum::<f64>() / rel_errs.len() as f64
    };

    FitResult {
        params: Array1::from(params),
        covariance,
        mean_abs_rel_err,
    }
}

fn fit_io(xs: &[f64], ys: &[f64]) -> FitResult {
    let mean_y = ys.iter().sum::<f64>() / ys.len().max(1) as f64;
    levenberg_marquardt(
        ys,
        vec![1.0, mean_y.max(0.01)],
        |i, p| f_io(xs[i], p),
        |i, p| j_io(xs[i], p),
    )
}

fn fit_io2(xs: &[f64], parent_ds: &[f64], ys: &[f64]) -> FitResult {
    let mean_y = ys.iter().sum::<f64>() / ys.len().max(1) as f64;
    levenberg_marquardt(
        ys,
        vec![1.0, 0.1, mean_y.max(0.01)],
        |i, p| f_io2(xs[i], parent_ds[i], p),
        |i, p| j_io2(xs[i], parent_ds[i], p),
    )
}

fn fit_cmp(xs: &[f64], ys: &[f64]) -> FitResult {
    let mean_y = ys.iter().sum::<f64>() / ys.len().max(1) as f64;
    levenberg_marquardt(
        ys,
        vec![1.0, 1.0, 1.0, mean_y.max(0.01)],
        |i, p| f_cmp(xs[i], p),
        |i, p| j_cmp(xs[i], p),
    )
}

/// Which closed form a phase was fit against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseModel {
    Io,
    Io2,
    Cmp,
}

#[derive(Debug, Clone)]
struct PhaseFit {
    model: PhaseModel,
    /// `true` when this phase was fit on `x = k*d` rather than `x = d`
    /// (only meaningful for `allow_parallel` stages).
    uses_kd: bool,
    params: Array1<f64>,
    covariance: Array2<f64>,
}

/// The reduced five-coefficient closed form shared by latency and cost
/// prediction and by symbolic emission (§4.1, §4.4). `c_kd_or_pd` is the
/// `1/(k*d)` coefficient for `allow_parallel` stages, and the parent-`d`
/// coefficient for non-parallel stages with `parent_relevant` set — the same
/// parameter-vector slot carries both meanings, matching the 6-wide layout
/// of §4.4.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReducedCoeffs {
    pub cold: f64,
    pub c_x: f64,
    pub c_kd_or_pd: f64,
    pub c_logx: f64,
    pub c_x2: f64,
    pub c_const: f64,
}

impl ReducedCoeffs {
    pub fn as_array(&self) -> [f64; 6] {
        [self.cold, self.c_x, self.c_kd_or_pd, self.c_logx, self.c_x2, self.c_const]
    }
}

fn accumulate_phase(r: &mut ReducedCoeffs, allow_parallel: bool, model: PhaseModel, uses_kd: bool, params: &[f64]) {
    match model {
        PhaseModel::Io => {
            if allow_parallel && uses_kd {
                r.c_kd_or_pd += params[0];
            } else {
                r.c_x += params[0];
            }
            r.c_const += params[1];
        }
        PhaseModel::Io2 => {
            r.c_x += params[0];
            r.c_kd_or_pd += params[1];
            r.c_const += params[2];
        }
        PhaseModel::Cmp => {
            if allow_parallel && uses_kd {
                r.c_kd_or_pd += params[0];
            } else {
                r.c_x += params[0];
            }
            r.c_logx += params[1];
            r.c_x2 += params[2];
            r.c_const += params[3];
        }
    }
}

/// Fitted performance model for one workflow stage.
#[derive(Debug, Clone)]
pub struct StagePerfModel {
    pub allow_parallel: bool,
    pub has_parent: bool,
    pub parent_relevant: bool,
    /// `[read, compute, write]`: whether each phase was fit on `k*d`.
    pub can_intra_parallel: [bool; 3],
    cold_samples: Vec<f64>,
    read_fit: PhaseFit,
    compute_fit: PhaseFit,
    write_fit: PhaseFit,
}

impl StagePerfModel {
    /// Fit read/compute/write closed forms per §4.1's selection rules.
    pub fn train(
        cold_samples: Vec<f64>,
        allow_parallel: bool,
        has_parent: bool,
        samples: &[TrainingSample],
    ) -> Result<StagePerfModel, JolteonError> {
        if samples.is_empty() {
            return Err(JolteonError::Fit {
                stage: "<unnamed>".to_string(),
                reason: "no training samples".to_string(),
            });
        }
        let ds: Vec<f64> = samples.iter().map(|s| s.d).collect();
        let ks: Vec<f64> = samples.iter().map(|s| s.k).collect();
        let kds: Vec<f64> = samples.iter().map(|s| s.k * s.d).collect();
        let reads: Vec<f64> = samples.iter().map(|s| s.read).collect();
        let computes: Vec<f64> = samples.iter().map(|s| s.compute).collect();
        let writes: Vec<f64> = samples.iter().map(|s| s.write).collect();

        let mut parent_relevant = false;

        let (read_fit, compute_fit, write_fit) = if allow_parallel {
            let read = pick_io_variant(&ds, &kds, &reads);
            let write = pick_io_variant(&ds, &kds, &writes);
            let compute = pick_cmp_variant(&ds, &kds, &computes);
            (read, compute, write)
        } else {
            let read_plain = fit_io(&ks, &reads);
            let read = if has_parent {
                let parent_ds: Vec<f64> = samples
                    .iter()
                    .map(|s| s.parent_d.expect("has_parent implies parent_d present"))
                    .collect();
                let read_io2 = fit_io2(&ks, &parent_ds, &reads);
                if read_io2.mean_abs_rel_err < read_plain.mean_abs_rel_err {
                    parent_relevant = true;
                    PhaseFit { model: PhaseModel::Io2, uses_kd: false, params: read_io2.params, covariance: read_io2.covariance }
                } else {
                    PhaseFit { model: PhaseModel::Io, uses_kd: false, params: read_plain.params, covariance: read_plain.covariance }
                }
            } else {
                PhaseFit { model: PhaseModel::Io, uses_kd: false, params: read_plain.params, covariance: read_plain.covariance }
            };
            let compute_r = fit_cmp(&ks, &computes);
            let compute = PhaseFit { model: PhaseModel::Cmp, uses_kd: false, params: compute_r.params, covariance: compute_r.covariance };
            let write_r = fit_io(&ks, &writes);
            let write = PhaseFit { model: PhaseModel::Io, uses_kd: false, params: write_r.params, covariance: write_r.covariance };
            (read, compute, write)
        };

        let can_intra_parallel = [read_fit.uses_kd, compute_fit.uses_kd, write_fit.uses_kd];

        Ok(StagePerfModel {
            allow_parallel,
            has_parent,
            parent_relevant,
            can_intra_parallel,
            cold_samples,
            read_fit,
            compute_fit,
            write_fit,
        })
    }

    /// `x` that compute's fit used; governs the log/x^2 terms at predict time.
    pub fn compute_uses_kd(&self) -> bool {
        self.allow_parallel && self.compute_fit.uses_kd
    }

    /// Collapse the fitted phases into the five-coefficient reduced form,
    /// with `cold` taken as the given percentile (0.0-1.0) of the empirical
    /// cold-start sample.
    pub fn reduced_coefficients(&self, cold_percentile: f64) -> ReducedCoeffs {
        let mut r = ReducedCoeffs {
            cold: percentile(&self.cold_samples, cold_percentile),
            ..Default::default()
        };
        accumulate_phase(&mut r, self.allow_parallel, self.read_fit.model, self.read_fit.uses_kd, self.read_fit.params.as_slice().unwrap());
        accumulate_phase(&mut r, self.allow_parallel, self.compute_fit.model, self.compute_fit.uses_kd, self.compute_fit.params.as_slice().unwrap());
        accumulate_phase(&mut r, self.allow_parallel, self.write_fit.model, self.write_fit.uses_kd, self.write_fit.params.as_slice().unwrap());
        r
    }

    /// Predicted latency in seconds for decision `(d, k)`, with `parent_d`
    /// required when `!allow_parallel && parent_relevant`.
    pub fn predict_latency(&self, d: f64, k: f64, parent_d: Option<f64>, cold_percentile: f64) -> f64 {
        let r = self.reduced_coefficients(cold_percentile);
        if self.allow_parallel {
            let x = if self.compute_uses_kd() { k * d } else { d };
            r.cold + r.c_x / d + r.c_kd_or_pd / (k * d) + r.c_logx * x.ln() / x + r.c_x2 / (x * x) + r.c_const
        } else {
            let x = k;
            let pd = parent_d.unwrap_or(0.0);
            r.cold + r.c_x / k + r.c_kd_or_pd * pd + r.c_logx * x.ln() / x + r.c_x2 / (x * x) + r.c_const
        }
    }

    /// Predicted cost for decision `(d, k)` (§4.1): cold uses the p0
    /// percentile to avoid double-counting queueing delay already folded
    /// into the workflow-level latency prediction.
    pub fn predict_cost(&self, d: f64, k: f64, parent_d: Option<f64>) -> f64 {
        let t = self.predict_latency(d, k, parent_d, 0.0);
        (t * k * d * crate::constants::COST_ALPHA + crate::constants::COST_BETA * d) / crate::constants::COST_SCALE
    }

    /// Draw `n` Monte-Carlo rows of `(cold, c_x, c_kd_or_pd, c_logx, c_x2, c_const)`,
    /// resampling cold from the empirical sample and drawing each phase's
    /// parameter vector from `N(theta_phase, Sigma_phase)`.
    pub fn sample_offline(&self, n: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut out = Array2::<f64>::zeros((n, 6));
        for row in 0..n {
            let cold_idx = rng.gen_range(0..self.cold_samples.len().max(1));
            let cold = self.cold_samples.get(cold_idx).copied().unwrap_or(0.0);

            let mut r = ReducedCoeffs { cold, ..Default::default() };
            for fit in [&self.read_fit, &self.compute_fit, &self.write_fit] {
                let drawn = mvn_sample(&fit.params, &fit.covariance, &mut rng);
                accumulate_phase(&mut r, self.allow_parallel, fit.model, fit.uses_kd, drawn.as_slice().unwrap());
            }
            let row_vals = r.as_array();
            for (col, v) in row_vals.into_iter().enumerate() {
                out[[row, col]] = v;
            }
        }
        out
    }
}

fn pick_io_variant(ds: &[f64], kds: &[f64], ys: &[f64]) -> PhaseFit {
    let on_d = fit_io(ds, ys);
    let on_kd = fit_io(kds, ys);
    if on_kd.mean_abs_rel_err < on_d.mean_abs_rel_err {
        PhaseFit { model: PhaseModel::Io, uses_kd: true, params: on_kd.params, covariance: on_kd.covariance }
    } else {
        PhaseFit { model: PhaseModel::Io, uses_kd: false, params: on_d.params, covariance: on_d.covariance }
    }
}

fn pick_cmp_variant(ds: &[f64], kds: &[f64], ys: &[f64]) -> PhaseFit {
    let on_d = fit_cmp(ds, ys);
    let on_kd = fit_cmp(kds, ys);
    if on_kd.mean_abs_rel_err < on_d.mean_abs_rel_err {
        PhaseFit { model: PhaseModel::Cmp, uses_kd: true, params: on_kd.params, covariance: on_kd.covariance }
    } else {
        PhaseFit { model: PhaseModel::Cmp, uses_kd: false, params: on_d.params, covariance: on_d.covariance }
    }
}

fn mvn_sample(mean: &Array1<f64>, cov: &Array2<f64>, rng: &mut StdRng) -> Array1<f64> {
    let p = mean.len();
    match linalg::cholesky(cov) {
        Some(l) => {
            let z: Array1<f64> = (0..p).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
            mean.clone() + l.dot(&z)
        }
        None => mean.clone(),
    }
}

/// Percentile (fraction in `[0, 1]`) of an empirical sample via `statrs`'s
/// order-statistics support.
fn percentile(samples: &[f64], frac: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut data = Data::new(samples.to_vec());
    data.percentile((frac * 100.0).round().clamp(0.0, 100.0) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth_io_samples(a: f64, b: f64) -> Vec<TrainingSample> {
        let mut out = Vec::new();
        for &d in &[1.0, 2.0, 4.0, 8.0] {
            for &k in &[0.5, 1.0, 2.0, 3.0] {
                let x = d; // read/write fit against d in the allow_parallel branch
                let val = a / x + b;
                out.push(TrainingSample { d, k, parent_d: None, read: val, compute: val, write: val });
            }
        }
        out
    }

    #[test]
    fn recovers_io_parameters_within_tolerance() {
        let samples = synth_io_samples(3.0, 0.2);
        let model = StagePerfModel::train(vec![0.01, 0.02, 0.015], true, false, &samples).unwrap();
        let r = model.reduced_coefficients(0.7);
        // read + write both contribute an `a` to whichever slot they used.
        let recovered_a = r.c_x + r.c_kd_or_pd;
        assert!((recovered_a - 6.0).abs() / 6.0 < 0.05, "recovered {recovered_a}");
    }

    #[test]
    fn cost_increases_as_k_grows_for_fixed_d() {
        let samples = synth_io_samples(3.0, 0.2);
        let model = StagePerfModel::train(vec![0.01], true, false, &samples).unwrap();
        let c1 = model.predict_cost(2.0, 1.0, None);
        let c2 = model.predict_cost(2.0, 2.0, None);
        // `predict_cost` is `(t*k*d*alpha + beta*d)/scale`; for fixed d this
        // is increasing in k whenever predicted latency stays positive, so
        // cost grows with k rather than shrinking. This is the opposite of
        // the spec's literal "monotone decreasing in k" wording for scenario
        // 1, which describes latency's direction, not cost's; the cost
        // formula itself (matching the original implementation) is
        // increasing in k.
        assert!(c1.is_finite() && c2.is_finite());
        assert!(c2 > c1, "expected cost to increase with k: c1={c1} c2={c2}");
    }

    #[test]
    fn non_parallel_pins_can_intra_parallel_false() {
        let samples: Vec<TrainingSample> = (1..=8)
            .map(|i| TrainingSample { d: 1.0, k: i as f64 * 0.3, parent_d: Some(1.0), read: 1.0 / (i as f64 * 0.3) + 0.1, compute: 1.0, write: 1.0 })
            .collect();
        let model = StagePerfModel::train(vec![0.01], false, true, &samples).unwrap();
        assert_eq!(model.can_intra_parallel, [false, false, false]);
    }

    #[test]
    fn offline_sampling_is_deterministic_under_fixed_seed() {
        let samples = synth_io_samples(3.0, 0.2);
        let model = StagePerfModel::train(vec![0.01, 0.02], true, false, &samples).unwrap();
        let s1 = model.sample_offline(16, crate::constants::DEFAULT_SAMPLE_SEED);
        let s2 = model.sample_offline(16, crate::constants::DEFAULT_SAMPLE_SEED);
        assert_eq!(s1, s2);
    }
}
