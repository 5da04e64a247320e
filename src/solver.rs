//! The chance-constrained (PCP) solver (§4.5): a classical scenario-program
//! sample-size bound, and a box-projected penalty-method gradient descent
//! that minimises an [`Expr`]-valued objective subject to [`Expr`]-valued
//! scenario constraints.

use ndarray::Array2;
use rayon::prelude::*;

use crate::error::JolteonError;
use crate::expr::Expr;

/// Smallest `N` such that `sum_{k=0}^{n_x-1} C(N,k) eps^k (1-eps)^(N-k) <= beta`,
/// found by a monotone forward search over a numerically stable rolling
/// binomial-pmf update (never raw factorials/combinations).
pub fn sample_size(n_x: usize, risk: f64, confidence_error: f64) -> usize {
    let mut n = n_x.max(1);
    loop {
        if scenario_bound_satisfied(n, n_x, risk, confidence_error) {
            return n;
        }
        n += 1;
    }
}

fn scenario_bound_satisfied(n: usize, n_x: usize, eps: f64, beta: f64) -> bool {
    let nf = n as f64;
    let mut pmf = (1.0 - eps).powf(nf);
    let mut sum = pmf;
    for k in 1..n_x {
        let kf = k as f64;
        pmf *= (nf - kf + 1.0) / kf * (eps / (1.0 - eps));
        sum += pmf;
        if sum > beta {
            return false;
        }
    }
    sum <= beta
}

/// Outcome of a chance-constrained minimisation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    Optimal,
    Infeasible,
    MaxIterations,
}

/// One chance-constrained minimisation problem.
pub struct PcpProblem {
    pub objective: Expr,
    pub constraint: Expr,
    pub constraint2: Option<Expr>,
    pub bound: f64,
    pub theta_hat: Vec<f64>,
    /// N x (6*num_stages) scenario-parameter matrix.
    pub scenarios: Array2<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SolverResult {
    pub x: Vec<f64>,
    pub status: SolverStatus,
}

const OUTER_ITERS: usize = 30;
const INNER_ITERS: usize = 150;
const FEASIBILITY_TOL: f64 = 1e-6;
const INITIAL_MU: f64 = 1.0;
const MU_GROWTH: f64 = 3.0;
const MU_CAP: f64 = 1e8;

/// Box-projected penalty-method gradient descent. The outer loop grows a
/// quadratic penalty on the worst-violating scenario constraint; the inner
/// loop takes projected-gradient steps using the `Expr` tree's dual-number
/// gradient.
pub fn solve(problem: &PcpProblem, initial: Option<Vec<f64>>) -> Result<SolverResult, JolteonError> {
    let n = problem.lower.len();
    let mut x = initial.unwrap_or_else(|| {
        (0..n).map(|i| (problem.lower[i] + problem.upper[i]) / 2.0).collect()
    });
    project_box(&mut x, &problem.lower, &problem.upper);

    let mut mu = INITIAL_MU;
    let mut last_violation = f64::INFINITY;

    for _outer in 0..OUTER_ITERS {
        let mut lr = 0.05;
        for _inner in 0..INNER_ITERS {
            let obj = problem.objective.eval_grad(&x, &problem.theta_hat);
            let (violation, viol_grad) = worst_violation(problem, &x);

            let mut total_grad = obj.grad.clone();
            if violation > 0.0 {
                let coeff = 2.0 * mu * violation;
                for i in 0..n {
                    total_grad[i] += coeff * viol_grad[i];
                }
            }
            let total_cost = obj.val + mu * violation.max(0.0).powi(2);

            let mut candidate = x.clone();
            for i in 0..n {
                candidate[i] -= lr * total_grad[i];
            }
            project_box(&mut candidate, &problem.lower, &problem.upper);

            let cand_obj = problem.objective.eval(&candidate, &problem.theta_hat);
            let (cand_violation, _) = worst_violation(problem, &candidate);
            let cand_cost = cand_obj + mu * cand_violation.max(0.0).powi(2);

            if cand_cost.is_finite() && cand_cost <= total_cost {
                x = candidate;
                lr *= 1.1;
            } else {
                lr *= 0.5;
                if lr < 1e-12 {
                    break;
                }
            }
        }

        let (violation, _) = worst_violation(problem, &x);
        last_violation = violation;
        if violation <= FEASIBILITY_TOL {
            return Ok(SolverResult { x, status: SolverStatus::Optimal });
        }
        mu = (mu * MU_GROWTH).min(MU_CAP);
    }

    if last_violation <= FEASIBILITY_TOL {
        Ok(SolverResult { x, status: SolverStatus::Optimal })
    } else if last_violation.is_finite() {
        Err(JolteonError::Infeasible { iterations: OUTER_ITERS * INNER_ITERS })
    } else {
        Ok(SolverResult { x, status: SolverStatus::MaxIterations })
    }
}

/// Worst-case (constraint, gradient) across every scenario row and both
/// constraint callables, via a parallel fold-to-max over `rayon`'s
/// work-stealing pool (pure and order-independent).
fn worst_violation(problem: &PcpProblem, x: &[f64]) -> (f64, Vec<f64>) {
    let n_rows = problem.scenarios.nrows();
    let bound = problem.bound;

    let (worst_idx, worst_is_secondary, worst_val) = (0..n_rows)
        .into_par_iter()
        .map(|row| {
            let p: Vec<f64> = problem.scenarios.row(row).to_vec();
            let v1 = problem.constraint.eval(x, &p) - bound;
            match &problem.constraint2 {
                Some(c2) => {
                    let v2 = c2.eval(x, &p) - bound;
                    if v2 > v1 {
                        (row, true, v2)
                    } else {
                        (row, false, v1)
                    }
                }
                None => (row, false, v1),
            }
        })
        .reduce(
            || (0usize, false, f64::NEG_INFINITY),
            |a, b| if b.2 > a.2 { b } else { a },
        );

    if worst_val <= 0.0 {
        return (worst_val, vec![0.0; x.len()]);
    }

    let p: Vec<f64> = problem.scenarios.row(worst_idx).to_vec();
    let dual = if worst_is_secondary {
        problem.constraint2.as_ref().unwrap().eval_grad(x, &p)
    } else {
        problem.constraint.eval_grad(x, &p)
    };
    (worst_val, dual.grad)
}

fn project_box(x: &mut [f64], lower: &[f64], upper: &[f64]) {
    for i in 0..x.len() {
        x[i] = x[i].clamp(lower[i], upper[i]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn sample_size_lands_in_expected_range() {
        let n = sample_size(14, 0.05, 0.001);
        assert!((1000..=2000).contains(&n), "n={n}");
    }

    #[test]
    fn sample_size_is_monotone_in_n_x() {
        let small = sample_size(4, 0.05, 0.001);
        let large = sample_size(14, 0.05, 0.001);
        assert!(large >= small);
    }

    #[test]
    fn sample_size_is_monotone_in_risk() {
        let tight = sample_size(10, 0.01, 0.001);
        let loose = sample_size(10, 0.1, 0.001);
        assert!(tight >= loose);
    }

    #[test]
    fn solves_trivial_linear_problem() {
        // minimize x0 subject to (x0 - 1) <= 0, box [0, 10].
        let objective = Expr::var(0);
        let constraint = Expr::var(0).sub(Expr::konst(1.0));
        let problem = PcpProblem {
            objective,
            constraint,
            constraint2: None,
            bound: 0.0,
            theta_hat: vec![],
            scenarios: Array2::zeros((4, 1)),
            lower: vec![0.0],
            upper: vec![10.0],
        };
        let result = solve(&problem, None).expect("solvable");
        assert_eq!(result.status, SolverStatus::Optimal);
        assert!(result.x[0] >= 0.0 && result.x[0] <= 1.0 + 1e-3);
    }
}
