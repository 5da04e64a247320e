//! Symbolic function emitter (§4.4): builds the `Expr` trees for the
//! objective, primary constraint, and optional secondary constraint that the
//! PCP solver optimises against. Each stage's contribution is a pure
//! function of its fit-time flags and its index in the parameter layout
//! (`p[6i..6i+6]`, `x[2i..2i+2]`), never of mutable state.

use crate::expr::Expr;
use crate::perf_model::StagePerfModel;
use crate::workflow::Workflow;

/// `bound_type` passed to the scheduler (§4.6, §6 `-bt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundType {
    Latency,
    Cost,
}

/// The emitted problem: one objective and up to two constraints, all raw
/// (solver subtracts `bound` at evaluation time).
pub struct EmittedProblem {
    pub objective: Expr,
    pub constraint: Expr,
    pub constraint2: Option<Expr>,
}

/// One stage's latency contribution, per §4.1's reduced closed form.
pub fn stage_latency_expr(stage_index: usize, parent_index: Option<usize>, model: &StagePerfModel) -> Expr {
    let base = 6 * stage_index;
    let cold = Expr::param(base);
    let c_x = Expr::param(base + 1);
    let c_kd_or_pd = Expr::param(base + 2);
    let c_logx = Expr::param(base + 3);
    let c_x2 = Expr::param(base + 4);
    let c_const = Expr::param(base + 5);

    let k = Expr::var(2 * stage_index + 1);

    if model.allow_parallel {
        let d = Expr::var(2 * stage_index);
        let x = if model.compute_uses_kd() { d.clone().mul(k.clone()) } else { d.clone() };
        let term_x = c_x.div(d.clone());
        let term_kd = c_kd_or_pd.div(d.mul(k));
        let term_logx = c_logx.mul(x.clone().ln().div(x.clone()));
        let term_x2 = c_x2.div(x.pow(2.0));
        Expr::sum(vec![cold, term_x, term_kd, term_logx, term_x2, c_const])
    } else {
        let parent_d = if model.parent_relevant {
            match parent_index {
                Some(p) => Expr::var(2 * p),
                None => Expr::konst(0.0),
            }
        } else {
            Expr::konst(0.0)
        };
        let term_x = c_x.div(k.clone());
        let term_pd = c_kd_or_pd.mul(parent_d);
        let term_logx = c_logx.mul(k.clone().ln().div(k.clone()));
        let term_x2 = c_x2.div(k.pow(2.0));
        Expr::sum(vec![cold, term_x, term_pd, term_logx, term_x2, c_const])
    }
}

/// One stage's cost contribution: `(T * k * d * alpha + beta * d) / scale`,
/// with `d` the literal `1` for non-`allow_parallel` stages and `T` taken
/// from [`stage_latency_expr`].
pub fn stage_cost_expr(stage_index: usize, parent_index: Option<usize>, model: &StagePerfModel) -> Expr {
    let latency = stage_latency_expr(stage_index, parent_index, model);
    let k = Expr::var(2 * stage_index + 1);
    let d = if model.allow_parallel { Expr::var(2 * stage_index) } else { Expr::konst(1.0) };
    let alpha = Expr::konst(crate::constants::COST_ALPHA);
    let beta = Expr::konst(crate::constants::COST_BETA);
    let scale = Expr::konst(crate::constants::COST_SCALE);
    latency
        .mul(k)
        .mul(d.clone())
        .mul(alpha)
        .add(beta.mul(d))
        .div(scale)
}

fn path_latency_expr(workflow: &Workflow, path: &[usize]) -> Expr {
    let terms = path
        .iter()
        .map(|&idx| {
            let model = workflow.stages[idx].model.as_ref().expect("stage must be trained before emission");
            let parent_index = workflow.stages[idx].parents.first().copied();
            stage_latency_expr(idx, parent_index, model)
        })
        .collect();
    Expr::sum(terms)
}

fn total_cost_expr(workflow: &Workflow) -> Expr {
    let terms = workflow
        .stages
        .iter()
        .map(|stage| {
            let model = stage.model.as_ref().expect("stage must be trained before emission");
            let parent_index = stage.parents.first().copied();
            stage_cost_expr(stage.index, parent_index, model)
        })
        .collect();
    Expr::sum(terms)
}

/// Build the objective/constraint(s) for a solve against `bound_type` at
/// `bound` (§4.4). When a secondary path exists, its role depends on the
/// bound type: another latency constraint under a latency bound, or a
/// "critical-path must not be shorter than secondary" constraint under a
/// cost bound (folded against the same `bound` field by adding it back in,
/// since that constraint is bound-independent).
pub fn emit(workflow: &Workflow, bound_type: BoundType, bound: f64) -> EmittedProblem {
    let critical_path = workflow
        .critical_path
        .clone()
        .unwrap_or_else(|| workflow.find_paths().into_iter().max_by_key(|p| p.len()).unwrap_or_default());
    let critical_latency = path_latency_expr(workflow, &critical_path);
    let secondary_latency = workflow.secondary_path.as_ref().map(|p| path_latency_expr(workflow, p));

    match bound_type {
        BoundType::Latency => {
            let objective = total_cost_expr(workflow);
            let constraint = critical_latency;
            let constraint2 = secondary_latency;
            EmittedProblem { objective, constraint, constraint2 }
        }
        BoundType::Cost => {
            let objective = critical_latency.clone();
            let constraint = total_cost_expr(workflow);
            let constraint2 = secondary_latency.map(|secondary| secondary.sub(critical_latency).add(Expr::konst(bound)));
            EmittedProblem { objective, constraint, constraint2 }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf_model::TrainingSample;

    fn trained_model() -> StagePerfModel {
        let samples: Vec<TrainingSample> = (1..=8)
            .map(|i| {
                let d = i as f64;
                TrainingSample { d, k: 1.0, parent_d: None, read: 2.0 / d + 0.1, compute: 2.0 / d + 0.1, write: 2.0 / d + 0.1 }
            })
            .collect();
        StagePerfModel::train(vec![0.02, 0.03], true, false, &samples).unwrap()
    }

    #[test]
    fn stage_expr_matches_direct_prediction() {
        let model = trained_model();
        let expr = stage_latency_expr(0, None, &model);
        let mut p = vec![0.0; 6];
        let r = model.reduced_coefficients(0.7);
        p[0..6].copy_from_slice(&r.as_array());
        let x = vec![2.0, 1.5];
        let via_expr = expr.eval(&x, &p);
        let via_model = model.predict_latency(2.0, 1.5, None, 0.7);
        assert!((via_expr - via_model).abs() < 1e-9);
    }
}
