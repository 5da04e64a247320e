//! Workflow graph: config parsing, DAG validation, path enumeration, and
//! latency/cost prediction (§4.2).

use std::collections::{BTreeMap, VecDeque};

use serde::Deserialize;

use crate::error::JolteonError;
use crate::stage::Stage;

#[derive(Debug, Deserialize)]
struct StageConfig {
    stage_name: String,
    #[serde(default)]
    parents: Vec<usize>,
    #[serde(default)]
    children: Vec<usize>,
    #[serde(default, deserialize_with = "deserialize_allow_parallel")]
    allow_parallel: Option<bool>,
    #[serde(default)]
    input_files: Vec<String>,
    #[serde(default)]
    output_files: Vec<String>,
    #[serde(default)]
    read_pattern: Option<String>,
    #[serde(default)]
    extra_args: Option<serde_json::Value>,
}

fn deserialize_allow_parallel<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Bool(b)) => Some(b),
        Some(serde_json::Value::String(s)) => match s.as_str() {
            "true" | "True" => Some(true),
            "false" | "False" => Some(false),
            other => return Err(serde::de::Error::custom(format!("invalid allow_parallel value: {other}"))),
        },
        _ => return Err(serde::de::Error::custom("allow_parallel must be a bool or true/false string")),
    })
}

#[derive(Debug, Deserialize)]
struct WorkflowConfigFile {
    num_stages: usize,
    workflow_name: String,
    #[serde(default)]
    critical_path: Option<Vec<usize>>,
    #[serde(default)]
    secondary_path: Option<Vec<usize>>,
    stages: BTreeMap<String, StageConfig>,
}

/// A parsed, DAG-validated workflow ready for profiling, fitting, and
/// scheduling.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub stages: Vec<Stage>,
    pub sources: Vec<usize>,
    pub sinks: Vec<usize>,
    pub critical_path: Option<Vec<usize>>,
    pub secondary_path: Option<Vec<usize>>,
}

impl Workflow {
    /// Parse a workflow config file (§6), validating parent/child symmetry
    /// and that the graph is a DAG via Kahn's algorithm.
    pub fn parse_config(json: &str) -> Result<Workflow, JolteonError> {
        let raw: WorkflowConfigFile =
            serde_json::from_str(json).map_err(|e| JolteonError::ConfigParse(e.to_string()))?;

        let mut stages = Vec::with_capacity(raw.num_stages);
        for i in 0..raw.num_stages {
            let key = i.to_string();
            let cfg = raw
                .stages
                .get(&key)
                .ok_or_else(|| JolteonError::ConfigParse(format!("missing stage config for index {i}")))?;
            let mut stage = Stage::new(
                i,
                cfg.stage_name.clone(),
                cfg.parents.clone(),
                cfg.children.clone(),
                cfg.allow_parallel.unwrap_or(true),
            );
            stage.input_files = cfg.input_files.clone();
            stage.output_files = cfg.output_files.clone();
            stage.read_pattern = cfg.read_pattern.clone();
            stage.extra_args = cfg.extra_args.clone();
            stages.push(stage);
        }

        for stage in &stages {
            for &p in &stage.parents {
                let parent = stages
                    .get(p)
                    .ok_or_else(|| JolteonError::ConfigParse(format!("stage {p} referenced but does not exist")))?;
                if !parent.children.contains(&stage.index) {
                    return Err(JolteonError::ConfigParse(format!(
                        "parent/child asymmetry: {} lists {} as parent but {} does not list it as child",
                        stage.index, p, p
                    )));
                }
            }
            for &c in &stage.children {
                let child = stages
                    .get(c)
                    .ok_or_else(|| JolteonError::ConfigParse(format!("stage {c} referenced but does not exist")))?;
                if !child.parents.contains(&stage.index) {
                    return Err(JolteonError::ConfigParse(format!(
                        "parent/child asymmetry: {} lists {} as child but {} does not list it as parent",
                        stage.index, c, c
                    )));
                }
            }
        }

        check_dag(&stages)?;

        let sources: Vec<usize> = stages.iter().filter(|s| s.parents.is_empty()).map(|s| s.index).collect();
        let sinks: Vec<usize> = stages.iter().filter(|s| s.children.is_empty()).map(|s| s.index).collect();

        Ok(Workflow {
            name: raw.workflow_name,
            stages,
            sources,
            sinks,
            critical_path: raw.critical_path,
            secondary_path: raw.secondary_path,
        })
    }

    /// Enumerate every source-to-sink walk along existing edges.
    pub fn find_paths(&self) -> Vec<Vec<usize>> {
        let mut paths = Vec::new();
        for &source in &self.sources {
            let mut queue: VecDeque<Vec<usize>> = VecDeque::new();
            queue.push_back(vec![source]);
            while let Some(path) = queue.pop_front() {
                let tip = *path.last().unwrap();
                if self.stages[tip].children.is_empty() {
                    paths.push(path);
                    continue;
                }
                for &child in &self.stages[tip].children {
                    if path.contains(&child) {
                        continue;
                    }
                    let mut extended = path.clone();
                    extended.push(child);
                    queue.push_back(extended);
                }
            }
        }
        paths
    }

    fn stage_parent_d(&self, idx: usize) -> Option<f64> {
        self.stages[idx].parents.first().map(|&p| self.stages[p].num_func as f64)
    }

    fn stage_latency(&self, idx: usize, cold_percentile: f64) -> Result<f64, JolteonError> {
        let stage = &self.stages[idx];
        let model = stage
            .model
            .as_ref()
            .ok_or_else(|| JolteonError::Fit { stage: stage.name.clone(), reason: "model not trained".into() })?;
        let d = stage.num_func as f64;
        let k = stage.vcpu_per_func();
        let parent_d = self.stage_parent_d(idx);
        Ok(model.predict_latency(d, k, parent_d, cold_percentile))
    }

    fn stage_cost(&self, idx: usize) -> Result<f64, JolteonError> {
        let stage = &self.stages[idx];
        let model = stage
            .model
            .as_ref()
            .ok_or_else(|| JolteonError::Fit { stage: stage.name.clone(), reason: "model not trained".into() })?;
        let d = stage.num_func as f64;
        let k = stage.vcpu_per_func();
        let parent_d = self.stage_parent_d(idx);
        Ok(model.predict_cost(d, k, parent_d))
    }

    /// Maximum over all source-to-sink paths of summed per-stage latency.
    pub fn predict_latency(&self, cold_percentile: f64) -> Result<f64, JolteonError> {
        let paths = self.find_paths();
        let mut best = f64::MIN;
        for path in &paths {
            let mut total = 0.0;
            for &idx in path {
                total += self.stage_latency(idx, cold_percentile)?;
            }
            best = best.max(total);
        }
        Ok(best)
    }

    /// Sum of per-stage cost predictions across all stages.
    pub fn predict_cost(&self) -> Result<f64, JolteonError> {
        let mut total = 0.0;
        for idx in 0..self.stages.len() {
            total += self.stage_cost(idx)?;
        }
        Ok(total)
    }
}

/// Kahn's-algorithm DAG validation: fails if any node is unreachable by
/// topological drain (i.e. a cycle exists).
fn check_dag(stages: &[Stage]) -> Result<(), JolteonError> {
    let n = stages.len();
    let mut in_degree = vec![0usize; n];
    for stage in stages {
        for &_p in &stage.parents {
            in_degree[stage.index] += 1;
        }
    }
    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut visited = 0usize;
    let mut remaining = in_degree.clone();
    while let Some(idx) = queue.pop_front() {
        visited += 1;
        for &child in &stages[idx].children {
            remaining[child] -= 1;
            if remaining[child] == 0 {
                queue.push_back(child);
            }
        }
    }
    if visited != n {
        return Err(JolteonError::ConfigParse("graph contains a cycle".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_config(json_allow_parallel: &str) -> String {
        format!(
            r#"{{
                "num_stages": 4,
                "workflow_name": "linear",
                "stages": {{
                    "0": {{"stage_name": "s0", "parents": [], "children": [1], "allow_parallel": true}},
                    "1": {{"stage_name": "s1", "parents": [0], "children": [2], "allow_parallel": true}},
                    "2": {{"stage_name": "s2", "parents": [1], "children": [3], "allow_parallel": true}},
                    "3": {{"stage_name": "s3", "parents": [2], "children": [], "allow_parallel": {json_allow_parallel}}}
                }}
            }}"#
        )
    }

    #[test]
    fn parses_linear_dag_and_finds_single_path() {
        let wf = Workflow::parse_config(&linear_config("true")).unwrap();
        assert_eq!(wf.sources, vec![0]);
        assert_eq!(wf.sinks, vec![3]);
        let paths = wf.find_paths();
        assert_eq!(paths, vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn allow_parallel_string_variants_parse() {
        let wf = Workflow::parse_config(&linear_config("\"False\"")).unwrap();
        assert!(!wf.stages[3].allow_parallel);
    }

    #[test]
    fn rejects_cycles() {
        let json = r#"{
            "num_stages": 2,
            "workflow_name": "cyclic",
            "stages": {
                "0": {"stage_name": "s0", "parents": [1], "children": [1]},
                "1": {"stage_name": "s1", "parents": [0], "children": [0]}
            }
        }"#;
        assert!(Workflow::parse_config(json).is_err());
    }

    #[test]
    fn rejects_asymmetric_parent_child_lists() {
        let json = r#"{
            "num_stages": 2,
            "workflow_name": "asym",
            "stages": {
                "0": {"stage_name": "s0", "parents": [], "children": [1]},
                "1": {"stage_name": "s1", "parents": [], "children": []}
            }
        }"#;
        assert!(Workflow::parse_config(json).is_err());
    }

    #[test]
    fn diamond_dag_finds_two_paths() {
        let json = r#"{
            "num_stages": 4,
            "workflow_name": "diamond",
            "stages": {
                "0": {"stage_name": "s0", "parents": [], "children": [1, 2]},
                "1": {"stage_name": "s1", "parents": [0], "children": [3]},
                "2": {"stage_name": "s2", "parents": [0], "children": [3]},
                "3": {"stage_name": "s3", "parents": [1, 2], "children": []}
            }
        }"#;
        let wf = Workflow::parse_config(json).unwrap();
        let paths = wf.find_paths();
        assert_eq!(paths.len(), 2);
    }
}
