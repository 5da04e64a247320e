//! External collaborator boundary (§6): the real Lambda-style invocation and
//! function-management clients are out of scope (§1), so the core only
//! depends on these two traits. `LocalSimulator` is the in-memory fake used
//! by tests and by the CLI's `--simulate` mode.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::json;

use crate::error::JolteonError;

/// One invocation's raw result: a JSON body (the `breakdown`/`orca` payload
/// shape of §6) and the provider's log text.
pub trait FunctionInvoker: Send + Sync {
    fn invoke(&self, stage: &str, payload: &serde_json::Value) -> Result<(serde_json::Value, String), JolteonError>;
}

/// Pushes a memory configuration to a deployed function. May fail with a
/// transient "resource conflict" (§5) which the profiler treats as fatal.
pub trait FunctionManager: Send + Sync {
    fn update_config(&self, stage: &str, memory_mb: f64) -> Result<bool, JolteonError>;
}

/// In-memory fake standing in for the real cloud-function clients. Produces
/// a synthetic `a/x + b`-shaped breakdown so invocations are deterministic
/// and billing fields are always well-formed.
pub struct LocalSimulator {
    configs: Mutex<HashMap<String, f64>>,
    updating: Mutex<Vec<String>>,
}

impl Default for LocalSimulator {
    fn default() -> Self {
        LocalSimulator { configs: Mutex::new(HashMap::new()), updating: Mutex::new(Vec::new()) }
    }
}

impl LocalSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn memory_for(&self, stage: &str) -> f64 {
        *self.configs.lock().unwrap().get(stage).unwrap_or(&1792.0)
    }
}

impl FunctionManager for LocalSimulator {
    fn update_config(&self, stage: &str, memory_mb: f64) -> Result<bool, JolteonError> {
        let mut updating = self.updating.lock().unwrap();
        if updating.iter().any(|s| s == stage) {
            return Err(JolteonError::ProfileUpdate {
                stage: stage.to_string(),
                reason: "update already in progress".to_string(),
            });
        }
        updating.push(stage.to_string());
        self.configs.lock().unwrap().insert(stage.to_string(), memory_mb);
        updating.retain(|s| s != stage);
        Ok(true)
    }
}

impl FunctionInvoker for LocalSimulator {
    fn invoke(&self, stage: &str, payload: &serde_json::Value) -> Result<(serde_json::Value, String), JolteonError> {
        let num_func = payload.get("num_func").and_then(|v| v.as_f64()).unwrap_or(1.0);
        let memory_mb = self.memory_for(stage);
        let k = memory_mb / crate::constants::MB_PER_VCPU;
        let x = (k * num_func).max(0.05);

        let read = 1.0 / x + 0.05;
        let compute = 1.0 / x + 0.1 * x.ln() / x + 0.2 / (x * x) + 0.1;
        let write = 0.5 / x + 0.05;
        let read_start = 0.0;
        let read_end = read_start + read;
        let compute_end = read_end + compute;
        let write_end = compute_end + write;

        let body = json!({ "breakdown": [read_start, read_end, compute_end, write_end] });

        let duration_ms = write_end * 1000.0;
        let billed_ms = duration_ms.ceil();
        let memory_used = (memory_mb * 0.6).round();
        let log = format!(
            "REPORT Billed Duration: {} ms\tDuration: {:.2} ms\tMemory Size: {} MB\tMax Memory Used: {} MB",
            billed_ms as i64, duration_ms, memory_mb as i64, memory_used as i64
        );
        Ok((body, log))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_produces_parseable_log() {
        let sim = LocalSimulator::new();
        sim.update_config("s0", 1792.0).unwrap();
        let (body, log) = sim.invoke("s0", &json!({"num_func": 1.0})).unwrap();
        assert!(body.get("breakdown").is_some());
        let info = crate::log_analysis::extract_info_from_log(&log, "s0").unwrap();
        assert!(info.billed_duration_ms > 0.0);
    }

    #[test]
    fn update_config_rejects_reentrant_update() {
        let sim = LocalSimulator::new();
        sim.updating.lock().unwrap().push("s0".to_string());
        let err = sim.update_config("s0", 1792.0).unwrap_err();
        assert!(matches!(err, JolteonError::ProfileUpdate { .. }));
    }
}
