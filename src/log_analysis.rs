//! Billing-log extraction (§4.3, §6, §8 scenario 6): pulls the four
//! billing fields out of a cloud-function invocation log and turns them
//! into a dollar figure.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::JolteonError;

/// The four billing fields extracted from one invocation's `REPORT` log line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogInfo {
    pub billed_duration_ms: f64,
    pub duration_ms: f64,
    pub memory_size_mb: f64,
    pub memory_used_mb: f64,
}

fn billed_duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Billed Duration:\s*(\d+)").unwrap())
}

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)Duration:\s*([\d.]+)").unwrap())
}

fn memory_size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Memory Size:\s*(\d+)").unwrap())
}

fn memory_used_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Max Memory Used:\s*(\d+)").unwrap())
}

/// Extract billing fields from a `REPORT ...` log line. Fails if any of the
/// four fields is absent, per §7's "invocation" error kind.
pub fn extract_info_from_log(log_text: &str, stage: &str) -> Result<LogInfo, JolteonError> {
    let missing = |field: &str| JolteonError::Invocation {
        stage: stage.to_string(),
        reason: format!("log missing expected field: {field}"),
    };

    let billed_duration_ms = billed_duration_re()
        .captures(log_text)
        .and_then(|c| c.get(1))
        .ok_or_else(|| missing("Billed Duration"))?
        .as_str()
        .parse::<f64>()
        .map_err(|e| JolteonError::Invocation { stage: stage.to_string(), reason: e.to_string() })?;

    let duration_ms = duration_re()
        .captures(log_text)
        .and_then(|c| c.get(1))
        .ok_or_else(|| missing("Duration"))?
        .as_str()
        .parse::<f64>()
        .map_err(|e| JolteonError::Invocation { stage: stage.to_string(), reason: e.to_string() })?;

    let memory_size_mb = memory_size_re()
        .captures(log_text)
        .and_then(|c| c.get(1))
        .ok_or_else(|| missing("Memory Size"))?
        .as_str()
        .parse::<f64>()
        .map_err(|e| JolteonError::Invocation { stage: stage.to_string(), reason: e.to_string() })?;

    let memory_used_mb = memory_used_re()
        .captures(log_text)
        .and_then(|c| c.get(1))
        .ok_or_else(|| missing("Max Memory Used"))?
        .as_str()
        .parse::<f64>()
        .map_err(|e| JolteonError::Invocation { stage: stage.to_string(), reason: e.to_string() })?;

    Ok(LogInfo { billed_duration_ms, duration_ms, memory_size_mb, memory_used_mb })
}

/// `billed_duration_ms * memory_size_mb/1024 * 1.67e-8 + 2e-7`, preserved
/// bit-for-bit from the reference implementation's pricing constants.
pub fn calculate_bill(info: &LogInfo) -> f64 {
    info.billed_duration_ms * (info.memory_size_mb / 1024.0) * 1.67e-8 + 2e-7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_all_four_fields() {
        let log = "REPORT Billed Duration: 1200 ms\tMemory Size: 1792 MB\tMax Memory Used: 800 MB\tDuration: 1183.42 ms";
        let info = extract_info_from_log(log, "s0").unwrap();
        assert_eq!(info.billed_duration_ms, 1200.0);
        assert_eq!(info.duration_ms, 1183.42);
        assert_eq!(info.memory_size_mb, 1792.0);
        assert_eq!(info.memory_used_mb, 800.0);
    }

    #[test]
    fn bill_formula_matches_reference_constants() {
        let info = LogInfo { billed_duration_ms: 1200.0, duration_ms: 1183.42, memory_size_mb: 1792.0, memory_used_mb: 800.0 };
        let bill = calculate_bill(&info);
        let expected = 1200.0 * (1792.0 / 1024.0) * 1.67e-8 + 2e-7;
        assert!((bill - expected).abs() < 1e-15);
    }

    #[test]
    fn missing_field_is_an_invocation_error() {
        let log = "REPORT Billed Duration: 1200 ms";
        let err = extract_info_from_log(log, "s0").unwrap_err();
        assert!(matches!(err, JolteonError::Invocation { .. }));
    }
}
