use std::path::Path;
use std::time::Duration;

use hso_adapters::{AdmissionMode, AnnealStrategy};
use hso_contracts::{DEFAULT_QUORUM_TOLERANCE, QuorumRounding, TieBreak};
use hso_kernel::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::error::HostError;

/// Runtime knobs for the orchestration loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Interval between ticks when running on a cadence.
    pub cadence_ms: u64,
    /// Hard ceiling for one cycle when the caller does not pass one.
    pub total_deadline_ms: u64,
    /// Share of the cycle budget given to the solve race.
    pub solve_fraction: f64,
    pub federate_fraction: f64,
    pub forecast_fraction: f64,
    /// Minimum budget that must remain for Commit to start.
    pub commit_reserve_ms: u64,
    pub staleness_bound_ms: u64,
    pub forecast_horizon_s: u64,
    pub quantum: QuantumConfig,
    pub admission: AdmissionConfig,
    pub quorum: QuorumConfig,
    pub anchor_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cadence_ms: 1_000,
            total_deadline_ms: 300,
            solve_fraction: 0.5,
            federate_fraction: 0.2,
            forecast_fraction: 0.15,
            commit_reserve_ms: 10,
            staleness_bound_ms: 60_000,
            forecast_horizon_s: 3_600,
            quantum: QuantumConfig::default(),
            admission: AdmissionConfig::default(),
            quorum: QuorumConfig::default(),
            anchor_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantumConfig {
    pub enabled: bool,
    /// The quantum call's own budget, further capped by the solve sub-deadline.
    pub budget_ms: u64,
    /// Quantum plans scoring below this are discarded.
    pub min_confidence: f64,
    pub seed: u64,
    pub strategy: AnnealStrategy,
}

impl Default for QuantumConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            budget_ms: 800,
            min_confidence: 0.5,
            seed: 0x5eed,
            strategy: AnnealStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub limit: usize,
    pub mode: AdmissionMode,
    pub queue_wait_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            limit: 4,
            mode: AdmissionMode::Queue,
            queue_wait_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    pub rounding: QuorumRounding,
    /// Slack subtracted before ceil rounding.
    pub tolerance: f64,
    pub tie_break: TieBreak,
    /// Overrides the per-profile fraction when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            rounding: QuorumRounding::default(),
            tolerance: DEFAULT_QUORUM_TOLERANCE,
            tie_break: TieBreak::default(),
            threshold: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, HostError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self, HostError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| HostError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Defaults (or the JSON file named by `HSO_CONFIG`) overlaid with `HSO_*` variables.
    pub fn from_env() -> Result<Self, HostError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HostError> {
        let mut config = match lookup("HSO_CONFIG") {
            Some(path) => Self::from_json_path(path)?,
            None => Self::default(),
        };
        if let Some(v) = parse(&lookup, "HSO_CADENCE_MS")? {
            config.cadence_ms = v;
        }
        if let Some(v) = parse(&lookup, "HSO_TOTAL_DEADLINE_MS")? {
            config.total_deadline_ms = v;
        }
        if let Some(v) = parse(&lookup, "HSO_COMMIT_RESERVE_MS")? {
            config.commit_reserve_ms = v;
        }
        if let Some(v) = parse(&lookup, "HSO_STALENESS_BOUND_MS")? {
            config.staleness_bound_ms = v;
        }
        if let Some(v) = parse(&lookup, "HSO_FORECAST_HORIZON_S")? {
            config.forecast_horizon_s = v;
        }
        if let Some(v) = parse(&lookup, "HSO_QUANTUM_ENABLED")? {
            config.quantum.enabled = v;
        }
        if let Some(v) = parse(&lookup, "HSO_QUANTUM_BUDGET_MS")? {
            config.quantum.budget_ms = v;
        }
        if let Some(v) = parse(&lookup, "HSO_QUANTUM_MIN_CONFIDENCE")? {
            config.quantum.min_confidence = v;
        }
        if let Some(v) = parse(&lookup, "HSO_ADMISSION_LIMIT")? {
            config.admission.limit = v;
        }
        if let Some(v) = lookup("HSO_ADMISSION_MODE") {
            config.admission.mode = enum_value("HSO_ADMISSION_MODE", &v)?;
        }
        if let Some(v) = lookup("HSO_QUORUM_ROUNDING") {
            config.quorum.rounding = enum_value("HSO_QUORUM_ROUNDING", &v)?;
        }
        if let Some(v) = parse(&lookup, "HSO_QUORUM_TOLERANCE")? {
            config.quorum.tolerance = v;
        }
        if let Some(v) = lookup("HSO_TIE_BREAK") {
            config.quorum.tie_break = enum_value("HSO_TIE_BREAK", &v)?;
        }
        if let Some(v) = parse(&lookup, "HSO_QUORUM_THRESHOLD")? {
            config.quorum.threshold = Some(v);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HostError> {
        if self.cadence_ms == 0 {
            return Err(HostError::Config("cadence_ms must be non-zero".into()));
        }
        if self.total_deadline_ms == 0 {
            return Err(HostError::Config("total_deadline_ms must be non-zero".into()));
        }
        for (name, value) in [
            ("solve_fraction", self.solve_fraction),
            ("federate_fraction", self.federate_fraction),
            ("forecast_fraction", self.forecast_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(HostError::Config(format!("{name} must be in (0, 1], got {value}")));
            }
        }
        if !(0.0..=1.0).contains(&self.quantum.min_confidence) {
            return Err(HostError::Config(format!(
                "quantum.min_confidence must be in [0, 1], got {}",
                self.quantum.min_confidence
            )));
        }
        if let Some(threshold) = self.quorum.threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(HostError::Config(format!(
                    "quorum.threshold must be in (0, 1], got {threshold}"
                )));
            }
        }
        if !(0.0..1.0).contains(&self.quorum.tolerance) {
            return Err(HostError::Config(format!(
                "quorum.tolerance must be in [0, 1), got {}",
                self.quorum.tolerance
            )));
        }
        if self.admission.limit == 0 {
            return Err(HostError::Config("admission.limit must be non-zero".into()));
        }
        Ok(())
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms)
    }

    pub fn commit_reserve(&self) -> Duration {
        Duration::from_millis(self.commit_reserve_ms)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, HostError>
where
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|err| HostError::Config(format!("{key}={raw}: {err}")))
        })
        .transpose()
}

/// Parse a snake_case enum value the same way the JSON config does.
fn enum_value<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T, HostError> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_string()))
        .map_err(|err| HostError::Config(format!("{key}={raw}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.total_deadline_ms, 300);
        assert_eq!(config.quantum.budget_ms, 800);
        assert_eq!(config.quorum.tie_break, TieBreak::EarliestCompletion);
        assert_eq!(config.quorum.rounding, QuorumRounding::Ceil);
        assert_eq!(config.quorum.tolerance, DEFAULT_QUORUM_TOLERANCE);
    }

    #[test]
    fn env_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("HSO_TOTAL_DEADLINE_MS", "450"),
            ("HSO_QUANTUM_ENABLED", "false"),
            ("HSO_ADMISSION_MODE", "reject"),
            ("HSO_TIE_BREAK", "lowest_signer_id"),
            ("HSO_QUORUM_THRESHOLD", "0.67"),
            ("HSO_QUORUM_TOLERANCE", "0"),
        ]))
        .unwrap();
        assert_eq!(config.total_deadline_ms, 450);
        assert!(!config.quantum.enabled);
        assert_eq!(config.admission.mode, AdmissionMode::Reject);
        assert_eq!(config.quorum.tie_break, TieBreak::LowestSignerId);
        assert_eq!(config.quorum.threshold, Some(0.67));
        assert_eq!(config.quorum.tolerance, 0.0);
    }

    #[test]
    fn malformed_env_is_rejected() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("HSO_CADENCE_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("HSO_CADENCE_MS"));
        let err = OrchestratorConfig::from_lookup(lookup(&[("HSO_ADMISSION_MODE", "drop")]))
            .unwrap_err();
        assert!(matches!(err, HostError::Config(_)));
    }

    #[test]
    fn json_file_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hso.json");
        let json = r#"{"cadence_ms": 250, "quantum": {"enabled": false},
            "quorum": {"rounding": "round"}}"#;
        std::fs::write(&path, json).unwrap();
        let config = OrchestratorConfig::from_lookup(lookup(&[(
            "HSO_CONFIG",
            path.to_str().unwrap(),
        )]))
        .unwrap();
        assert_eq!(config.cadence_ms, 250);
        assert!(!config.quantum.enabled);
        assert_eq!(config.quantum.budget_ms, 800);
        assert_eq!(config.quorum.rounding, QuorumRounding::Round);
    }

    #[test]
    fn validation_catches_bad_fractions() {
        let config = OrchestratorConfig {
            solve_fraction: 0.0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());
        let config = OrchestratorConfig {
            cadence_ms: 0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());
        let mut config = OrchestratorConfig::default();
        config.quorum.tolerance = 1.5;
        assert!(config.validate().is_err());
    }
}
