use std::collections::BTreeSet;
use std::fmt;

use hso_cbor::Hash;
use serde::{Deserialize, Serialize};

use crate::plan::Plan;

/// Default slack applied before ceil-rounding a quorum requirement.
///
/// Thresholds are quoted to two decimals (0.67 for two-thirds), so a product within
/// this distance above an integer counts as that integer.
pub const DEFAULT_QUORUM_TOLERANCE: f64 = 0.05;

fn default_tolerance() -> f64 {
    DEFAULT_QUORUM_TOLERANCE
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An asset taking part in federation, identified by its representative's key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Asset {
    pub id: AssetId,
    /// Ed25519 verifying key of the asset's representative.
    pub public_key: [u8; 32],
    /// Holds dual-control authority for high-impact allocations.
    #[serde(default)]
    pub dual_control: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyProfile {
    #[serde(rename = "ops-safe")]
    OpsSafe,
    #[serde(rename = "regulated")]
    Regulated,
    #[serde(rename = "defense")]
    Defense,
}

impl PolicyProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyProfile::OpsSafe => "ops-safe",
            PolicyProfile::Regulated => "regulated",
            PolicyProfile::Defense => "defense",
        }
    }

    /// Signatures required from `n` assets under this profile.
    pub fn required_signatures(
        &self,
        n: usize,
        rounding: QuorumRounding,
        tolerance: f64,
    ) -> usize {
        match self {
            // Simple majority: strictly more than half.
            PolicyProfile::OpsSafe => n / 2 + 1,
            PolicyProfile::Regulated | PolicyProfile::Defense => QuorumRule::new(2.0 / 3.0)
                .with_rounding(rounding, tolerance)
                .required(n),
        }
    }

    pub fn requires_dual_signers(&self, impact: ImpactClass) -> bool {
        matches!(self, PolicyProfile::Defense) && impact == ImpactClass::High
    }
}

impl fmt::Display for PolicyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PolicyProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ops-safe" => Ok(PolicyProfile::OpsSafe),
            "regulated" => Ok(PolicyProfile::Regulated),
            "defense" => Ok(PolicyProfile::Defense),
            other => Err(format!("unknown policy profile '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumRounding {
    #[default]
    Ceil,
    Round,
}

/// Preference between signer sets that could each seal the same allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The set that completed quorum first (arrival order).
    #[default]
    EarliestCompletion,
    /// The lexicographically smallest signer ids among all collected acknowledgments.
    LowestSignerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuorumRule {
    pub threshold: f64,
    #[serde(default)]
    pub rounding: QuorumRounding,
    /// Slack subtracted before ceil rounding; ignored by `Round`.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl QuorumRule {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            rounding: QuorumRounding::Ceil,
            tolerance: DEFAULT_QUORUM_TOLERANCE,
        }
    }

    pub fn with_rounding(mut self, rounding: QuorumRounding, tolerance: f64) -> Self {
        self.rounding = rounding;
        self.tolerance = tolerance;
        self
    }

    /// Number of signatures needed from `n` assets. Never zero for a non-empty set and
    /// never more than `n`.
    pub fn required(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let raw = self.threshold.clamp(0.0, 1.0) * n as f64;
        let needed = match self.rounding {
            QuorumRounding::Ceil => (raw - self.tolerance.max(0.0)).ceil(),
            QuorumRounding::Round => raw.round(),
        };
        (needed.max(1.0) as usize).min(n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactClass {
    #[default]
    Standard,
    High,
}

/// Signed acknowledgment collected from an asset representative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuorumSignature {
    pub signer: AssetId,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    pub received_at_ms: u64,
    /// Position in arrival order across the negotiation.
    pub arrival: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Sealed,
}

/// Quorum-approved, cross-asset resolution of a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    pub plan_hash: Hash,
    pub plan: Plan,
    pub assets: Vec<AssetId>,
    pub quorum_signatures: Vec<QuorumSignature>,
    pub policy_profile: PolicyProfile,
    pub impact: ImpactClass,
    pub required_signatures: usize,
    pub quorum_completed_at_ms: u64,
    pub status: AllocationStatus,
}

impl Allocation {
    pub fn distinct_signers(&self) -> BTreeSet<&AssetId> {
        self.quorum_signatures.iter().map(|s| &s.signer).collect()
    }

    /// Checks the signature count against `rule` for the asset set. Duplicate signers
    /// and signers outside the asset set do not count.
    pub fn is_valid(&self, rule: &QuorumRule) -> bool {
        let members: BTreeSet<&AssetId> = self.assets.iter().collect();
        let counted = self
            .distinct_signers()
            .into_iter()
            .filter(|signer| members.contains(signer))
            .count();
        counted >= rule.required(self.assets.len())
    }

    pub fn hash(&self) -> Result<Hash, serde_cbor::Error> {
        Hash::of_normalized(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Confidence, SolverKind};

    fn allocation(assets: &[&str], signers: &[&str]) -> Allocation {
        let plan = Plan {
            source: SolverKind::Classical,
            solver_id: "csa".into(),
            objective_value: 1.0,
            confidence: Confidence::Complete,
            seed: None,
            produced_at_ms: 0,
            assignment: Default::default(),
        };
        Allocation {
            plan_hash: Hash::of_bytes(b"plan"),
            plan,
            assets: assets.iter().map(|a| AssetId::new(*a)).collect(),
            quorum_signatures: signers
                .iter()
                .enumerate()
                .map(|(i, s)| QuorumSignature {
                    signer: AssetId::new(*s),
                    signature: vec![0; 64],
                    received_at_ms: i as u64,
                    arrival: i as u32,
                })
                .collect(),
            policy_profile: PolicyProfile::Regulated,
            impact: ImpactClass::Standard,
            required_signatures: 2,
            quorum_completed_at_ms: 0,
            status: AllocationStatus::Sealed,
        }
    }

    #[test]
    fn two_thirds_of_three_needs_two() {
        let rule = QuorumRule::new(0.67);
        assert_eq!(rule.required(3), 2);
        assert!(allocation(&["a", "b", "c"], &["a", "b"]).is_valid(&rule));
        assert!(!allocation(&["a", "b", "c"], &["a"]).is_valid(&rule));
    }

    #[test]
    fn duplicate_and_foreign_signers_do_not_count() {
        let rule = QuorumRule::new(0.67);
        assert!(!allocation(&["a", "b", "c"], &["a", "a"]).is_valid(&rule));
        assert!(!allocation(&["a", "b", "c"], &["a", "z"]).is_valid(&rule));
    }

    #[test]
    fn rounding_modes() {
        let ceil = QuorumRule::new(0.6);
        let round = QuorumRule::new(0.6).with_rounding(QuorumRounding::Round, 0.0);
        // 0.6 * 4 = 2.4
        assert_eq!(ceil.required(4), 3);
        assert_eq!(round.required(4), 2);
        assert_eq!(ceil.required(0), 0);
        assert_eq!(QuorumRule::new(0.0).required(5), 1);
        assert_eq!(QuorumRule::new(1.0).required(5), 5);
    }

    #[test]
    fn ceil_tolerance_is_configurable() {
        // 0.51 * 2 = 1.02 and 0.67 * 3 = 2.01
        assert_eq!(QuorumRule::new(0.51).required(2), 1);
        let strict =
            |threshold| QuorumRule::new(threshold).with_rounding(QuorumRounding::Ceil, 0.0);
        assert_eq!(strict(0.51).required(2), 2);
        assert_eq!(strict(0.67).required(3), 3);
        assert_eq!(strict(0.5).required(4), 2);
        let rule: QuorumRule = serde_json::from_str(r#"{"threshold": 0.67}"#).unwrap();
        assert_eq!(rule.tolerance, DEFAULT_QUORUM_TOLERANCE);
        assert_eq!(rule.required(3), 2);
    }

    #[test]
    fn profile_requirements() {
        let ceil = QuorumRounding::Ceil;
        let tol = DEFAULT_QUORUM_TOLERANCE;
        assert_eq!(PolicyProfile::OpsSafe.required_signatures(4, ceil, tol), 3);
        assert_eq!(PolicyProfile::OpsSafe.required_signatures(3, ceil, tol), 2);
        assert_eq!(PolicyProfile::Regulated.required_signatures(3, ceil, tol), 2);
        assert_eq!(PolicyProfile::Defense.required_signatures(6, ceil, tol), 4);
        assert_eq!(PolicyProfile::Regulated.required_signatures(4, ceil, 0.0), 3);
        assert!(PolicyProfile::Defense.requires_dual_signers(ImpactClass::High));
        assert!(!PolicyProfile::Defense.requires_dual_signers(ImpactClass::Standard));
        assert!(!PolicyProfile::Regulated.requires_dual_signers(ImpactClass::High));
    }

    #[test]
    fn profile_names_round_trip() {
        for profile in [PolicyProfile::OpsSafe, PolicyProfile::Regulated, PolicyProfile::Defense] {
            let json = serde_json::to_string(&profile).unwrap();
            assert_eq!(json, format!("\"{}\"", profile.as_str()));
            assert_eq!(profile.as_str().parse::<PolicyProfile>().unwrap(), profile);
        }
    }
}
