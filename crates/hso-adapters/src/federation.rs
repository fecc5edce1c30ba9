//! Quorum negotiation of a candidate plan across asset representatives.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use hso_cbor::Hash;
use hso_contracts::{
    Allocation, AllocationStatus, Asset, AssetId, DEFAULT_QUORUM_TOLERANCE, Deadline, Envelope,
    ImpactClass, Plan, PolicyProfile, QuorumRounding, QuorumRule, QuorumSignature, TieBreak,
    now_wallclock_ms,
};
use hso_kernel::SignatureVerifier;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::FederationError;

/// What each representative is asked to sign: the plan's content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub envelope: Envelope,
    pub plan_hash: Hash,
    pub plan: Plan,
    pub policy_profile: PolicyProfile,
    pub impact: ImpactClass,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Acknowledgment {
    pub signer: AssetId,
    pub public_key: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[async_trait]
pub trait AssetRepresentative: Send + Sync {
    fn asset(&self) -> &AssetId;

    /// Return a signature over `request.plan_hash`, or an error to decline.
    async fn acknowledge(&self, request: &AllocationRequest) -> anyhow::Result<Acknowledgment>;
}

#[derive(Debug, Clone)]
struct Accepted {
    asset: Asset,
    signature: QuorumSignature,
}

pub struct FederationCoordinator {
    representatives: HashMap<AssetId, Arc<dyn AssetRepresentative>>,
    verifier: Arc<dyn SignatureVerifier>,
    rounding: QuorumRounding,
    tolerance: f64,
    tie_break: TieBreak,
    threshold: Option<f64>,
}

impl FederationCoordinator {
    pub fn new(verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            representatives: HashMap::new(),
            verifier,
            rounding: QuorumRounding::default(),
            tolerance: DEFAULT_QUORUM_TOLERANCE,
            tie_break: TieBreak::default(),
            threshold: None,
        }
    }

    /// `tolerance` is the slack subtracted before ceil rounding.
    pub fn with_rounding(mut self, rounding: QuorumRounding, tolerance: f64) -> Self {
        self.rounding = rounding;
        self.tolerance = tolerance;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Replace the profile's fractional threshold (e.g. 0.67) for every profile.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn register(&mut self, representative: Arc<dyn AssetRepresentative>) {
        self.representatives
            .insert(representative.asset().clone(), representative);
    }

    pub fn required_signatures(&self, profile: PolicyProfile, assets: usize) -> usize {
        match self.threshold {
            Some(threshold) => QuorumRule::new(threshold)
                .with_rounding(self.rounding, self.tolerance)
                .required(assets),
            None => profile.required_signatures(assets, self.rounding, self.tolerance),
        }
    }

    /// Broadcast `plan` to every asset's representative and seal an allocation once
    /// enough verified acknowledgments arrive before `deadline`.
    pub async fn negotiate(
        &self,
        envelope: &Envelope,
        assets: &[Asset],
        plan: &Plan,
        policy_profile: PolicyProfile,
        impact: ImpactClass,
        deadline: Deadline,
    ) -> Result<Allocation, FederationError> {
        let mut seen = BTreeSet::new();
        let assets: Vec<Asset> = assets
            .iter()
            .filter(|a| seen.insert(a.id.clone()))
            .cloned()
            .collect();
        if assets.is_empty() {
            return Err(FederationError::NoAssets);
        }
        let plan_hash = plan
            .content_hash()
            .map_err(|err| FederationError::PlanHash(err.to_string()))?;
        let required = self.required_signatures(policy_profile, assets.len());
        let dual_needed = policy_profile.requires_dual_signers(impact);
        let request = Arc::new(AllocationRequest {
            envelope: envelope.child("federate.acknowledge", &deadline),
            plan_hash,
            plan: plan.clone(),
            policy_profile,
            impact,
        });

        let mut pending = FuturesUnordered::new();
        for asset in &assets {
            let Some(representative) = self.representatives.get(&asset.id).cloned() else {
                warn!(asset = %asset.id, "no representative registered");
                continue;
            };
            let request = request.clone();
            let asset = asset.clone();
            pending.push(async move {
                let result = representative.acknowledge(&request).await;
                (asset, result)
            });
        }

        let mut accepted: Vec<Accepted> = Vec::new();
        let mut sealed = false;
        let expiry = tokio::time::sleep(deadline.remaining());
        tokio::pin!(expiry);
        loop {
            tokio::select! {
                next = pending.next() => {
                    let Some((asset, result)) = next else { break };
                    let ack = match result {
                        Ok(ack) => ack,
                        Err(err) => {
                            debug!(asset = %asset.id, error = %err, "acknowledgment declined");
                            continue;
                        }
                    };
                    if !self.accepts(&asset, &plan_hash, &ack) {
                        warn!(asset = %asset.id, "acknowledgment failed verification");
                        continue;
                    }
                    let arrival = accepted.len() as u32;
                    accepted.push(Accepted {
                        asset,
                        signature: QuorumSignature {
                            signer: ack.signer,
                            signature: ack.signature,
                            received_at_ms: now_wallclock_ms(),
                            arrival,
                        },
                    });
                    if self.tie_break == TieBreak::EarliestCompletion
                        && satisfied(&accepted, required, dual_needed)
                    {
                        sealed = true;
                        break;
                    }
                }
                _ = &mut expiry => {
                    debug!(collected = accepted.len(), required, "federation deadline reached");
                    break;
                }
            }
        }

        let signers = if sealed {
            accepted
        } else {
            match self.tie_break {
                TieBreak::LowestSignerId => lowest_signer_set(accepted, required, dual_needed)?,
                TieBreak::EarliestCompletion => {
                    return Err(shortfall(&accepted, required, dual_needed));
                }
            }
        };

        let quorum_completed_at_ms = signers
            .iter()
            .map(|a| a.signature.received_at_ms)
            .max()
            .unwrap_or_else(now_wallclock_ms);
        info!(
            plan = %plan_hash.short(),
            signers = signers.len(),
            required,
            profile = %policy_profile,
            "allocation sealed"
        );
        Ok(Allocation {
            plan_hash,
            plan: plan.clone(),
            assets: assets.into_iter().map(|a| a.id).collect(),
            quorum_signatures: signers.into_iter().map(|a| a.signature).collect(),
            policy_profile,
            impact,
            required_signatures: required,
            quorum_completed_at_ms,
            status: AllocationStatus::Sealed,
        })
    }

    fn accepts(&self, asset: &Asset, plan_hash: &Hash, ack: &Acknowledgment) -> bool {
        ack.signer == asset.id
            && ack.public_key == asset.public_key
            && self.verifier.verify(
                asset.id.as_str(),
                &asset.public_key,
                plan_hash.as_bytes(),
                &ack.signature,
            )
    }
}

fn dual_count(accepted: &[Accepted]) -> usize {
    accepted.iter().filter(|a| a.asset.dual_control).count()
}

fn satisfied(accepted: &[Accepted], required: usize, dual_needed: bool) -> bool {
    accepted.len() >= required && (!dual_needed || dual_count(accepted) >= 2)
}

fn shortfall(accepted: &[Accepted], required: usize, dual_needed: bool) -> FederationError {
    if accepted.len() >= required && dual_needed {
        FederationError::DualControlMissing {
            collected: dual_count(accepted),
        }
    } else {
        FederationError::QuorumNotReached {
            required,
            collected: accepted.len(),
        }
    }
}

/// Smallest signer ids that still satisfy the quorum; dual-control signers are taken
/// first when the allocation needs them.
fn lowest_signer_set(
    mut accepted: Vec<Accepted>,
    required: usize,
    dual_needed: bool,
) -> Result<Vec<Accepted>, FederationError> {
    if !satisfied(&accepted, required, dual_needed) {
        return Err(shortfall(&accepted, required, dual_needed));
    }
    accepted.sort_by(|a, b| a.signature.signer.cmp(&b.signature.signer));
    let mut chosen = Vec::with_capacity(required);
    if dual_needed {
        let (dual, rest): (Vec<_>, Vec<_>) =
            accepted.into_iter().partition(|a| a.asset.dual_control);
        let mut dual = dual.into_iter();
        chosen.extend(dual.by_ref().take(2));
        let mut remaining: Vec<Accepted> = dual.chain(rest).collect();
        remaining.sort_by(|a, b| a.signature.signer.cmp(&b.signature.signer));
        let missing = required.saturating_sub(chosen.len());
        chosen.extend(remaining.into_iter().take(missing));
        chosen.sort_by(|a, b| a.signature.signer.cmp(&b.signature.signer));
    } else {
        chosen.extend(accepted.into_iter().take(required));
    }
    Ok(chosen)
}
