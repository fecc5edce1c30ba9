use std::sync::Arc;

use async_trait::async_trait;
use hso_contracts::{Area, Asset, ImpactClass, PolicyProfile, Problem};

/// What a domain hands the solvers each cycle.
#[derive(Debug, Clone)]
pub struct ProblemInstance {
    pub problem: Problem,
    /// Area the forecast is refreshed for.
    pub area: Area,
}

/// Domain business logic that builds the optimization problem for a cycle.
#[async_trait]
pub trait ProblemSource: Send + Sync {
    async fn build(&self, domain: &str, cycle_id: u64) -> anyhow::Result<ProblemInstance>;
}

/// Returns the same problem every cycle.
#[derive(Debug, Clone)]
pub struct StaticProblem(pub ProblemInstance);

impl StaticProblem {
    pub fn new(problem: Problem, area: Area) -> Self {
        Self(ProblemInstance { problem, area })
    }
}

#[async_trait]
impl ProblemSource for StaticProblem {
    async fn build(&self, _domain: &str, _cycle_id: u64) -> anyhow::Result<ProblemInstance> {
        Ok(self.0.clone())
    }
}

/// Registration for one scheduled domain.
#[derive(Clone)]
pub struct DomainSpec {
    pub domain: String,
    pub assets: Vec<Asset>,
    pub policy_profile: PolicyProfile,
    pub impact: ImpactClass,
    pub problems: Arc<dyn ProblemSource>,
}

impl std::fmt::Debug for DomainSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainSpec")
            .field("domain", &self.domain)
            .field("assets", &self.assets.len())
            .field("policy_profile", &self.policy_profile)
            .field("impact", &self.impact)
            .finish_non_exhaustive()
    }
}

impl DomainSpec {
    pub fn new(
        domain: impl Into<String>,
        policy_profile: PolicyProfile,
        problems: Arc<dyn ProblemSource>,
    ) -> Self {
        Self {
            domain: domain.into(),
            assets: Vec::new(),
            policy_profile,
            impact: ImpactClass::Standard,
            problems,
        }
    }

    pub fn with_assets(mut self, assets: Vec<Asset>) -> Self {
        self.assets = assets;
        self
    }

    pub fn with_impact(mut self, impact: ImpactClass) -> Self {
        self.impact = impact;
        self
    }
}
