//! Pre-wired scheduler over the mock collaborators. Enable with the `test-fixtures`
//! feature.

use std::sync::Arc;

use hso_adapters::mock::{MockForecastSource, MockRepresentative, MockSolver};
use hso_adapters::{FederationCoordinator, SolverAdapter};
use hso_contracts::{
    Area, ConstraintSense, Constraints, ImpactClass, LinearConstraint, Model, PolicyProfile,
    Problem, Variable,
};
use hso_kernel::anchor::mock::MemAnchorLedger;
use hso_kernel::{AnchorService, Ed25519Signer, Ed25519Verifier, SharedJournal, StateCommitter};
use hso_store::MemStore;

use crate::config::OrchestratorConfig;
use crate::domain::{DomainSpec, StaticProblem};
use crate::scheduler::CycleScheduler;

/// Domain registered by [`HarnessBuilder::build`].
pub const DOMAIN: &str = "grid-west";

/// Seed of the committer's signing key.
pub const COMMITTER_SEED: [u8; 32] = [42; 32];

/// Two dispatchable units that must cover a demand of 3.
pub fn small_problem() -> Problem {
    Problem::new(
        Model {
            name: "dispatch".into(),
            variables: vec![
                Variable::new("unit_a", 0, 4, 2.0),
                Variable::new("unit_b", 0, 4, 3.0),
            ],
        },
        Constraints {
            rows: vec![LinearConstraint {
                name: "demand".into(),
                coefficients: [("unit_a".to_string(), 1.0), ("unit_b".to_string(), 1.0)]
                    .into_iter()
                    .collect(),
                sense: ConstraintSense::Ge,
                bound: 3.0,
            }],
        },
    )
}

pub fn small_area() -> Area {
    Area::new("west", 4)
}

/// Representatives `asset-a`, `asset-b`, ... with stable keys.
pub fn representatives(n: usize) -> Vec<Arc<MockRepresentative>> {
    (0..n)
        .map(|i| {
            let name = format!("asset-{}", (b'a' + i as u8) as char);
            Arc::new(MockRepresentative::new(name, i as u8 + 1))
        })
        .collect()
}

pub struct Harness {
    pub scheduler: CycleScheduler,
    pub store: Arc<MemStore>,
    pub ledger: Arc<MemAnchorLedger>,
    pub forecast: Arc<MockForecastSource>,
    pub journal: SharedJournal,
    pub representatives: Vec<Arc<MockRepresentative>>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub fn anchors(&self) -> &Arc<AnchorService> {
        self.scheduler
            .committer()
            .anchors()
            .expect("harness always wires an anchor service")
    }
}

pub struct HarnessBuilder {
    config: OrchestratorConfig,
    classical: Arc<dyn SolverAdapter>,
    quantum: Option<Arc<dyn SolverAdapter>>,
    representatives: Vec<Arc<MockRepresentative>>,
    dual_control: bool,
    profile: PolicyProfile,
    impact: ImpactClass,
    forecast: Arc<MockForecastSource>,
    store: Arc<MemStore>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        let mut config = OrchestratorConfig::default();
        config.quantum.enabled = false;
        Self {
            config,
            classical: Arc::new(MockSolver::classical(6.0)),
            quantum: None,
            representatives: representatives(3),
            dual_control: false,
            profile: PolicyProfile::OpsSafe,
            impact: ImpactClass::Standard,
            forecast: Arc::new(MockForecastSource::new(1.0)),
            store: Arc::new(MemStore::new()),
        }
    }
}

impl HarnessBuilder {
    pub fn config(mut self, edit: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn classical(mut self, solver: Arc<dyn SolverAdapter>) -> Self {
        self.classical = solver;
        self
    }

    /// Also turns the quantum path on.
    pub fn quantum(mut self, solver: Arc<dyn SolverAdapter>) -> Self {
        self.quantum = Some(solver);
        self.config.quantum.enabled = true;
        self
    }

    pub fn representatives(mut self, representatives: Vec<Arc<MockRepresentative>>) -> Self {
        self.representatives = representatives;
        self
    }

    pub fn dual_control(mut self, dual_control: bool) -> Self {
        self.dual_control = dual_control;
        self
    }

    pub fn profile(mut self, profile: PolicyProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn impact(mut self, impact: ImpactClass) -> Self {
        self.impact = impact;
        self
    }

    pub fn forecast(mut self, source: Arc<MockForecastSource>) -> Self {
        self.forecast = source;
        self
    }

    /// Share a store between harnesses to simulate a restart.
    pub fn store(mut self, store: Arc<MemStore>) -> Self {
        self.store = store;
        self
    }

    pub fn build(self) -> Harness {
        let journal = SharedJournal::in_memory();
        let ledger = Arc::new(MemAnchorLedger::new());
        let anchors = AnchorService::new(
            ledger.clone(),
            self.store.clone(),
            self.config.anchor_retry.clone(),
        )
        .with_journal(journal.clone());
        let committer = StateCommitter::new(
            self.store.clone(),
            Arc::new(Ed25519Signer::from_seed("hso-committer", COMMITTER_SEED)),
            Arc::new(Ed25519Verifier::new()),
        )
        .with_journal(journal.clone())
        .with_anchors(Arc::new(anchors));

        let mut federation = FederationCoordinator::new(Arc::new(Ed25519Verifier::new()));
        for representative in &self.representatives {
            federation.register(representative.clone());
        }
        let assets = self
            .representatives
            .iter()
            .map(|r| r.descriptor(self.dual_control))
            .collect();

        let mut builder = CycleScheduler::builder(self.config)
            .classical(self.classical)
            .federation(federation)
            .forecast_source(self.forecast.clone())
            .committer(Arc::new(committer))
            .journal(journal.clone());
        if let Some(quantum) = self.quantum {
            builder = builder.quantum(quantum);
        }
        let scheduler = builder.build().expect("harness config is valid");
        let problems = Arc::new(StaticProblem::new(small_problem(), small_area()));
        scheduler
            .register_domain(
                DomainSpec::new(DOMAIN, self.profile, problems)
                    .with_assets(assets)
                    .with_impact(self.impact),
            )
            .expect("fresh scheduler accepts the domain");

        Harness {
            scheduler,
            store: self.store,
            ledger,
            forecast: self.forecast,
            journal,
            representatives: self.representatives,
        }
    }
}
