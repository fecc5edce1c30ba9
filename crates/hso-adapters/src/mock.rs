//! Scripted collaborators for tests.
//!
//! - [`MockSolver`]: returns a fixed objective after a configurable latency
//! - [`MockRepresentative`]: Ed25519-signs (or refuses) allocation requests
//! - [`MockForecastSource`]: produces flat fields, optionally slow, aged or failing

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use hso_contracts::{
    Area, Asset, AssetId, Confidence, Field, FieldKind, PastWindow, Plan, SolverKind,
    now_wallclock_ms,
};
use hso_kernel::{Ed25519Signer, StateSigner};

use crate::error::SolverError;
use crate::federation::{Acknowledgment, AllocationRequest, AssetRepresentative};
use crate::forecast::ForecastSource;
use crate::solver::{SolveRequest, SolverAdapter};

// ---------------------------------------------------------------------------
// MockSolver
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MockSolver {
    kind: SolverKind,
    id: String,
    objective: f64,
    confidence: Confidence,
    seed: Option<u64>,
    latency: Duration,
    failure: Option<SolverError>,
    calls: AtomicUsize,
}

impl MockSolver {
    pub fn classical(objective: f64) -> Self {
        Self::new(SolverKind::Classical, "csa-mock", objective, Confidence::Complete)
    }

    pub fn quantum(objective: f64, confidence: f64) -> Self {
        let mut solver = Self::new(
            SolverKind::Quantum,
            "qsa-mock",
            objective,
            Confidence::Score(confidence),
        );
        solver.seed = Some(7);
        solver
    }

    pub fn new(
        kind: SolverKind,
        id: impl Into<String>,
        objective: f64,
        confidence: Confidence,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            objective,
            confidence,
            seed: None,
            latency: Duration::ZERO,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing(mut self, failure: SolverError) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SolverAdapter for MockSolver {
    fn kind(&self) -> SolverKind {
        self.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn solve(&self, request: SolveRequest) -> Result<Plan, SolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.latency) => {}
                _ = request.abort.aborted() => {
                    return Err(SolverError::Aborted { solver: self.id.clone() });
                }
            }
        }
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let assignment = request
            .problem
            .model
            .variables
            .iter()
            .map(|v| (v.name.clone(), v.lower))
            .collect();
        Ok(Plan {
            source: self.kind,
            solver_id: self.id.clone(),
            objective_value: self.objective,
            confidence: self.confidence,
            seed: self.seed,
            produced_at_ms: now_wallclock_ms(),
            assignment,
        })
    }
}

// ---------------------------------------------------------------------------
// MockRepresentative
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckBehavior {
    Sign,
    Refuse,
    /// Signs a different payload so verification fails.
    BadSignature,
}

#[derive(Debug)]
pub struct MockRepresentative {
    asset: AssetId,
    signer: Ed25519Signer,
    latency: Duration,
    behavior: AckBehavior,
    calls: AtomicUsize,
}

impl MockRepresentative {
    /// Key material is derived from `seed` so tests get stable identities.
    pub fn new(asset: impl Into<String>, seed: u8) -> Self {
        let asset = AssetId::new(asset);
        Self {
            signer: Ed25519Signer::from_seed(asset.as_str(), [seed; 32]),
            asset,
            latency: Duration::ZERO,
            behavior: AckBehavior::Sign,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_behavior(mut self, behavior: AckBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Directory entry for this representative's asset.
    pub fn descriptor(&self, dual_control: bool) -> Asset {
        Asset {
            id: self.asset.clone(),
            public_key: self.signer.public_key(),
            dual_control,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetRepresentative for MockRepresentative {
    fn asset(&self) -> &AssetId {
        &self.asset
    }

    async fn acknowledge(&self, request: &AllocationRequest) -> anyhow::Result<Acknowledgment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let payload: &[u8] = match self.behavior {
            AckBehavior::Sign => request.plan_hash.as_bytes(),
            AckBehavior::BadSignature => b"something else",
            AckBehavior::Refuse => bail!("asset {} refused the allocation", self.asset),
        };
        Ok(Acknowledgment {
            signer: self.asset.clone(),
            public_key: self.signer.public_key(),
            signature: self.signer.sign(payload),
        })
    }
}

// ---------------------------------------------------------------------------
// MockForecastSource
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MockForecastSource {
    value: f64,
    step_s: u64,
    age: Duration,
    latency_ms: AtomicU64,
    failing: AtomicBool,
    calls: AtomicUsize,
    areas: Mutex<Vec<String>>,
}

impl MockForecastSource {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            step_s: 60,
            age: Duration::ZERO,
            latency_ms: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            areas: Mutex::new(Vec::new()),
        }
    }

    /// Fields come back already `age` old.
    pub fn with_age(mut self, age: Duration) -> Self {
        self.age = age;
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Area ids in request order.
    pub fn requested_areas(&self) -> Vec<String> {
        self.areas.lock().map(|a| a.clone()).unwrap_or_default()
    }

    async fn produce(&self, kind: FieldKind, area: &Area, horizon_s: u64) -> anyhow::Result<Field> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut areas) = self.areas.lock() {
            areas.push(area.id.clone());
        }
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            bail!("forecast source unavailable");
        }
        let steps = horizon_s.div_ceil(self.step_s).max(1) as usize;
        Ok(Field {
            kind,
            area: area.clone(),
            horizon_s,
            step_s: self.step_s,
            grid: vec![vec![self.value; area.cells as usize]; steps],
            generated_at_ms: now_wallclock_ms().saturating_sub(self.age.as_millis() as u64),
            staleness_bound_ms: 0,
        })
    }
}

#[async_trait]
impl ForecastSource for MockForecastSource {
    async fn nowcast(&self, area: &Area, horizon_s: u64) -> anyhow::Result<Field> {
        self.produce(FieldKind::Nowcast, area, horizon_s).await
    }

    async fn retrodict(&self, area: &Area, window: PastWindow) -> anyhow::Result<Field> {
        let horizon_s = window.end_ms.saturating_sub(window.start_ms) / 1_000;
        self.produce(FieldKind::Retrodict, area, horizon_s).await
    }
}
