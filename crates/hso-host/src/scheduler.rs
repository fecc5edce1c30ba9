//! Cycle scheduler: domain registration, the cadence loop, and committed-state fan-out.
//!
//! Each tick starts one cycle per registered domain. Domains run concurrently; a domain
//! whose previous cycle is still in flight skips the tick. Stage execution lives in
//! [`crate::pipeline`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use hso_adapters::{
    AdmissionLimiter, AdmissionStats, ClassicalSolver, FederationCoordinator, ForecastEngine,
    ForecastSource, QuantumSolver, SolverAdapter,
};
use hso_contracts::{AbortController, AbortSignal, Area, Cycle, Plan, StateRecord};
use hso_kernel::{SharedJournal, StateCommitter};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::domain::DomainSpec;
use crate::error::HostError;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub cycles_started: u64,
    pub committed: u64,
    pub degraded: u64,
    pub failed: u64,
    pub skipped_ticks: u64,
    pub admission: AdmissionStats,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub(crate) started: AtomicU64,
    pub(crate) committed: AtomicU64,
    pub(crate) degraded: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) skipped: AtomicU64,
}

/// Plan and area of the domain's last committed cycle; the fallback when a cycle's
/// solvers come back empty.
#[derive(Debug, Clone)]
pub(crate) struct LastGood {
    pub(crate) plan: Plan,
    pub(crate) area: Area,
}

pub(crate) struct DomainState {
    pub(crate) spec: DomainSpec,
    gate: Arc<tokio::sync::Mutex<()>>,
    next_cycle: AtomicU64,
    last_good: Mutex<Option<LastGood>>,
}

impl DomainState {
    pub(crate) fn next_cycle_id(&self) -> u64 {
        self.next_cycle.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn last_good(&self) -> Option<LastGood> {
        self.last_good.lock().ok().and_then(|g| g.clone())
    }

    pub(crate) fn remember(&self, plan: Plan, area: Area) {
        if let Ok(mut guard) = self.last_good.lock() {
            *guard = Some(LastGood { plan, area });
        }
    }
}

pub(crate) struct SchedulerCore {
    pub(crate) config: OrchestratorConfig,
    pub(crate) classical: Arc<dyn SolverAdapter>,
    pub(crate) quantum: Option<Arc<dyn SolverAdapter>>,
    pub(crate) limiter: Arc<AdmissionLimiter>,
    pub(crate) federation: Arc<FederationCoordinator>,
    pub(crate) forecast: Arc<ForecastEngine>,
    pub(crate) committer: Arc<StateCommitter>,
    pub(crate) journal: SharedJournal,
    pub(crate) updates: broadcast::Sender<StateRecord>,
    pub(crate) stats: StatCounters,
    domains: RwLock<BTreeMap<String, Arc<DomainState>>>,
    shutdown: Mutex<AbortSignal>,
}

impl SchedulerCore {
    pub(crate) fn shutdown_signal(&self) -> AbortSignal {
        match self.shutdown.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => AbortController::new().signal(),
        }
    }

    fn domain_states(&self) -> Vec<Arc<DomainState>> {
        self.domains
            .read()
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn tick_loop(self: Arc<Self>, cadence: Duration, horizon_s: u64, stop: AbortSignal) {
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles = JoinSet::new();
        info!(cadence_ms = cadence.as_millis() as u64, horizon_s, "cycle scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for state in self.domain_states() {
                        let Ok(guard) = state.gate.clone().try_lock_owned() else {
                            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                domain = %state.spec.domain,
                                "previous cycle still running; tick skipped"
                            );
                            continue;
                        };
                        let core = self.clone();
                        cycles.spawn(async move {
                            let total_ms = core.config.total_deadline_ms;
                            core.run_gated(&state, guard, total_ms, horizon_s).await;
                        });
                    }
                }
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "cycle task ended abnormally");
                    }
                }
                _ = stop.aborted() => break,
            }
        }
        while let Some(joined) = cycles.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "cycle task ended abnormally");
            }
        }
        info!("cycle scheduler stopped");
    }

    async fn run_gated(
        &self,
        state: &DomainState,
        _gate: OwnedMutexGuard<()>,
        total_ms: u64,
        horizon_s: u64,
    ) -> Cycle {
        self.run_cycle(state, total_ms, horizon_s).await
    }
}

struct RunningLoop {
    stop: AbortController,
    handle: JoinHandle<()>,
}

/// Drives Solve → Federate → Forecast → Commit cycles for every registered domain.
pub struct CycleScheduler {
    core: Arc<SchedulerCore>,
    running: Mutex<Option<RunningLoop>>,
}

impl std::fmt::Debug for CycleScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleScheduler")
            .field("domains", &self.domains())
            .field("quantum", &self.core.quantum.is_some())
            .finish_non_exhaustive()
    }
}

impl CycleScheduler {
    pub fn builder(config: OrchestratorConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.core.config
    }

    pub fn committer(&self) -> &Arc<StateCommitter> {
        &self.core.committer
    }

    pub fn journal(&self) -> &SharedJournal {
        &self.core.journal
    }

    pub fn limiter(&self) -> &Arc<AdmissionLimiter> {
        &self.core.limiter
    }

    pub fn forecast(&self) -> &Arc<ForecastEngine> {
        &self.core.forecast
    }

    pub fn domains(&self) -> Vec<String> {
        self.core
            .domains
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Register `spec`. Cycle ids continue after the domain's latest stored record.
    pub fn register_domain(&self, spec: DomainSpec) -> Result<(), HostError> {
        let next = self
            .core
            .committer
            .store()
            .latest(&spec.domain)?
            .map_or(1, |head| head.cycle_id + 1);
        let mut domains = self
            .core
            .domains
            .write()
            .map_err(|_| HostError::Task("domain table poisoned".into()))?;
        if domains.contains_key(&spec.domain) {
            return Err(HostError::DuplicateDomain(spec.domain));
        }
        info!(
            domain = %spec.domain,
            assets = spec.assets.len(),
            profile = %spec.policy_profile,
            next_cycle = next,
            "domain registered"
        );
        domains.insert(
            spec.domain.clone(),
            Arc::new(DomainState {
                spec,
                gate: Arc::new(tokio::sync::Mutex::new(())),
                next_cycle: AtomicU64::new(next),
                last_good: Mutex::new(None),
            }),
        );
        Ok(())
    }

    /// Run one cycle for `domain` now, waiting for any in-flight cycle of the same
    /// domain to finish first.
    pub async fn run_cycle(
        &self,
        domain: &str,
        total_deadline_ms: u64,
    ) -> Result<Cycle, HostError> {
        let state = self.state(domain)?;
        let gate = state.gate.clone().lock_owned().await;
        let horizon_s = self.core.config.forecast_horizon_s;
        Ok(self
            .core
            .run_gated(&state, gate, total_deadline_ms, horizon_s)
            .await)
    }

    /// Fire cycles for every domain each `cadence` until [`CycleScheduler::stop`].
    pub fn start(&self, cadence: Duration, horizon_s: u64) -> Result<(), HostError> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| HostError::Task("scheduler state poisoned".into()))?;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(HostError::AlreadyRunning);
        }
        let stop = AbortController::new();
        if let Ok(mut shutdown) = self.core.shutdown.lock() {
            *shutdown = stop.signal();
        }
        let handle = tokio::spawn(self.core.clone().tick_loop(cadence, horizon_s, stop.signal()));
        *running = Some(RunningLoop { stop, handle });
        Ok(())
    }

    /// Stop the cadence loop. In-flight cycles are cancelled and end degraded.
    pub async fn stop(&self) -> Result<(), HostError> {
        let running = self
            .running
            .lock()
            .map_err(|_| HostError::Task("scheduler state poisoned".into()))?
            .take();
        let Some(running) = running else {
            return Ok(());
        };
        running.stop.abort();
        let joined = running.handle.await;
        // Cycles run by hand after a stop must not inherit the aborted signal.
        if let Ok(mut shutdown) = self.core.shutdown.lock() {
            *shutdown = AbortController::new().signal();
        }
        joined.map_err(|err| HostError::Task(err.to_string()))
    }

    /// Last committed record for `domain`; degraded and failed cycles never change it.
    pub fn latest_state(&self, domain: &str) -> Result<Option<StateRecord>, HostError> {
        Ok(self.core.committer.store().latest(domain)?)
    }

    /// Stream of every record committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StateRecord> {
        self.core.updates.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.core.stats;
        SchedulerStats {
            cycles_started: counters.started.load(Ordering::Relaxed),
            committed: counters.committed.load(Ordering::Relaxed),
            degraded: counters.degraded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            skipped_ticks: counters.skipped.load(Ordering::Relaxed),
            admission: self.core.limiter.stats(),
        }
    }

    fn state(&self, domain: &str) -> Result<Arc<DomainState>, HostError> {
        self.core
            .domains
            .read()
            .map_err(|_| HostError::Task("domain table poisoned".into()))?
            .get(domain)
            .cloned()
            .ok_or_else(|| HostError::UnknownDomain(domain.to_string()))
    }
}

/// Assembles a [`CycleScheduler`] from its collaborators.
pub struct SchedulerBuilder {
    config: OrchestratorConfig,
    classical: Option<Arc<dyn SolverAdapter>>,
    quantum: Option<Arc<dyn SolverAdapter>>,
    limiter: Option<Arc<AdmissionLimiter>>,
    federation: Option<FederationCoordinator>,
    forecast_source: Option<Arc<dyn ForecastSource>>,
    committer: Option<Arc<StateCommitter>>,
    journal: Option<SharedJournal>,
}

impl SchedulerBuilder {
    fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            classical: None,
            quantum: None,
            limiter: None,
            federation: None,
            forecast_source: None,
            committer: None,
            journal: None,
        }
    }

    pub fn classical(mut self, solver: Arc<dyn SolverAdapter>) -> Self {
        self.classical = Some(solver);
        self
    }

    /// Ignored when `config.quantum.enabled` is false.
    pub fn quantum(mut self, solver: Arc<dyn SolverAdapter>) -> Self {
        self.quantum = Some(solver);
        self
    }

    pub fn limiter(mut self, limiter: Arc<AdmissionLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Quorum rounding, tie-break and threshold from the config are applied on build.
    pub fn federation(mut self, coordinator: FederationCoordinator) -> Self {
        self.federation = Some(coordinator);
        self
    }

    pub fn forecast_source(mut self, source: Arc<dyn ForecastSource>) -> Self {
        self.forecast_source = Some(source);
        self
    }

    pub fn committer(mut self, committer: Arc<StateCommitter>) -> Self {
        self.committer = Some(committer);
        self
    }

    pub fn journal(mut self, journal: SharedJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn build(self) -> Result<CycleScheduler, HostError> {
        let config = self.config;
        config.validate()?;
        let committer = self.committer.ok_or(HostError::Missing("state committer"))?;
        let forecast_source = self
            .forecast_source
            .ok_or(HostError::Missing("forecast source"))?;
        let mut federation = self
            .federation
            .ok_or(HostError::Missing("federation coordinator"))?
            .with_rounding(config.quorum.rounding, config.quorum.tolerance)
            .with_tie_break(config.quorum.tie_break);
        if let Some(threshold) = config.quorum.threshold {
            federation = federation.with_threshold(threshold);
        }
        let classical = self
            .classical
            .unwrap_or_else(|| Arc::new(ClassicalSolver::default()));
        let quantum = config.quantum.enabled.then(|| {
            self.quantum.unwrap_or_else(|| {
                Arc::new(
                    QuantumSolver::new("qsa", config.quantum.seed)
                        .with_strategy(config.quantum.strategy),
                )
            })
        });
        let limiter = self.limiter.unwrap_or_else(|| {
            Arc::new(AdmissionLimiter::new(
                config.admission.limit,
                config.admission.mode,
                Duration::from_millis(config.admission.queue_wait_ms),
            ))
        });
        let forecast = Arc::new(ForecastEngine::new(forecast_source, config.staleness_bound_ms));
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Ok(CycleScheduler {
            core: Arc::new(SchedulerCore {
                classical,
                quantum,
                limiter,
                federation: Arc::new(federation),
                forecast,
                committer,
                journal: self.journal.unwrap_or_else(SharedJournal::in_memory),
                updates,
                stats: StatCounters::default(),
                domains: RwLock::new(BTreeMap::new()),
                shutdown: Mutex::new(AbortController::new().signal()),
                config,
            }),
            running: Mutex::new(None),
        })
    }
}
