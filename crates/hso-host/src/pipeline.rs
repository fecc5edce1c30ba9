//! Stage execution for a single cycle.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use hso_adapters::{FieldRefresh, SolveRequest, SolverError, choose_better, solve_within};
use hso_cbor::Hash;
use hso_contracts::{
    AbortController, AbortSignal, Allocation, Area, AssetId, Confidence, Cycle, CycleOutcome,
    Deadline, Envelope, Evidence, FieldKind, ImpactClass, LineageLink, Plan, PolicyProfile,
    Problem, SolverKind, StageError, StageKind, StageReport, StageStatus, StateRecord,
    now_wallclock_ms,
};
use hso_kernel::{
    CommitError, CycleEndedRecord, CycleStartedRecord, JournalRecord, StageCompletedRecord,
};
use hso_store::StoreError;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::scheduler::{DomainState, SchedulerCore};

const STAGE_ORDER: [StageKind; 4] = [
    StageKind::Solve,
    StageKind::Federate,
    StageKind::Forecast,
    StageKind::Commit,
];

struct CycleContext {
    envelope: Envelope,
    deadline: Deadline,
    abort: AbortSignal,
    horizon_s: u64,
}

enum Interrupt {
    Deadline,
    Shutdown,
}

struct SolveOutcome {
    plan: Plan,
    area: Area,
    problem_hash: Option<Hash>,
}

/// Hashed body of a committed cycle. Wall-clock timestamps stay out so identical
/// inputs produce identical record hashes.
#[derive(Serialize)]
struct CycleArtifact<'a> {
    domain: &'a str,
    cycle_id: u64,
    plan: PlanSummary<'a>,
    allocation: AllocationSummary<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<FieldSummary<'a>>,
    field_stale: bool,
}

#[derive(Serialize)]
struct PlanSummary<'a> {
    source: SolverKind,
    solver_id: &'a str,
    objective_value: f64,
    confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    assignment: &'a std::collections::BTreeMap<String, i64>,
}

#[derive(Serialize)]
struct AllocationSummary<'a> {
    plan_hash: Hash,
    policy_profile: PolicyProfile,
    impact: ImpactClass,
    required_signatures: usize,
    signers: Vec<&'a AssetId>,
}

#[derive(Serialize)]
struct FieldSummary<'a> {
    kind: FieldKind,
    area: &'a Area,
    horizon_s: u64,
    step_s: u64,
    grid: &'a [Vec<f64>],
}

impl SchedulerCore {
    /// Execute one full cycle for `state` under a hard `total_ms` ceiling.
    pub(crate) async fn run_cycle(
        &self,
        state: &DomainState,
        total_ms: u64,
        horizon_s: u64,
    ) -> Cycle {
        let domain = state.spec.domain.clone();
        let cycle_id = state.next_cycle_id();
        let deadline = Deadline::after_ms(total_ms);
        let started = Instant::now();
        let parent = match self.committer.store().latest(&domain) {
            Ok(head) => head.map(|record| record.id),
            Err(err) => {
                warn!(domain = %domain, error = %err, "could not read domain head");
                None
            }
        };
        let envelope = Envelope::builder(domain.as_str(), "cycle")
            .actor("hso-scheduler")
            .parent_state(parent)
            .deadline(&deadline)
            .build();
        let mut cycle = Cycle::new(
            domain.as_str(),
            cycle_id,
            envelope.trace_id.clone(),
            now_wallclock_ms(),
            total_ms,
        );
        self.stats.started.fetch_add(1, Ordering::Relaxed);
        self.journal_append(JournalRecord::CycleStarted(CycleStartedRecord {
            domain: domain.clone(),
            cycle_id,
            trace_id: cycle.trace_id.clone(),
            started_at_ms: cycle.started_at_ms,
            deadline_ms: total_ms,
        }));
        info!(
            domain = %domain,
            cycle_id,
            trace_id = %cycle.trace_id,
            deadline_ms = total_ms,
            "cycle started"
        );

        let controller = AbortController::new();
        let ctx = CycleContext {
            envelope,
            deadline,
            abort: controller.signal(),
            horizon_s,
        };
        let shutdown = self.shutdown_signal();
        let result = tokio::select! {
            result = timeout(deadline.remaining(), self.execute(state, &mut cycle, &ctx)) => {
                result.map_err(|_| Interrupt::Deadline)
            }
            _ = shutdown.aborted() => Err(Interrupt::Shutdown),
        };
        // Anything still holding the signal (detached solver work) sees the cycle end.
        controller.abort();

        match result {
            Ok(Ok(record)) => {
                cycle.outcome = CycleOutcome::Committed;
                cycle.record_id = Some(record.id.clone());
                self.stats.committed.fetch_add(1, Ordering::Relaxed);
                // No receivers is fine.
                let _ = self.updates.send(record);
            }
            Ok(Err(error)) => {
                cycle.outcome = if error.degrades_cycle() {
                    self.stats.degraded.fetch_add(1, Ordering::Relaxed);
                    CycleOutcome::Degraded
                } else {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    CycleOutcome::Failed
                };
                cycle.diagnostics.push(error.to_string());
            }
            Err(interrupt) => {
                let stage = STAGE_ORDER
                    .get(cycle.stages.len())
                    .copied()
                    .unwrap_or(StageKind::Commit);
                let spent: u64 = cycle.stages.iter().map(|s| s.elapsed_ms).sum();
                let elapsed_ms = (started.elapsed().as_millis() as u64).saturating_sub(spent);
                let error = match interrupt {
                    Interrupt::Deadline => StageError::DeadlineExhausted {
                        stage,
                        budget_ms: total_ms,
                    },
                    Interrupt::Shutdown => StageError::Stage {
                        stage,
                        reason: "cancelled by scheduler shutdown".into(),
                    },
                };
                cycle.diagnostics.push(error.to_string());
                self.push_report(&mut cycle, stage, StageStatus::Failed, elapsed_ms, vec![error]);
                cycle.outcome = CycleOutcome::Degraded;
                self.stats.degraded.fetch_add(1, Ordering::Relaxed);
            }
        }

        cycle.elapsed_ms = started.elapsed().as_millis() as u64;
        self.journal_append(JournalRecord::CycleEnded(CycleEndedRecord {
            domain: domain.clone(),
            cycle_id,
            outcome: cycle.outcome,
            elapsed_ms: cycle.elapsed_ms,
            record_id: cycle.record_id.clone(),
            diagnostics: cycle.diagnostics.clone(),
        }));
        match cycle.outcome {
            CycleOutcome::Committed => info!(
                domain = %domain,
                cycle_id,
                trace_id = %cycle.trace_id,
                elapsed_ms = cycle.elapsed_ms,
                source = ?cycle.plan_source,
                stale = cycle.field_stale,
                "cycle committed"
            ),
            outcome => warn!(
                domain = %domain,
                cycle_id,
                trace_id = %cycle.trace_id,
                elapsed_ms = cycle.elapsed_ms,
                outcome = ?outcome,
                diagnostics = ?cycle.diagnostics,
                "cycle ended without commit"
            ),
        }
        cycle
    }

    async fn execute(
        &self,
        state: &DomainState,
        cycle: &mut Cycle,
        ctx: &CycleContext,
    ) -> Result<StateRecord, StageError> {
        let solved = self.solve_stage(state, cycle, ctx).await?;
        let allocation = self.federate_stage(state, cycle, ctx, &solved.plan).await?;
        let refresh = self.forecast_stage(cycle, ctx, &solved.area).await;
        let record = self
            .commit_stage(state, cycle, ctx, &solved, &allocation, &refresh)
            .await?;
        state.remember(solved.plan, solved.area);
        Ok(record)
    }

    async fn solve_stage(
        &self,
        state: &DomainState,
        cycle: &mut Cycle,
        ctx: &CycleContext,
    ) -> Result<SolveOutcome, StageError> {
        let started = Instant::now();
        let deadline = ctx.deadline.sub_budget(self.config.solve_fraction);
        let mut errors = Vec::new();

        let build = state.spec.problems.build(&cycle.domain, cycle.cycle_id);
        let instance = match timeout(deadline.remaining(), build).await {
            Ok(Ok(instance)) => Some(instance),
            Ok(Err(err)) => {
                errors.push(StageError::Stage {
                    stage: StageKind::Solve,
                    reason: format!("problem source failed: {err:#}"),
                });
                None
            }
            Err(_) => {
                errors.push(StageError::Stage {
                    stage: StageKind::Solve,
                    reason: "problem source did not answer in time".into(),
                });
                None
            }
        };

        let mut fresh = None;
        if let Some(instance) = instance {
            let problem_hash = instance.problem.hash().ok();
            let problem = Arc::new(instance.problem);
            let (classical, quantum) = self.race(problem, deadline, ctx).await;
            let classical = classical
                .map_err(|err| errors.push(err.to_stage_error(deadline.budget_ms())))
                .ok();
            let quantum = quantum.and_then(|(result, budget_ms)| {
                result.map_err(|err| errors.push(err.to_stage_error(budget_ms))).ok()
            });
            let min_confidence = self.config.quantum.min_confidence;
            if let Some(plan) = choose_better(classical, quantum, min_confidence) {
                fresh = Some(SolveOutcome {
                    plan,
                    area: instance.area,
                    problem_hash,
                });
            }
        }

        let (outcome, status) = match fresh {
            Some(outcome) if errors.is_empty() => (outcome, StageStatus::Ok),
            Some(outcome) => (outcome, StageStatus::Fallback),
            None => match state.last_good() {
                Some(last) => {
                    errors.push(StageError::NoPlan {
                        reason: "no solver produced a plan; reusing the last committed plan".into(),
                    });
                    let outcome = SolveOutcome {
                        plan: last.plan,
                        area: last.area,
                        problem_hash: None,
                    };
                    (outcome, StageStatus::Fallback)
                }
                None => {
                    let error = StageError::NoPlan {
                        reason: "no solver produced a plan and no prior plan exists".into(),
                    };
                    errors.push(error.clone());
                    let status = StageStatus::Failed;
                    self.finish_stage(cycle, StageKind::Solve, status, started, errors);
                    return Err(error);
                }
            },
        };
        cycle.plan_source = Some(outcome.plan.source);
        debug!(
            domain = %cycle.domain,
            cycle_id = cycle.cycle_id,
            source = %outcome.plan.source,
            objective = outcome.plan.objective_value,
            "plan chosen"
        );
        self.finish_stage(cycle, StageKind::Solve, status, started, errors);
        Ok(outcome)
    }

    /// Run both solvers under the solve deadline and wait for both to settle. The
    /// quantum result carries the budget it ran under.
    async fn race(
        &self,
        problem: Arc<Problem>,
        deadline: Deadline,
        ctx: &CycleContext,
    ) -> (Result<Plan, SolverError>, Option<(Result<Plan, SolverError>, u64)>) {
        let classical = solve_within(
            self.classical.as_ref(),
            SolveRequest {
                envelope: ctx.envelope.child("solve.classical", &deadline),
                problem: problem.clone(),
                deadline,
                abort: ctx.abort.clone(),
            },
        );
        let quantum = async {
            let adapter = self.quantum.as_ref()?;
            let deadline = deadline.capped(Duration::from_millis(self.config.quantum.budget_ms));
            let budget_ms = deadline.budget_ms();
            // Queueing for a slot must not outlive the solve budget.
            let admitted = match timeout(deadline.remaining(), self.limiter.acquire()).await {
                Ok(admitted) => admitted.map_err(|err| err.to_string()),
                Err(_) => Err(format!("no slot freed within the {budget_ms}ms solve budget")),
            };
            let _permit = match admitted {
                Ok(permit) => permit,
                Err(reason) => {
                    debug!(solver = adapter.id(), reason = %reason, "quantum solve not admitted");
                    let rejected = SolverError::Rejected {
                        solver: adapter.id().to_string(),
                        reason,
                    };
                    return Some((Err(rejected), budget_ms));
                }
            };
            let request = SolveRequest {
                envelope: ctx.envelope.child("solve.quantum", &deadline),
                problem,
                deadline,
                abort: ctx.abort.clone(),
            };
            Some((solve_within(adapter.as_ref(), request).await, budget_ms))
        };
        tokio::join!(classical, quantum)
    }

    async fn federate_stage(
        &self,
        state: &DomainState,
        cycle: &mut Cycle,
        ctx: &CycleContext,
        plan: &Plan,
    ) -> Result<Allocation, StageError> {
        let started = Instant::now();
        let spec = &state.spec;
        let deadline = ctx.deadline.sub_budget(self.config.federate_fraction);
        let envelope = ctx.envelope.child("federate", &deadline);
        match self
            .federation
            .negotiate(
                &envelope,
                &spec.assets,
                plan,
                spec.policy_profile,
                spec.impact,
                deadline,
            )
            .await
        {
            Ok(allocation) => {
                self.finish_stage(cycle, StageKind::Federate, StageStatus::Ok, started, Vec::new());
                Ok(allocation)
            }
            Err(err) => {
                let required = self
                    .federation
                    .required_signatures(spec.policy_profile, spec.assets.len());
                let error = err.to_stage_error(required);
                self.finish_stage(
                    cycle,
                    StageKind::Federate,
                    StageStatus::Failed,
                    started,
                    vec![error.clone()],
                );
                Err(error)
            }
        }
    }

    async fn forecast_stage(
        &self,
        cycle: &mut Cycle,
        ctx: &CycleContext,
        area: &Area,
    ) -> FieldRefresh {
        let started = Instant::now();
        let deadline = ctx.deadline.sub_budget(self.config.forecast_fraction);
        let refresh = self.forecast.refresh(area, ctx.horizon_s, deadline).await;
        let status = match &refresh {
            FieldRefresh::Fresh(_) => StageStatus::Ok,
            FieldRefresh::Carried { .. } => StageStatus::Fallback,
            FieldRefresh::Unavailable(_) => StageStatus::Failed,
        };
        if refresh.is_stale() {
            cycle.field_stale = true;
        }
        let errors = refresh.stage_errors(now_wallclock_ms());
        self.finish_stage(cycle, StageKind::Forecast, status, started, errors);
        refresh
    }

    async fn commit_stage(
        &self,
        state: &DomainState,
        cycle: &mut Cycle,
        ctx: &CycleContext,
        solved: &SolveOutcome,
        allocation: &Allocation,
        refresh: &FieldRefresh,
    ) -> Result<StateRecord, StageError> {
        let started = Instant::now();
        if ctx.abort.is_aborted() || ctx.deadline.remaining() < self.config.commit_reserve() {
            let error = StageError::DeadlineExhausted {
                stage: StageKind::Commit,
                budget_ms: ctx.deadline.budget_ms(),
            };
            let errors = vec![error.clone()];
            self.finish_stage(cycle, StageKind::Commit, StageStatus::Failed, started, errors);
            return Err(error);
        }

        let plan = &solved.plan;
        // A carried field may cross its bound between Forecast and Commit.
        let field = refresh.field().filter(|f| !f.is_stale(now_wallclock_ms()));
        if field.is_none() && refresh.field().is_some() {
            cycle.field_stale = true;
        }
        let mut signers: Vec<&AssetId> =
            allocation.quorum_signatures.iter().map(|s| &s.signer).collect();
        signers.sort();
        let artifact = CycleArtifact {
            domain: &cycle.domain,
            cycle_id: cycle.cycle_id,
            plan: PlanSummary {
                source: plan.source,
                solver_id: &plan.solver_id,
                objective_value: plan.objective_value,
                confidence: plan.confidence,
                seed: plan.seed,
                assignment: &plan.assignment,
            },
            allocation: AllocationSummary {
                plan_hash: allocation.plan_hash,
                policy_profile: allocation.policy_profile,
                impact: allocation.impact,
                required_signatures: allocation.required_signatures,
                signers,
            },
            field: field.map(|f| FieldSummary {
                kind: f.kind,
                area: &f.area,
                horizon_s: f.horizon_s,
                step_s: f.step_s,
                grid: &f.grid,
            }),
            field_stale: cycle.field_stale,
        };

        let mut lineage = Vec::new();
        if let Some(problem_hash) = solved.problem_hash {
            lineage.push(LineageLink::input("problem", problem_hash));
        }
        lineage.push(LineageLink::input("plan", allocation.plan_hash));

        let mut inputs: Vec<Hash> = lineage.iter().map(|l| l.hash).collect();
        let mut evidence = Vec::new();
        if let Ok(hash) = allocation.hash() {
            evidence.push(Evidence {
                kind: "allocation".into(),
                hash,
                detail: serde_json::to_value(&allocation.quorum_signatures).unwrap_or_default(),
            });
        }
        if let Some(hash) = field.and_then(|f| f.hash().ok()) {
            inputs.push(hash);
            evidence.push(Evidence {
                kind: "field".into(),
                hash,
                detail: serde_json::json!({ "stale": cycle.field_stale }),
            });
        }
        let mut envelope = ctx.envelope.with_inputs(inputs);
        if cycle.field_stale {
            envelope = envelope.marked_stale();
        }
        if let Ok(hash) = envelope.hash() {
            evidence.push(Evidence {
                kind: "envelope".into(),
                hash,
                detail: serde_json::to_value(&envelope).unwrap_or_default(),
            });
        }

        let record = match self.committer.commit_state(
            &state.spec.domain,
            cycle.cycle_id,
            &artifact,
            lineage,
            evidence,
        ) {
            Ok(record) => record,
            Err(err) => {
                let error = commit_stage_error(&err);
                if err.is_fatal() {
                    warn!(
                        domain = %cycle.domain,
                        cycle_id = cycle.cycle_id,
                        error = %err,
                        "record rejected"
                    );
                }
                let errors = vec![error.clone()];
                self.finish_stage(cycle, StageKind::Commit, StageStatus::Failed, started, errors);
                return Err(error);
            }
        };

        let mut errors = Vec::new();
        if let Some(anchors) = self.committer.anchors() {
            match anchors.request_anchor(&record) {
                Ok(ticket) => {
                    debug!(state = %record.id, ticket = ticket.ticket_id, "anchor queued")
                }
                Err(err) => errors.push(StageError::AnchorSubmission {
                    reason: err.to_string(),
                }),
            }
        }
        self.finish_stage(cycle, StageKind::Commit, StageStatus::Ok, started, errors);
        Ok(record)
    }

    fn finish_stage(
        &self,
        cycle: &mut Cycle,
        stage: StageKind,
        status: StageStatus,
        started: Instant,
        errors: Vec<StageError>,
    ) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.push_report(cycle, stage, status, elapsed_ms, errors);
    }

    fn push_report(
        &self,
        cycle: &mut Cycle,
        stage: StageKind,
        status: StageStatus,
        elapsed_ms: u64,
        errors: Vec<StageError>,
    ) {
        let report = StageReport {
            stage,
            status,
            elapsed_ms,
            errors,
        };
        debug!(
            domain = %cycle.domain,
            cycle_id = cycle.cycle_id,
            stage = %stage,
            status = ?status,
            elapsed_ms,
            errors = report.errors.len(),
            "stage finished"
        );
        self.journal_append(JournalRecord::StageCompleted(StageCompletedRecord {
            domain: cycle.domain.clone(),
            cycle_id: cycle.cycle_id,
            report: report.clone(),
        }));
        cycle.stages.push(report);
    }

    fn journal_append(&self, record: JournalRecord) {
        if let Err(err) = self.journal.append(&record) {
            warn!(kind = ?record.kind(), error = %err, "journal append failed");
        }
    }
}

fn commit_stage_error(err: &CommitError) -> StageError {
    match err {
        CommitError::HashMismatch {
            expected, actual, ..
        }
        | CommitError::Store(StoreError::HashMismatch {
            expected, actual, ..
        }) => StageError::HashMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        },
        other => StageError::Commit {
            reason: other.to_string(),
        },
    }
}
