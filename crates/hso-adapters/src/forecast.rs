//! Forward forecast fields with staleness tracking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use hso_contracts::{Area, Deadline, Field, FieldKind, PastWindow, StageError, now_wallclock_ms};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ForecastError;

#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn nowcast(&self, area: &Area, horizon_s: u64) -> anyhow::Result<Field>;

    async fn retrodict(&self, area: &Area, window: PastWindow) -> anyhow::Result<Field>;
}

#[derive(Debug, Clone)]
struct Observation {
    at_ms: u64,
    values: Vec<f64>,
}

/// Extrapolates the trend between the two most recent observations of an area; with a
/// single observation the field stays flat.
#[derive(Debug)]
pub struct PersistenceForecaster {
    step_s: u64,
    max_history: usize,
    observations: Mutex<HashMap<String, Vec<Observation>>>,
}

impl Default for PersistenceForecaster {
    fn default() -> Self {
        Self::new(60)
    }
}

impl PersistenceForecaster {
    pub fn new(step_s: u64) -> Self {
        Self {
            step_s: step_s.max(1),
            max_history: 256,
            observations: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe(&self, area: &Area, at_ms: u64, values: Vec<f64>) -> anyhow::Result<()> {
        if values.len() != area.cells as usize {
            bail!(
                "area '{}' has {} cells, observation has {}",
                area.id,
                area.cells,
                values.len()
            );
        }
        let mut map = self
            .observations
            .lock()
            .map_err(|_| anyhow!("observation store poisoned"))?;
        let history = map.entry(area.id.clone()).or_default();
        let position = history.partition_point(|o| o.at_ms <= at_ms);
        history.insert(position, Observation { at_ms, values });
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(..excess);
        }
        Ok(())
    }

    fn history(&self, area: &Area) -> anyhow::Result<Vec<Observation>> {
        let map = self
            .observations
            .lock()
            .map_err(|_| anyhow!("observation store poisoned"))?;
        map.get(&area.id)
            .filter(|h| !h.is_empty())
            .cloned()
            .with_context(|| format!("no observations for area '{}'", area.id))
    }

    fn field(&self, kind: FieldKind, area: &Area, horizon_s: u64, grid: Vec<Vec<f64>>) -> Field {
        Field {
            kind,
            area: area.clone(),
            horizon_s,
            step_s: self.step_s,
            grid,
            generated_at_ms: now_wallclock_ms(),
            staleness_bound_ms: 0,
        }
    }
}

/// Value of every cell at `at_ms`, linearly interpolated between neighbours and held
/// flat past either end of the history.
fn interpolate(history: &[Observation], at_ms: u64) -> Vec<f64> {
    let after = history.partition_point(|o| o.at_ms <= at_ms);
    if after == 0 {
        return history[0].values.clone();
    }
    if after == history.len() {
        return history[history.len() - 1].values.clone();
    }
    let (lo, hi) = (&history[after - 1], &history[after]);
    let span = (hi.at_ms - lo.at_ms) as f64;
    let t = (at_ms - lo.at_ms) as f64 / span;
    lo.values
        .iter()
        .zip(&hi.values)
        .map(|(a, b)| a + (b - a) * t)
        .collect()
}

#[async_trait]
impl ForecastSource for PersistenceForecaster {
    async fn nowcast(&self, area: &Area, horizon_s: u64) -> anyhow::Result<Field> {
        let history = self.history(area)?;
        let last = &history[history.len() - 1];
        let slopes: Vec<f64> = match history.len().checked_sub(2).map(|i| &history[i]) {
            Some(prev) if last.at_ms > prev.at_ms => {
                let dt_s = (last.at_ms - prev.at_ms) as f64 / 1_000.0;
                last.values
                    .iter()
                    .zip(&prev.values)
                    .map(|(l, p)| (l - p) / dt_s)
                    .collect()
            }
            _ => vec![0.0; last.values.len()],
        };
        let steps = horizon_s.div_ceil(self.step_s).max(1);
        let grid = (1..=steps)
            .map(|t| {
                let ahead_s = (t * self.step_s) as f64;
                last.values
                    .iter()
                    .zip(&slopes)
                    .map(|(v, s)| v + s * ahead_s)
                    .collect()
            })
            .collect();
        Ok(self.field(FieldKind::Nowcast, area, horizon_s, grid))
    }

    async fn retrodict(&self, area: &Area, window: PastWindow) -> anyhow::Result<Field> {
        if window.end_ms < window.start_ms {
            bail!("window ends before it starts");
        }
        let history = self.history(area)?;
        let step_ms = self.step_s * 1_000;
        let grid = (window.start_ms..=window.end_ms)
            .step_by(step_ms as usize)
            .map(|at_ms| interpolate(&history, at_ms))
            .collect();
        let horizon_s = (window.end_ms - window.start_ms) / 1_000;
        Ok(self.field(FieldKind::Retrodict, area, horizon_s, grid))
    }
}

/// Outcome of refreshing the field for one cycle.
#[derive(Debug)]
pub enum FieldRefresh {
    Fresh(Field),
    /// The refresh failed; the prior field is carried forward and flagged stale.
    Carried { field: Field, error: ForecastError },
    Unavailable(ForecastError),
}

impl FieldRefresh {
    pub fn field(&self) -> Option<&Field> {
        match self {
            FieldRefresh::Fresh(field) | FieldRefresh::Carried { field, .. } => Some(field),
            FieldRefresh::Unavailable(_) => None,
        }
    }

    /// Anything other than a freshly produced field marks the cycle's envelope stale.
    pub fn is_stale(&self) -> bool {
        !matches!(self, FieldRefresh::Fresh(_))
    }

    pub fn stage_errors(&self, now_ms: u64) -> Vec<StageError> {
        match self {
            FieldRefresh::Fresh(_) => Vec::new(),
            FieldRefresh::Carried { field, error } => {
                let mut errors = vec![error.to_stage_error()];
                if field.is_stale(now_ms) && !matches!(error, ForecastError::Stale { .. }) {
                    errors.push(StageError::StaleField {
                        age_ms: field.age_ms(now_ms),
                        bound_ms: field.staleness_bound_ms,
                    });
                }
                errors
            }
            FieldRefresh::Unavailable(error) => vec![error.to_stage_error()],
        }
    }
}

/// Reject `field` once it is older than its staleness bound.
pub fn ensure_fresh(field: &Field, now_ms: u64) -> Result<(), ForecastError> {
    if field.is_stale(now_ms) {
        return Err(ForecastError::Stale {
            age_ms: field.age_ms(now_ms),
            bound_ms: field.staleness_bound_ms,
        });
    }
    Ok(())
}

/// Deadline-bounded front of a [`ForecastSource`] remembering the last fresh field per
/// area.
pub struct ForecastEngine {
    source: Arc<dyn ForecastSource>,
    staleness_bound_ms: u64,
    last: Mutex<HashMap<String, Field>>,
}

impl ForecastEngine {
    pub fn new(source: Arc<dyn ForecastSource>, staleness_bound_ms: u64) -> Self {
        Self {
            source,
            staleness_bound_ms,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn staleness_bound_ms(&self) -> u64 {
        self.staleness_bound_ms
    }

    pub async fn nowcast(
        &self,
        area: &Area,
        horizon_s: u64,
        deadline: Deadline,
    ) -> Result<Field, ForecastError> {
        let budget_ms = deadline.budget_ms();
        let nowcast = self.source.nowcast(area, horizon_s);
        let mut field = match timeout(deadline.remaining(), nowcast).await {
            Ok(result) => result?,
            Err(_) => return Err(ForecastError::Timeout { budget_ms }),
        };
        self.stamp(&mut field);
        ensure_fresh(&field, now_wallclock_ms())?;
        if let Ok(mut last) = self.last.lock() {
            last.insert(area.id.clone(), field.clone());
        }
        debug!(area = %area.id, steps = field.steps(), "nowcast refreshed");
        Ok(field)
    }

    /// Refresh the field for `area`, falling back to the last fresh one on failure.
    pub async fn refresh(&self, area: &Area, horizon_s: u64, deadline: Deadline) -> FieldRefresh {
        match self.nowcast(area, horizon_s, deadline).await {
            Ok(field) => FieldRefresh::Fresh(field),
            Err(error) => match self.latest(area) {
                Some(field) => {
                    let now_ms = now_wallclock_ms();
                    if let Err(expired) = ensure_fresh(&field, now_ms) {
                        warn!(
                            area = %area.id,
                            error = %error,
                            "prior field expired; proceeding without one"
                        );
                        return FieldRefresh::Unavailable(expired);
                    }
                    warn!(area = %area.id, error = %error, "carrying prior field forward");
                    FieldRefresh::Carried { field, error }
                }
                None => {
                    warn!(area = %area.id, error = %error, "no field available");
                    FieldRefresh::Unavailable(error)
                }
            },
        }
    }

    /// Reconstruct a past field; diagnostic use only, never cached as the latest field.
    pub async fn retrodict(
        &self,
        area: &Area,
        window: PastWindow,
        deadline: Deadline,
    ) -> Result<Field, ForecastError> {
        if window.end_ms < window.start_ms {
            return Err(ForecastError::InvalidWindow {
                start_ms: window.start_ms,
                end_ms: window.end_ms,
            });
        }
        let budget_ms = deadline.budget_ms();
        let retrodict = self.source.retrodict(area, window);
        let mut field = match timeout(deadline.remaining(), retrodict).await {
            Ok(result) => result?,
            Err(_) => return Err(ForecastError::Timeout { budget_ms }),
        };
        self.stamp(&mut field);
        Ok(field)
    }

    pub fn latest(&self, area: &Area) -> Option<Field> {
        self.last.lock().ok()?.get(&area.id).cloned()
    }

    fn stamp(&self, field: &mut Field) {
        field.staleness_bound_ms = match field.staleness_bound_ms {
            0 => self.staleness_bound_ms,
            own => own.min(self.staleness_bound_ms),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockForecastSource;
    use std::time::Duration;

    fn area() -> Area {
        Area::new("east", 2)
    }

    #[tokio::test]
    async fn nowcast_extrapolates_trend() {
        let forecaster = PersistenceForecaster::new(60);
        forecaster.observe(&area(), 0, vec![10.0, 20.0]).unwrap();
        forecaster.observe(&area(), 60_000, vec![70.0, 20.0]).unwrap();
        let field = forecaster.nowcast(&area(), 120).await.unwrap();
        assert_eq!(field.kind, FieldKind::Nowcast);
        assert_eq!(field.grid, vec![vec![130.0, 20.0], vec![190.0, 20.0]]);
    }

    #[tokio::test]
    async fn nowcast_without_history_fails() {
        let forecaster = PersistenceForecaster::default();
        assert!(forecaster.nowcast(&area(), 60).await.is_err());
        assert!(forecaster.observe(&area(), 0, vec![1.0]).is_err());
    }

    #[tokio::test]
    async fn retrodict_interpolates_between_observations() {
        let forecaster = PersistenceForecaster::new(30);
        forecaster.observe(&area(), 60_000, vec![4.0, 0.0]).unwrap();
        forecaster.observe(&area(), 0, vec![0.0, 0.0]).unwrap();
        let field = forecaster
            .retrodict(
                &area(),
                PastWindow {
                    start_ms: 0,
                    end_ms: 90_000,
                },
            )
            .await
            .unwrap();
        assert_eq!(field.kind, FieldKind::Retrodict);
        let first_cell: Vec<f64> = field.grid.iter().map(|row| row[0]).collect();
        assert_eq!(first_cell, vec![0.0, 2.0, 4.0, 4.0]);
    }

    #[tokio::test]
    async fn engine_stamps_bound_and_remembers() {
        let engine = ForecastEngine::new(Arc::new(MockForecastSource::new(1.5)), 5_000);
        let field = engine
            .nowcast(&area(), 60, Deadline::after_ms(1_000))
            .await
            .unwrap();
        assert_eq!(field.staleness_bound_ms, 5_000);
        assert_eq!(engine.latest(&area()), Some(field));
    }

    #[tokio::test]
    async fn slow_refresh_carries_prior_field() {
        let source = Arc::new(MockForecastSource::new(1.0));
        let engine = ForecastEngine::new(source.clone(), 60_000);
        let first = engine.refresh(&area(), 60, Deadline::after_ms(1_000)).await;
        assert!(!first.is_stale());

        source.set_latency(Duration::from_millis(300));
        let second = engine.refresh(&area(), 60, Deadline::after_ms(20)).await;
        assert!(second.is_stale());
        assert!(matches!(
            second,
            FieldRefresh::Carried {
                error: ForecastError::Timeout { .. },
                ..
            }
        ));
        assert_eq!(second.field(), first.field());
        let errors = second.stage_errors(now_wallclock_ms());
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn aged_source_field_is_never_fresh() {
        let source = Arc::new(MockForecastSource::new(1.0).with_age(Duration::from_secs(10)));
        let engine = ForecastEngine::new(source, 1_000);
        let refresh = engine.refresh(&area(), 60, Deadline::after_ms(500)).await;
        let FieldRefresh::Unavailable(error) = &refresh else {
            panic!("expected no usable field, got {refresh:?}");
        };
        assert!(matches!(error, ForecastError::Stale { .. }));
        assert!(matches!(
            refresh.stage_errors(now_wallclock_ms())[0],
            StageError::StaleField { .. }
        ));
    }

    #[tokio::test]
    async fn expired_prior_field_is_not_carried() {
        let source = Arc::new(MockForecastSource::new(1.0));
        let engine = ForecastEngine::new(source.clone(), 30);
        let first = engine.refresh(&area(), 60, Deadline::after_ms(500)).await;
        assert!(!first.is_stale());
        source.set_failing(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let refresh = engine.refresh(&area(), 60, Deadline::after_ms(500)).await;
        assert!(refresh.is_stale());
        assert!(refresh.field().is_none());
        assert!(matches!(
            refresh,
            FieldRefresh::Unavailable(ForecastError::Stale { .. })
        ));
        let errors = refresh.stage_errors(now_wallclock_ms());
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, StageError::StaleField { .. }))
        );
    }

    #[tokio::test]
    async fn engine_rejects_inverted_window() {
        let engine = ForecastEngine::new(Arc::new(PersistenceForecaster::default()), 1_000);
        let err = engine
            .retrodict(
                &area(),
                PastWindow {
                    start_ms: 10,
                    end_ms: 5,
                },
                Deadline::after_ms(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForecastError::InvalidWindow { .. }));
    }
}
