use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use bus::EventBus;
use common::{
    Condition, Error, Fingerprint, MarketDataClient, Pair, Result, TriggerEvent, TriggerPayload,
};
use registry::{ConditionRegistry, TriggerLog};

use crate::predicate::{self, ConditionState};
use crate::snapshot::Snapshot;

const MIN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub tick: Duration,
    /// Upper bound on pairs fetched and evaluated at the same time.
    pub max_concurrent_pairs: usize,
    pub candle_limit: usize,
    pub fetch_timeout: Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            max_concurrent_pairs: 8,
            candle_limit: 200,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Carried state for one pair: the snapshot sequence and per-condition
/// crossing/holding records.
#[derive(Debug, Default, Clone)]
pub struct PairState {
    pub sequence: u64,
    pub conditions: HashMap<Fingerprint, ConditionState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub pairs: usize,
    pub pairs_skipped: usize,
    pub conditions: usize,
    pub evaluation_errors: usize,
    pub triggers: usize,
    pub fetches: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluatorStatus {
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
}

/// Cloneable read handle for health reporting.
#[derive(Clone)]
pub struct EvaluatorHandle {
    status: Arc<RwLock<EvaluatorStatus>>,
}

impl EvaluatorHandle {
    pub async fn status(&self) -> EvaluatorStatus {
        self.status.read().await.clone()
    }
}

/// Shared collaborators for pair jobs within a cycle.
struct CycleContext {
    registry: ConditionRegistry,
    trigger_log: TriggerLog,
    market: Arc<dyn MarketDataClient>,
    bus: Arc<dyn EventBus>,
    candle_limit: usize,
    fetch_timeout: Duration,
}

/// Periodic centralized evaluator.
///
/// Each cycle discovers the active (symbol, timeframe) pairs, then per pair:
/// fetch candles once, compute each referenced indicator once, evaluate
/// every condition against that snapshot, and publish triggers. Pairs run
/// concurrently up to `max_concurrent_pairs`; a failing pair is skipped
/// until the next cycle without affecting the others.
pub struct Evaluator {
    ctx: Arc<CycleContext>,
    config: EvaluatorConfig,
    pairs: HashMap<Pair, PairState>,
    status: Arc<RwLock<EvaluatorStatus>>,
}

impl Evaluator {
    pub fn new(
        registry: ConditionRegistry,
        trigger_log: TriggerLog,
        market: Arc<dyn MarketDataClient>,
        bus: Arc<dyn EventBus>,
        config: EvaluatorConfig,
    ) -> (Self, EvaluatorHandle) {
        let status = Arc::new(RwLock::new(EvaluatorStatus::default()));
        let ctx = Arc::new(CycleContext {
            registry,
            trigger_log,
            market,
            bus,
            candle_limit: config.candle_limit,
            fetch_timeout: config.fetch_timeout,
        });
        let handle = EvaluatorHandle {
            status: status.clone(),
        };
        (
            Self {
                ctx,
                config,
                pairs: HashMap::new(),
                status,
            },
            handle,
        )
    }

    /// Carried state for `pair`, if it was evaluated before.
    pub fn pair_state(&self, pair: &Pair) -> Option<&PairState> {
        self.pairs.get(pair)
    }

    /// Run the evaluation loop until `shutdown` flips to true.
    /// An in-flight cycle is allowed to finish; the caller bounds that
    /// with its own grace period.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(tick = ?self.config.tick, max_concurrent_pairs = self.config.max_concurrent_pairs, "Evaluator running");
        // `interval` panics on a zero period.
        let mut ticker = tokio::time::interval(self.config.tick.max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(report) => {
                    if report.triggers > 0 || report.pairs_skipped > 0 {
                        info!(?report, "Evaluation cycle complete");
                    } else {
                        debug!(?report, "Evaluation cycle complete");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Evaluation cycle skipped — retrying next tick");
                }
            }
        }
        info!("Evaluator stopped");
    }

    /// One full pass over every active pair.
    ///
    /// Fails only when the active pair set cannot be read; per-pair and
    /// per-condition failures are reported in the `CycleReport`.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let active = self.ctx.registry.active_pairs().await?;

        // Pairs with no active conditions are dropped along with their state.
        let keep: HashSet<&Pair> = active.iter().collect();
        self.pairs.retain(|pair, _| keep.contains(pair));

        let jobs: Vec<_> = active
            .into_iter()
            .map(|pair| {
                let state = self.pairs.remove(&pair).unwrap_or_default();
                let ctx = self.ctx.clone();
                async move {
                    let (state, outcome) = evaluate_pair(&ctx, &pair, state).await;
                    (pair, state, outcome)
                }
            })
            .collect();

        let results: Vec<_> = stream::iter(jobs)
            .buffer_unordered(self.config.max_concurrent_pairs.max(1))
            .collect()
            .await;

        let mut report = CycleReport::default();
        for (pair, state, outcome) in results {
            report.pairs += 1;
            report.conditions += outcome.conditions;
            report.evaluation_errors += outcome.evaluation_errors;
            report.triggers += outcome.triggers;
            report.fetches += outcome.fetched as usize;
            if outcome.skipped {
                report.pairs_skipped += 1;
            }
            self.pairs.insert(pair, state);
        }

        let mut status = self.status.write().await;
        status.cycles += 1;
        status.last_cycle_at = Some(Utc::now());
        status.last_report = Some(report.clone());
        Ok(report)
    }
}

#[derive(Debug, Default)]
struct PairOutcome {
    fetched: bool,
    skipped: bool,
    conditions: usize,
    evaluation_errors: usize,
    triggers: usize,
}

impl PairOutcome {
    fn skipped(fetched: bool) -> Self {
        Self {
            fetched,
            skipped: true,
            ..Default::default()
        }
    }
}

/// fetch → compute → evaluate → publish for one pair. Always hands the
/// state back so a failed pair keeps its crossing history.
async fn evaluate_pair(
    ctx: &CycleContext,
    pair: &Pair,
    mut state: PairState,
) -> (PairState, PairOutcome) {
    let conditions = match ctx.registry.active_conditions_for_pair(pair).await {
        Ok(c) => c,
        Err(e) => {
            warn!(%pair, error = %e, "Failed to load conditions — skipping pair");
            return (state, PairOutcome::skipped(false));
        }
    };
    if conditions.is_empty() {
        state.conditions.clear();
        return (state, PairOutcome::default());
    }
    state
        .conditions
        .retain(|fp, _| conditions.iter().any(|c| &c.fingerprint == fp));

    let candles = match fetch(ctx, pair).await {
        Ok(c) => c,
        Err(e) => {
            warn!(%pair, error = %e, "Market data fetch failed — skipping pair");
            return (state, PairOutcome::skipped(true));
        }
    };

    let snapshot = Snapshot::build(
        pair.clone(),
        state.sequence + 1,
        candles,
        conditions.iter().map(|c| &c.def.indicator),
    );
    state.sequence = snapshot.sequence();
    debug!(
        %pair,
        sequence = snapshot.sequence(),
        candles = snapshot.candles().len(),
        indicators = snapshot.computed_indicators(),
        conditions = conditions.len(),
        "Snapshot built"
    );

    let mut outcome = PairOutcome {
        fetched: true,
        conditions: conditions.len(),
        ..Default::default()
    };

    // Evaluate everything first; publishing happens only against the
    // fully built snapshot.
    let mut fired: Vec<(&Condition, f64, ConditionState)> = Vec::new();
    for cond in &conditions {
        match snapshot.latest(&cond.def.indicator) {
            Ok(value) => {
                let prev = state
                    .conditions
                    .get(&cond.fingerprint)
                    .cloned()
                    .unwrap_or_default();
                let step = predicate::step(&cond.def, value, &prev);
                state.conditions.insert(cond.fingerprint.clone(), step.next);
                if step.fired {
                    fired.push((cond, value, prev));
                }
            }
            Err(e) => {
                outcome.evaluation_errors += 1;
                warn!(%pair, fingerprint = %cond.fingerprint, error = %e, "Condition evaluation failed");
            }
        }
    }

    for (cond, value, prev) in fired {
        match publish(ctx, &snapshot, cond, value).await {
            Ok(()) => outcome.triggers += 1,
            Err(e) => {
                // Roll the condition back so the transition fires again next cycle.
                state.conditions.insert(cond.fingerprint.clone(), prev);
                warn!(%pair, fingerprint = %cond.fingerprint, error = %e, "Trigger publish failed, will retry next cycle");
            }
        }
    }

    (state, outcome)
}

async fn fetch(ctx: &CycleContext, pair: &Pair) -> Result<Vec<common::Candle>> {
    let candles = tokio::time::timeout(
        ctx.fetch_timeout,
        ctx.market
            .fetch_candles(&pair.symbol, pair.timeframe, ctx.candle_limit),
    )
    .await
    .map_err(|_| Error::ServiceUnavailable(format!("market data fetch for {pair} timed out")))??;

    if candles.is_empty() {
        return Err(Error::ServiceUnavailable(format!(
            "market data returned no candles for {pair}"
        )));
    }
    Ok(candles)
}

/// Put the trigger on the condition's bus channel, then record it.
/// Stats and audit writes happen only once the event is out and are
/// best-effort; a failed publish leaves no trace so the retry counts once.
async fn publish(ctx: &CycleContext, snapshot: &Snapshot, cond: &Condition, value: f64) -> Result<()> {
    let at = Utc::now();
    let fp = &cond.fingerprint;

    let subscriber_count = match ctx.registry.subscriber_count(fp).await {
        Ok(n) => n.max(0) as u64,
        Err(e) => {
            warn!(fingerprint = %fp, error = %e, "Failed to count subscribers");
            0
        }
    };

    let event = TriggerEvent {
        fingerprint: fp.clone(),
        symbol: snapshot.pair().symbol.clone(),
        timeframe: snapshot.pair().timeframe,
        triggered_at: at,
        payload: TriggerPayload {
            indicator: cond.def.indicator.key(),
            operator: cond.def.operator,
            value,
            sequence: snapshot.sequence(),
        },
        subscriber_count,
    };

    let receivers = ctx
        .bus
        .publish(&fp.channel(), serde_json::to_string(&event)?)
        .await?;

    if let Err(e) = ctx.registry.record_trigger(fp, at).await {
        warn!(fingerprint = %fp, error = %e, "Failed to record trigger stats");
    }
    if let Err(e) = ctx.trigger_log.append(&event).await {
        warn!(fingerprint = %fp, error = %e, "Failed to append trigger log");
    }

    info!(
        fingerprint = %fp,
        pair = %snapshot.pair(),
        value,
        subscribers = subscriber_count,
        receivers,
        "Condition triggered"
    );
    Ok(())
}
