use crate::{
    alerter::Notifier,
    checks::build_check_table,
    collector::SnapshotSource,
    config::AppConfig,
    engine::HealthEngine,
    evaluator::{EvaluatorError, RuleEvaluator},
    models::{CycleInput, ReportDecision},
    render::Renderer,
    scheduler::ReportScheduler,
    storage::{PersistedState, StateStore},
    tracker::AlertTracker,
};
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds the engine for `config`, resuming from `persisted`.
pub fn build_engine(config: &AppConfig, persisted: PersistedState) -> Result<HealthEngine, EvaluatorError> {
    let evaluator = RuleEvaluator::new(build_check_table(&config.thresholds, &config.cluster))?;
    let tracker = AlertTracker::new(config.alert_cooldown, persisted.alerts);
    let scheduler = ReportScheduler::new(config.schedule_slots.clone(), config.timezone, persisted.schedule);

    info!(
        checks = evaluator.definitions().len(),
        slots = config.schedule_slots.len(),
        timezone = %config.timezone,
        "health engine ready"
    );
    Ok(HealthEngine::new(evaluator, tracker, scheduler))
}

/// Runs one full cycle: evaluate, dispatch the report if any, persist.
/// Transport and storage failures are logged and never change the decision.
pub async fn process_cycle(
    engine: &mut HealthEngine,
    store: &mut StateStore,
    renderer: &Renderer,
    notifier: &impl Notifier,
    input: &CycleInput,
) -> ReportDecision {
    let decision = engine.step(input);

    if let Some(report) = renderer.render(&decision, input) {
        if let Err(error) = notifier.send_report(&report).await {
            warn!(kind = ?decision.kind, %error, "report delivery incomplete");
        }
    }

    persist(engine, store);
    decision
}

pub fn persist(engine: &HealthEngine, store: &mut StateStore) {
    if let Err(error) = store.save(engine.alert_store(), engine.schedule_state()) {
        warn!(%error, "failed to persist state, retrying next cycle");
    }
}

/// Collects one cycle unless shutdown is requested first. A collection
/// interrupted by shutdown gets `grace` to finish and is then discarded.
pub async fn collect_until_shutdown(
    source: &impl SnapshotSource,
    shutdown: &CancellationToken,
    grace: Duration,
) -> Option<CycleInput> {
    if shutdown.is_cancelled() {
        return None;
    }

    let collection = source.collect();
    tokio::pin!(collection);

    tokio::select! {
        input = &mut collection => (!shutdown.is_cancelled()).then_some(input),
        () = shutdown.cancelled() => {
            info!(grace_secs = grace.as_secs(), "shutdown requested during collection");
            match time::timeout(grace, collection).await {
                Ok(_) => debug!("in-flight collection finished, result discarded"),
                Err(_) => warn!("in-flight collection abandoned after grace period"),
            }
            None
        }
    }
}
