use crate::{
    evaluator::RuleEvaluator,
    models::{CycleInput, ReportDecision, ScheduleState},
    report,
    scheduler::ReportScheduler,
    tracker::{AlertStore, AlertTracker},
};
use tracing::info;

/// Evaluation, alert tracking, scheduling and report assembly for one cycle.
/// Performs no I/O.
#[derive(Debug, Clone)]
pub struct HealthEngine {
    evaluator: RuleEvaluator,
    tracker: AlertTracker,
    scheduler: ReportScheduler,
    cycles: u64,
}

impl HealthEngine {
    pub fn new(evaluator: RuleEvaluator, tracker: AlertTracker, scheduler: ReportScheduler) -> Self {
        Self {
            evaluator,
            tracker,
            scheduler,
            cycles: 0,
        }
    }

    pub fn step(&mut self, input: &CycleInput) -> ReportDecision {
        let startup = self.cycles == 0;
        self.cycles = self.cycles.saturating_add(1);

        let results = self.evaluator.evaluate(input, self.tracker.store());
        let transitions = self.tracker.update(&results, input.captured_at);
        let scheduled_slot = self.scheduler.poll(input.captured_at);

        let decision = report::assemble(input.captured_at, results, transitions, scheduled_slot, startup);
        info!(
            cycle = self.cycles,
            kind = ?decision.kind,
            transitions = decision.transitions.len(),
            alerting = self.tracker.store().alerting().count(),
            "cycle evaluated"
        );
        decision
    }

    pub fn alert_store(&self) -> &AlertStore {
        self.tracker.store()
    }

    pub fn schedule_state(&self) -> &ScheduleState {
        self.scheduler.state()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}
