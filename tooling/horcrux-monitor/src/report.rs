use crate::models::{CheckResult, ReportDecision, ReportKind, SlotMark, Transition, TransitionKind};
use chrono::{DateTime, Utc};

/// Folds one cycle's results, transitions and scheduler outcome into a single
/// decision. All transitions of the cycle travel in that one decision.
pub fn assemble(
    captured_at: DateTime<Utc>,
    results: Vec<CheckResult>,
    transitions: Vec<Transition>,
    scheduled_slot: Option<SlotMark>,
    startup: bool,
) -> ReportDecision {
    let kind = decide_kind(&transitions, scheduled_slot.is_some(), startup);

    ReportDecision {
        kind,
        captured_at,
        results,
        transitions,
        scheduled_slot,
    }
}

fn decide_kind(transitions: &[Transition], scheduled: bool, startup: bool) -> ReportKind {
    let any = |kind: TransitionKind| transitions.iter().any(|transition| transition.kind == kind);

    if startup {
        ReportKind::Startup
    } else if any(TransitionKind::NewlyAlerting) {
        ReportKind::NewAlert
    } else if any(TransitionKind::Recovered) {
        ReportKind::Recovery
    } else if any(TransitionKind::Unavailable) {
        ReportKind::Unavailable
    } else if any(TransitionKind::Reminder) {
        ReportKind::OngoingReminder
    } else if scheduled {
        ReportKind::Scheduled
    } else {
        ReportKind::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertState, CheckId};
    use chrono::{NaiveDate, NaiveTime};

    fn transition(id: &str, kind: TransitionKind) -> Transition {
        Transition {
            check_id: CheckId::new(id),
            kind,
            previous: AlertState::default(),
            current: AlertState::default(),
        }
    }

    fn slot() -> Option<SlotMark> {
        Some(SlotMark {
            date: NaiveDate::from_ymd_opt(2024, 3, 1)?,
            time: NaiveTime::from_hms_opt(9, 0, 0)?,
        })
    }

    #[test]
    fn alert_wins_over_scheduled_slot() {
        let decision = assemble(
            DateTime::<Utc>::MIN_UTC,
            Vec::new(),
            vec![transition("missed_precommits", TransitionKind::NewlyAlerting)],
            slot(),
            false,
        );

        assert_eq!(decision.kind, ReportKind::NewAlert);
        assert_eq!(decision.scheduled_slot, slot());
    }

    #[test]
    fn mixed_transitions_stay_in_one_decision() {
        let decision = assemble(
            DateTime::<Utc>::MIN_UTC,
            Vec::new(),
            vec![
                transition("sentry_1", TransitionKind::Recovered),
                transition("missed_prevotes", TransitionKind::Reminder),
                transition("height_stale", TransitionKind::NewlyAlerting),
            ],
            None,
            false,
        );

        assert_eq!(decision.kind, ReportKind::NewAlert);
        assert_eq!(decision.transitions.len(), 3);
    }

    #[test]
    fn precedence_below_new_alerts() {
        let kinds = [
            (vec![TransitionKind::Reminder, TransitionKind::Recovered], ReportKind::Recovery),
            (vec![TransitionKind::Reminder, TransitionKind::Unavailable], ReportKind::Unavailable),
            (vec![TransitionKind::Reminder], ReportKind::OngoingReminder),
        ];

        for (transitions, expected) in kinds {
            let transitions = transitions
                .into_iter()
                .map(|kind| transition("check", kind))
                .collect();
            let decision = assemble(DateTime::<Utc>::MIN_UTC, Vec::new(), transitions, slot(), false);
            assert_eq!(decision.kind, expected);
        }
    }

    #[test]
    fn scheduled_or_nothing_when_quiet() {
        let scheduled = assemble(DateTime::<Utc>::MIN_UTC, Vec::new(), Vec::new(), slot(), false);
        assert_eq!(scheduled.kind, ReportKind::Scheduled);

        let quiet = assemble(DateTime::<Utc>::MIN_UTC, Vec::new(), Vec::new(), None, false);
        assert!(quiet.is_none());
    }

    #[test]
    fn startup_replaces_every_other_kind() {
        let decision = assemble(
            DateTime::<Utc>::MIN_UTC,
            Vec::new(),
            vec![transition("metrics_endpoint", TransitionKind::NewlyAlerting)],
            slot(),
            true,
        );

        assert_eq!(decision.kind, ReportKind::Startup);
        assert_eq!(decision.transitions.len(), 1);
    }
}
