use crate::models::{AlertState, CheckId, CheckResult, Transition, TransitionKind};
use chrono::{DateTime, TimeDelta, Utc};
use std::{collections::BTreeMap, time::Duration};
use tracing::{info, warn};

/// Alert state for every check id seen so far. Entries are created on first
/// observation and never removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertStore {
    states: BTreeMap<CheckId, AlertState>,
}

impl AlertStore {
    pub fn get(&self, id: &CheckId) -> Option<&AlertState> {
        self.states.get(id)
    }

    pub fn insert(&mut self, id: CheckId, state: AlertState) {
        self.states.insert(id, state);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CheckId, &AlertState)> {
        self.states.iter()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn alerting(&self) -> impl Iterator<Item = &CheckId> {
        self.states
            .iter()
            .filter(|(_, state)| state.is_currently_alerting)
            .map(|(id, _)| id)
    }
}

impl FromIterator<(CheckId, AlertState)> for AlertStore {
    fn from_iter<I: IntoIterator<Item = (CheckId, AlertState)>>(iter: I) -> Self {
        Self {
            states: iter.into_iter().collect(),
        }
    }
}

/// Debounce, cooldown and recovery bookkeeping on top of raw check results.
#[derive(Debug, Clone)]
pub struct AlertTracker {
    cooldown: TimeDelta,
    store: AlertStore,
}

impl AlertTracker {
    pub fn new(cooldown: Duration, store: AlertStore) -> Self {
        Self {
            cooldown: TimeDelta::from_std(cooldown).unwrap_or(TimeDelta::MAX),
            store,
        }
    }

    pub fn store(&self) -> &AlertStore {
        &self.store
    }

    /// Folds one cycle of results into the store and returns the transitions
    /// worth reporting. Checks absent from `results` keep their state.
    pub fn update(&mut self, results: &[CheckResult], now: DateTime<Utc>) -> Vec<Transition> {
        let mut transitions = Vec::new();

        for result in results {
            let previous = self.store.get(&result.id).cloned().unwrap_or_default();
            let mut current = previous.clone();
            let kind = advance(&mut current, result, now, self.cooldown);

            match kind {
                Some(kind) => info!(check_id = %result.id, ?kind, detail = %result.detail, "alert transition"),
                None if result.is_unavailable() && !previous.is_unavailable => {
                    warn!(check_id = %result.id, detail = %result.detail, "check unavailable");
                }
                None => {}
            }

            self.store.insert(result.id.clone(), current.clone());
            if let Some(kind) = kind {
                transitions.push(Transition {
                    check_id: result.id.clone(),
                    kind,
                    previous,
                    current,
                });
            }
        }

        transitions
    }
}

fn advance(
    state: &mut AlertState,
    result: &CheckResult,
    now: DateTime<Utc>,
    cooldown: TimeDelta,
) -> Option<TransitionKind> {
    if result.is_unavailable() {
        // Counters and alerting flag are held until the check reports again.
        if state.is_unavailable {
            return None;
        }
        state.is_unavailable = true;
        return state
            .is_currently_alerting
            .then_some(TransitionKind::Unavailable);
    }

    state.is_unavailable = false;
    if let Some(value) = result.value {
        state.last_value = Some(value);
    }
    if let Some(run) = result.unchanged_cycles {
        state.unchanged_cycles = run;
    }

    state.consecutive_bad_count = if result.is_bad() {
        state.consecutive_bad_count.saturating_add(1)
    } else {
        0
    };
    // A raised debounce after a restart must not turn an ongoing alert
    // into a recovery while the check is still failing.
    if state.is_currently_alerting && result.is_bad() {
        state.consecutive_bad_count = state.consecutive_bad_count.max(result.sticky_threshold);
    }
    let should_alert = state.consecutive_bad_count >= result.sticky_threshold;

    match (state.is_currently_alerting, should_alert) {
        (false, true) => {
            state.is_currently_alerting = true;
            state.alerting_since = Some(now);
            state.last_alert_sent_at = Some(now);
            Some(TransitionKind::NewlyAlerting)
        }
        (true, true) => {
            let due = state
                .last_alert_sent_at
                .is_none_or(|sent_at| now.signed_duration_since(sent_at) >= cooldown);
            if !due {
                return None;
            }
            state.last_alert_sent_at = Some(now);
            Some(TransitionKind::Reminder)
        }
        (true, false) => {
            state.is_currently_alerting = false;
            state.consecutive_bad_count = 0;
            state.alerting_since = None;
            Some(TransitionKind::Recovered)
        }
        (false, false) => None,
    }
}
