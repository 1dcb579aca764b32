use crate::{
    catalog,
    checks::{CheckDefinition, CheckRule},
    models::{AlertState, CheckId, CheckResult, CheckStatus, CycleInput, MetricKey, ProbeKind},
    tracker::AlertStore,
};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("check {check} references unknown metric {metric}")]
    UnknownMetric { check: CheckId, metric: String },
    #[error("check {0} is defined more than once")]
    DuplicateCheck(CheckId),
    #[error("check {0} needs a sticky threshold of at least 1")]
    InvalidStickyThreshold(CheckId),
    #[error("staleness check {0} needs at least 1 cycle")]
    InvalidStaleCycles(CheckId),
}

/// Applies the static check table to one cycle of observations.
#[derive(Debug, Clone)]
pub struct RuleEvaluator {
    definitions: Vec<CheckDefinition>,
}

struct Outcome {
    status: CheckStatus,
    value: Option<f64>,
    unchanged_cycles: Option<u32>,
    detail: String,
}

impl Outcome {
    fn unavailable(detail: String) -> Self {
        Self {
            status: CheckStatus::Unavailable,
            value: None,
            unchanged_cycles: None,
            detail,
        }
    }

    fn judged(is_bad: bool, value: Option<f64>, detail: String) -> Self {
        Self {
            status: if is_bad { CheckStatus::Bad } else { CheckStatus::Ok },
            value,
            unchanged_cycles: None,
            detail,
        }
    }
}

impl RuleEvaluator {
    pub fn new(definitions: Vec<CheckDefinition>) -> Result<Self, EvaluatorError> {
        let mut seen = BTreeSet::new();

        for definition in &definitions {
            if !seen.insert(definition.id.clone()) {
                return Err(EvaluatorError::DuplicateCheck(definition.id.clone()));
            }
            if definition.sticky_threshold == 0 {
                return Err(EvaluatorError::InvalidStickyThreshold(definition.id.clone()));
            }
            if let CheckRule::Staleness { cycles: 0, .. } = definition.rule {
                return Err(EvaluatorError::InvalidStaleCycles(definition.id.clone()));
            }
            if let Some(metric) = definition
                .rule
                .metrics()
                .into_iter()
                .find(|metric| !catalog::is_known(&metric.name))
            {
                return Err(EvaluatorError::UnknownMetric {
                    check: definition.id.clone(),
                    metric: metric.name.clone(),
                });
            }
        }

        Ok(Self { definitions })
    }

    pub fn definitions(&self) -> &[CheckDefinition] {
        &self.definitions
    }

    /// Returns exactly one result per definition, in definition order.
    pub fn evaluate(&self, input: &CycleInput, prior: &AlertStore) -> Vec<CheckResult> {
        self.definitions
            .iter()
            .map(|definition| {
                let outcome = evaluate_rule(definition, input, prior.get(&definition.id));
                debug!(
                    check_id = %definition.id,
                    status = ?outcome.status,
                    detail = %outcome.detail,
                    "check evaluated"
                );

                CheckResult {
                    id: definition.id.clone(),
                    label: definition.label.clone(),
                    group: definition.group,
                    severity: definition.severity,
                    sticky_threshold: definition.sticky_threshold,
                    status: outcome.status,
                    value: outcome.value,
                    unchanged_cycles: outcome.unchanged_cycles,
                    detail: outcome.detail,
                }
            })
            .collect()
    }
}

fn evaluate_rule(definition: &CheckDefinition, input: &CycleInput, prior: Option<&AlertState>) -> Outcome {
    let label = &definition.label;
    let previous = prior.and_then(|state| state.last_value);

    match &definition.rule {
        CheckRule::Threshold { metric, max } => {
            let Some(value) = input.metric(metric) else {
                return missing_metric(label, metric);
            };
            Outcome::judged(
                value > *max,
                Some(value),
                format!("{label}: {}", format_value(value)),
            )
        }
        CheckRule::CounterIncrease { metric } => {
            let Some(value) = input.metric(metric) else {
                return missing_metric(label, metric);
            };
            let increase = counter_increase(previous, value);
            let detail = match increase {
                Some(delta) => format!(
                    "{label}: {} (+{} since last check)",
                    format_value(value),
                    format_value(delta)
                ),
                None => format!("{label}: {} (stable)", format_value(value)),
            };
            Outcome::judged(increase.is_some(), Some(value), detail)
        }
        CheckRule::Staleness { metric, cycles } => {
            let Some(value) = input.metric(metric) else {
                return missing_metric(label, metric);
            };
            let run = match (previous, prior) {
                (Some(last), Some(state)) if last == value => {
                    state.unchanged_cycles.max(1).saturating_add(1)
                }
                _ => 1,
            };
            let is_bad = run >= *cycles;
            let detail = if is_bad {
                format!("{label} stale at {} for {run} checks", format_value(value))
            } else {
                format!("{label}: {}", format_value(value))
            };
            Outcome {
                status: if is_bad { CheckStatus::Bad } else { CheckStatus::Ok },
                value: Some(value),
                unchanged_cycles: Some(run),
                detail,
            }
        }
        CheckRule::Ratio {
            numerator,
            denominator,
            max_percent,
        } => {
            let (Some(used), Some(limit)) = (input.metric(numerator), input.metric(denominator)) else {
                return Outcome::unavailable(format!("{label}: not exported"));
            };
            if limit <= 0.0 {
                return Outcome::unavailable(format!("{label}: limit reported as {}", format_value(limit)));
            }
            let percent = used / limit * 100.0;
            Outcome::judged(
                percent > *max_percent,
                Some(percent),
                format!(
                    "{label}: {}/{} ({percent:.0}%)",
                    format_value(used),
                    format_value(limit)
                ),
            )
        }
        CheckRule::Reachability {
            target,
            counter,
            missing_probe_fails,
            requires_signer_metrics,
        } => {
            let outcome = evaluate_reachability(label, input, previous, target, counter.as_ref(), *missing_probe_fails);
            if *requires_signer_metrics && outcome.status != CheckStatus::Bad && !has_signer_metrics(input) {
                return Outcome::judged(true, None, format!("{label}: scrape returned no signer metrics"));
            }
            outcome
        }
        CheckRule::HeightDivergence { targets, max_blocks } => {
            let heights: Vec<f64> = input
                .probes
                .iter()
                .filter(|probe| probe.kind == ProbeKind::RpcHeight && targets.contains(&probe.target))
                .filter_map(|probe| probe.value)
                .collect();
            if heights.len() < 2 {
                return Outcome::unavailable(format!("{label}: fewer than two sentry heights"));
            }
            let highest = heights.iter().copied().fold(f64::MIN, f64::max);
            let lowest = heights.iter().copied().fold(f64::MAX, f64::min);
            let spread = highest - lowest;
            Outcome::judged(
                spread > *max_blocks,
                Some(spread),
                format!("{label}: {} blocks", format_value(spread)),
            )
        }
    }
}

fn evaluate_reachability(
    label: &str,
    input: &CycleInput,
    previous: Option<f64>,
    target: &str,
    counter: Option<&MetricKey>,
    missing_probe_fails: bool,
) -> Outcome {
    let probes: Vec<_> = input.probes_for(target).collect();
    let counter_value = counter.and_then(|metric| input.metric(metric));

    if probes.is_empty() && counter_value.is_none() && !missing_probe_fails {
        return Outcome::unavailable(format!("{label}: no probe or metric this cycle"));
    }

    let failures: Vec<String> = probes
        .iter()
        .filter(|probe| !probe.success)
        .map(|probe| match &probe.error {
            Some(error) => format!("{} failed: {error}", probe.kind),
            None => format!("{} failed", probe.kind),
        })
        .collect();
    if !failures.is_empty() {
        return Outcome::judged(
            true,
            counter_value,
            format!("{label} unreachable ({})", failures.join("; ")),
        );
    }
    if probes.is_empty() && missing_probe_fails {
        return Outcome::judged(true, counter_value, format!("{label} unreachable (not probed)"));
    }

    match (counter_value, counter_value.and_then(|value| counter_increase(previous, value))) {
        (Some(value), Some(delta)) => Outcome::judged(
            true,
            Some(value),
            format!(
                "{label} missed ephemeral shares: {} (+{})",
                format_value(value),
                format_value(delta)
            ),
        ),
        (Some(value), None) => Outcome::judged(
            false,
            Some(value),
            format!("{label} reachable, missed ephemeral shares: {}", format_value(value)),
        ),
        (None, _) => {
            let height = probes
                .iter()
                .filter(|probe| probe.kind == ProbeKind::RpcHeight)
                .find_map(|probe| probe.value);
            let detail = match height {
                Some(height) => format!("{label} reachable, height {}", format_value(height)),
                None => format!("{label} reachable"),
            };
            Outcome::judged(false, None, detail)
        }
    }
}

/// A scrape can answer 200 without carrying any signer series: a wrong
/// address, a proxy error page, or an exporter with nothing registered.
fn has_signer_metrics(input: &CycleInput) -> bool {
    input
        .snapshot
        .as_ref()
        .is_some_and(|snapshot| snapshot.names().any(catalog::is_signer_metric))
}

/// Positive difference between `current` and the previous cycle's value.
/// A drop (process restart) counts as no increase.
fn counter_increase(previous: Option<f64>, current: f64) -> Option<f64> {
    previous
        .filter(|previous| current > *previous)
        .map(|previous| current - previous)
}

fn missing_metric(label: &str, metric: &MetricKey) -> Outcome {
    Outcome::unavailable(format!("{label}: {metric} not exported"))
}

/// Integral values print without a fractional part.
pub fn format_value(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.1}")
    }
}
