use crate::{
    catalog,
    config::AppConfig,
    evaluator::format_value,
    models::{
        CheckGroup, CheckResult, CheckStatus, CycleInput, ReportDecision, ReportKind, Severity, Transition,
        TransitionKind,
    },
};
use chrono::TimeDelta;
use chrono_tz::Tz;
use std::fmt::Write as _;

/// Text of one outbound report, shared by every transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedReport {
    pub kind: ReportKind,
    pub text: String,
}

impl RenderedReport {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }
}

#[derive(Debug, Clone)]
pub struct Renderer {
    name: String,
    timezone: Tz,
    threshold: u32,
    shards_total: u32,
}

const GROUPS: [CheckGroup; 5] = [
    CheckGroup::Signing,
    CheckGroup::Cosigners,
    CheckGroup::Sentries,
    CheckGroup::Raft,
    CheckGroup::Process,
];

impl Renderer {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            name: config.name.clone(),
            timezone: config.timezone,
            threshold: config.cluster.threshold,
            shards_total: config.cluster.shards_total,
        }
    }

    /// Returns `None` for a `none` decision.
    pub fn render(&self, decision: &ReportDecision, input: &CycleInput) -> Option<RenderedReport> {
        let title = match decision.kind {
            ReportKind::None => return None,
            ReportKind::Startup => "🟢 Monitor started",
            ReportKind::NewAlert => "🚨 ALERT",
            ReportKind::Recovery => "✅ RECOVERED",
            ReportKind::Unavailable => "❔ CHECK UNAVAILABLE",
            ReportKind::OngoingReminder => "🔁 STILL ALERTING",
            ReportKind::Scheduled => "📊 Status report",
        };

        let mut text = format!("{title} [{}]\n", self.name);
        self.write_transitions(&mut text, decision);
        // A slot consumed by an alert still carries the full table.
        let full_table =
            matches!(decision.kind, ReportKind::Startup | ReportKind::Scheduled) || decision.scheduled_slot.is_some();
        if full_table {
            self.write_status_table(&mut text, decision, input);
        } else {
            let without_data = decision.results.iter().filter(|result| result.is_unavailable()).count();
            if without_data > 0 {
                let _ = writeln!(text, "\n❔ {without_data} of {} checks without data this cycle", decision.results.len());
            }
        }

        let local = decision.captured_at.with_timezone(&self.timezone);
        let _ = write!(text, "\n🕒 {}", local.format("%Y-%m-%d %H:%M:%S %Z"));

        Some(RenderedReport {
            kind: decision.kind,
            text,
        })
    }

    fn write_transitions(&self, text: &mut String, decision: &ReportDecision) {
        let alerts: Vec<String> = decision
            .transitions
            .iter()
            .filter(|transition| {
                matches!(transition.kind, TransitionKind::NewlyAlerting | TransitionKind::Reminder)
            })
            .map(|transition| {
                let result = decision.result(&transition.check_id);
                let line = format!("{} {}", severity_icon(result), detail(transition, result));
                match (transition.kind, transition.current.alerting_since) {
                    (TransitionKind::Reminder, Some(since)) => format!(
                        "{line} (alerting for {})",
                        format_duration(decision.captured_at - since)
                    ),
                    _ => line,
                }
            })
            .collect();
        write_section(text, "Alerts", &alerts);

        let recovered: Vec<String> = decision
            .transitions_of(TransitionKind::Recovered)
            .map(|transition| {
                let label = label(transition, decision.result(&transition.check_id));
                match transition.previous.alerting_since {
                    Some(since) => format!(
                        "✅ {label}: recovered, was down for {}",
                        format_duration(decision.captured_at - since)
                    ),
                    None => format!("✅ {label}: recovered"),
                }
            })
            .collect();
        write_section(text, "Recovered", &recovered);

        let unavailable: Vec<String> = decision
            .transitions_of(TransitionKind::Unavailable)
            .map(|transition| {
                let result = decision.result(&transition.check_id);
                format!(
                    "❔ {}; was alerting, state held until data returns",
                    detail(transition, result)
                )
            })
            .collect();
        write_section(text, "Unavailable", &unavailable);
    }

    fn write_status_table(&self, text: &mut String, decision: &ReportDecision, input: &CycleInput) {
        let count = |status: CheckStatus| decision.results.iter().filter(|result| result.status == status).count();
        let _ = writeln!(
            text,
            "\nChecks: {} ok, {} failing, {} unavailable",
            count(CheckStatus::Ok),
            count(CheckStatus::Bad),
            count(CheckStatus::Unavailable)
        );
        if self.shards_total > 0 {
            let _ = writeln!(text, "Cluster: threshold {} of {} shards", self.threshold, self.shards_total);
        }

        for group in GROUPS {
            let mut lines: Vec<String> = decision
                .results
                .iter()
                .filter(|result| result.group == group)
                .map(|result| format!("{} {}", status_icon(result), result.detail))
                .collect();
            lines.extend(informational(group, input));
            write_section(text, group_title(group), &lines);
        }
    }
}

fn write_section(text: &mut String, title: &str, lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    let _ = writeln!(text, "\n{title}");
    for line in lines {
        let _ = writeln!(text, "{line}");
    }
}

fn informational(group: CheckGroup, input: &CycleInput) -> Vec<String> {
    let metrics: &[(&str, &str)] = match group {
        CheckGroup::Signing => &[
            (catalog::LAST_PRECOMMIT_HEIGHT, "Last precommit height"),
            (catalog::SECONDS_SINCE_LAST_SIGN_FINISH, "Seconds since last local sign"),
        ],
        CheckGroup::Cosigners => &[(
            catalog::SECONDS_SINCE_LAST_EPHEMERAL_SHARE,
            "Seconds since last local ephemeral share",
        )],
        CheckGroup::Process => &[
            (catalog::PROCESS_RESIDENT_MEMORY, "Resident memory"),
            (catalog::GO_GOROUTINES, "Goroutines"),
        ],
        CheckGroup::Sentries | CheckGroup::Raft => &[],
    };

    let Some(snapshot) = &input.snapshot else {
        return Vec::new();
    };
    metrics
        .iter()
        .filter_map(|(name, label)| {
            let value = snapshot.get_unlabeled(name)?;
            let shown = if *name == catalog::PROCESS_RESIDENT_MEMORY {
                format!("{:.1} MiB", value / 1_048_576.0)
            } else {
                format_value(value)
            };
            Some(format!("ℹ️ {label}: {shown}"))
        })
        .collect()
}

fn group_title(group: CheckGroup) -> &'static str {
    match group {
        CheckGroup::Signing => "✍️ Signing",
        CheckGroup::Cosigners => "🤝 Cosigners",
        CheckGroup::Sentries => "🛰️ Sentries",
        CheckGroup::Raft => "🗳️ Raft",
        CheckGroup::Process => "⚙️ Process",
    }
}

fn severity_icon(result: Option<&CheckResult>) -> &'static str {
    match result.map(|result| result.severity) {
        Some(Severity::Warning) => "🟠",
        Some(Severity::Critical) | None => "🔴",
    }
}

fn status_icon(result: &CheckResult) -> &'static str {
    match result.status {
        CheckStatus::Ok => "✅",
        CheckStatus::Bad => severity_icon(Some(result)),
        CheckStatus::Unavailable => "❔",
    }
}

fn label<'a>(transition: &'a Transition, result: Option<&'a CheckResult>) -> &'a str {
    result.map_or(transition.check_id.as_str(), |result| result.label.as_str())
}

fn detail<'a>(transition: &'a Transition, result: Option<&'a CheckResult>) -> &'a str {
    result.map_or(transition.check_id.as_str(), |result| result.detail.as_str())
}

/// `Ns`, `Nm`, `NhMm` or `NdHh`. Negative spans render as `0s`.
pub fn format_duration(span: TimeDelta) -> String {
    let seconds = span.num_seconds().max(0);
    let (days, hours, minutes) = (seconds / 86_400, seconds % 86_400 / 3600, seconds % 3600 / 60);

    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{minutes}m")
    } else if seconds < 86_400 {
        format!("{hours}h{minutes}m")
    } else {
        format!("{days}d{hours}h")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use crate::models::{AlertState, CheckId, MetricKey, MetricsSnapshot, SlotMark};
    use std::{
        path::Path,
        time::{Duration, SystemTime},
    };

    fn at(second: u64) -> DateTime<Utc> {
        DateTime::<Utc>::from(SystemTime::UNIX_EPOCH + Duration::from_secs(1_699_920_000 + second))
    }

    fn renderer() -> Option<Renderer> {
        let config = AppConfig::from_yaml("name: cosmoshub\n", Path::new("test.yaml"), |_| None);
        assert!(config.is_ok());
        let config = config.ok()?;
        Some(Renderer::new(&config))
    }

    fn result(id: &str, group: CheckGroup, status: CheckStatus, detail: &str) -> CheckResult {
        CheckResult {
            id: CheckId::new(id),
            label: id.replace('_', " "),
            group,
            severity: Severity::Critical,
            sticky_threshold: 1,
            status,
            value: None,
            unchanged_cycles: None,
            detail: detail.to_owned(),
        }
    }

    fn transition(id: &str, kind: TransitionKind, since: Option<DateTime<Utc>>) -> Transition {
        let state = AlertState {
            alerting_since: since,
            ..AlertState::default()
        };
        Transition {
            check_id: CheckId::new(id),
            kind,
            previous: state.clone(),
            current: state,
        }
    }

    fn decision(kind: ReportKind, results: Vec<CheckResult>, transitions: Vec<Transition>) -> ReportDecision {
        ReportDecision {
            kind,
            captured_at: at(3 * 3600),
            results,
            transitions,
            scheduled_slot: None,
        }
    }

    #[test]
    fn none_decision_renders_nothing() {
        let Some(renderer) = renderer() else { return };
        let quiet = decision(ReportKind::None, Vec::new(), Vec::new());
        assert_eq!(renderer.render(&quiet, &CycleInput::new(at(0))), None);
    }

    #[test]
    fn alert_message_carries_every_co_occurring_transition() {
        let Some(renderer) = renderer() else { return };
        let results = vec![
            result("missed_precommits", CheckGroup::Signing, CheckStatus::Bad, "Missed precommits: 5"),
            result("sentry_1", CheckGroup::Sentries, CheckStatus::Ok, "Sentry 1 reachable"),
        ];
        let transitions = vec![
            transition("missed_precommits", TransitionKind::NewlyAlerting, Some(at(3 * 3600))),
            transition("sentry_1", TransitionKind::Recovered, Some(at(3600 + 1800))),
        ];

        let report = renderer.render(
            &decision(ReportKind::NewAlert, results, transitions),
            &CycleInput::new(at(0)),
        );
        let text = report.map(|report| report.text).unwrap_or_default();

        assert!(text.starts_with("🚨 ALERT [cosmoshub]"));
        assert!(text.contains("🔴 Missed precommits: 5"));
        assert!(text.contains("✅ sentry 1: recovered, was down for 1h30m"));
        assert!(!text.contains("✍️ Signing"));
        // 03:00 UTC is 07:00 in Dubai.
        assert!(text.contains("2023-11-14 07:00:00 +04"));
    }

    #[test]
    fn alert_counts_checks_without_data() {
        let Some(renderer) = renderer() else { return };
        let results = vec![
            result("metrics_endpoint", CheckGroup::Signing, CheckStatus::Bad, "Metrics endpoint unreachable"),
            result("missed_prevotes", CheckGroup::Signing, CheckStatus::Unavailable, "not exported"),
            result("fd_usage", CheckGroup::Process, CheckStatus::Unavailable, "not exported"),
        ];
        let transitions = vec![transition("metrics_endpoint", TransitionKind::NewlyAlerting, Some(at(3 * 3600)))];

        let report = renderer.render(
            &decision(ReportKind::NewAlert, results, transitions),
            &CycleInput::new(at(0)),
        );
        let text = report.map(|report| report.text).unwrap_or_default();

        assert!(text.contains("🔴 Metrics endpoint unreachable"));
        assert!(text.contains("❔ 2 of 3 checks without data this cycle"));
    }

    #[test]
    fn scheduled_report_lists_groups_and_informational_metrics() {
        let Some(renderer) = renderer() else { return };
        let results = vec![
            result("height_stale", CheckGroup::Signing, CheckStatus::Ok, "Last prevote height: 100"),
            result("fd_usage", CheckGroup::Process, CheckStatus::Unavailable, "File descriptors: not exported"),
        ];
        let snapshot = MetricsSnapshot::new(at(0))
            .with_value(MetricKey::new(catalog::GO_GOROUTINES), 42.0)
            .with_value(MetricKey::new(catalog::PROCESS_RESIDENT_MEMORY), 3.0 * 1_048_576.0);
        let input = CycleInput::new(at(0)).with_snapshot(snapshot);

        let report = renderer.render(&decision(ReportKind::Scheduled, results, Vec::new()), &input);
        let text = report.map(|report| report.text).unwrap_or_default();

        assert!(text.contains("Checks: 1 ok, 0 failing, 1 unavailable"));
        assert!(text.contains("✍️ Signing\n✅ Last prevote height: 100"));
        assert!(text.contains("❔ File descriptors: not exported"));
        assert!(text.contains("ℹ️ Goroutines: 42"));
        assert!(text.contains("ℹ️ Resident memory: 3.0 MiB"));
        assert!(!text.contains("🤝 Cosigners"));
    }

    #[test]
    fn reminder_on_a_scheduled_slot_keeps_the_status_table() {
        let Some(renderer) = renderer() else { return };
        let results = vec![
            result("missed_prevotes", CheckGroup::Signing, CheckStatus::Bad, "Missed prevotes: 9"),
            result("fd_usage", CheckGroup::Process, CheckStatus::Ok, "File descriptors: 40/1024 (4%)"),
        ];
        let transitions = vec![transition("missed_prevotes", TransitionKind::Reminder, Some(at(3600)))];
        let mut reminder = decision(ReportKind::OngoingReminder, results, transitions);
        reminder.scheduled_slot = Some(SlotMark {
            date: at(0).date_naive(),
            time: at(3 * 3600).time(),
        });

        let report = renderer.render(&reminder, &CycleInput::new(at(0)));
        let text = report.map(|report| report.text).unwrap_or_default();

        assert!(text.starts_with("🔁 STILL ALERTING [cosmoshub]"));
        assert!(text.contains("(alerting for 2h0m)"));
        assert!(text.contains("Checks: 1 ok, 1 failing, 0 unavailable"));
        assert!(text.contains("⚙️ Process\n✅ File descriptors: 40/1024 (4%)"));
    }

    #[test]
    fn formats_durations() {
        let cases = [
            (TimeDelta::seconds(-5), "0s"),
            (TimeDelta::seconds(59), "59s"),
            (TimeDelta::seconds(60 * 45 + 10), "45m"),
            (TimeDelta::seconds(3600 * 2 + 60 * 5), "2h5m"),
            (TimeDelta::seconds(86_400 * 3 + 3600 * 4 + 59), "3d4h"),
        ];

        for (span, expected) in cases {
            assert_eq!(format_duration(span), expected);
        }
    }
}
