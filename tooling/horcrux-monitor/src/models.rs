use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Metric name plus its label set. Labels live in a `BTreeMap`, so two
/// samples with the same labels in a different order map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl MetricKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.labels.is_empty() {
            return Ok(());
        }

        f.write_str("{")?;
        for (position, (name, value)) in self.labels.iter().enumerate() {
            if position > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        f.write_str("}")
    }
}

/// One scrape of the signer's metrics endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub captured_at: DateTime<Utc>,
    values: BTreeMap<MetricKey, f64>,
}

impl MetricsSnapshot {
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            values: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: MetricKey, value: f64) {
        self.values.insert(key, value);
    }

    pub fn with_value(mut self, key: MetricKey, value: f64) -> Self {
        self.insert(key, value);
        self
    }

    /// NaN samples are reported as absent: they cannot be compared against
    /// thresholds or previous values.
    pub fn get(&self, key: &MetricKey) -> Option<f64> {
        self.values.get(key).copied().filter(|value| !value.is_nan())
    }

    pub fn get_unlabeled(&self, name: &str) -> Option<f64> {
        self.get(&MetricKey::new(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|key| key.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    MetricsScrape,
    Tcp,
    RpcHeight,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::MetricsScrape => "metrics scrape",
            Self::Tcp => "tcp",
            Self::RpcHeight => "rpc",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub target: String,
    pub kind: ProbeKind,
    pub success: bool,
    pub value: Option<f64>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn ok(target: impl Into<String>, kind: ProbeKind, value: Option<f64>) -> Self {
        Self {
            target: target.into(),
            kind,
            success: true,
            value,
            error: None,
        }
    }

    pub fn failed(target: impl Into<String>, kind: ProbeKind, error: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kind,
            success: false,
            value: None,
            error: Some(error.into()),
        }
    }
}

/// Everything the collector observed during one cycle. A failed scrape shows
/// up as `snapshot: None` next to a failed `MetricsScrape` probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleInput {
    pub captured_at: DateTime<Utc>,
    pub snapshot: Option<MetricsSnapshot>,
    pub probes: Vec<ProbeResult>,
}

impl CycleInput {
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            snapshot: None,
            probes: Vec::new(),
        }
    }

    pub fn with_snapshot(mut self, snapshot: MetricsSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_probe(mut self, probe: ProbeResult) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn metric(&self, key: &MetricKey) -> Option<f64> {
        self.snapshot.as_ref().and_then(|snapshot| snapshot.get(key))
    }

    pub fn probes_for<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a ProbeResult> + 'a {
        self.probes.iter().filter(move |probe| probe.target == target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckId(String);

impl CheckId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CheckId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Section of the status report a check is listed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CheckGroup {
    Signing,
    Cosigners,
    Sentries,
    Raft,
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Bad,
    Unavailable,
}

/// Memoryless outcome of one check in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: CheckId,
    pub label: String,
    pub group: CheckGroup,
    pub severity: Severity,
    pub sticky_threshold: u32,
    pub status: CheckStatus,
    /// Raw value the next cycle compares against (counters, heights).
    pub value: Option<f64>,
    /// Run length of identical values, only set by staleness checks.
    pub unchanged_cycles: Option<u32>,
    pub detail: String,
}

impl CheckResult {
    pub fn is_bad(&self) -> bool {
        self.status == CheckStatus::Bad
    }

    pub fn is_unavailable(&self) -> bool {
        self.status == CheckStatus::Unavailable
    }
}

/// Persisted per-check alerting state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub consecutive_bad_count: u32,
    pub is_currently_alerting: bool,
    pub last_alert_sent_at: Option<DateTime<Utc>>,
    pub alerting_since: Option<DateTime<Utc>>,
    pub last_value: Option<f64>,
    pub unchanged_cycles: u32,
    pub is_unavailable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    NewlyAlerting,
    Reminder,
    Recovered,
    Unavailable,
}

/// A reportable change in one check's alert state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub check_id: CheckId,
    pub kind: TransitionKind,
    pub previous: AlertState,
    pub current: AlertState,
}

/// Identity of one scheduled report slot: local date plus local time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotMark {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub last_fired: Option<SlotMark>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    None,
    Startup,
    NewAlert,
    Recovery,
    Unavailable,
    OngoingReminder,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDecision {
    pub kind: ReportKind,
    pub captured_at: DateTime<Utc>,
    pub results: Vec<CheckResult>,
    pub transitions: Vec<Transition>,
    pub scheduled_slot: Option<SlotMark>,
}

impl ReportDecision {
    pub fn is_none(&self) -> bool {
        self.kind == ReportKind::None
    }

    pub fn transitions_of(&self, kind: TransitionKind) -> impl Iterator<Item = &Transition> {
        self.transitions
            .iter()
            .filter(move |transition| transition.kind == kind)
    }

    pub fn result(&self, id: &CheckId) -> Option<&CheckResult> {
        self.results.iter().find(|result| &result.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_key_ignores_label_insertion_order() {
        let first = MetricKey::new("signer_missed_ephemeral_shares")
            .with_label("peerid", "2")
            .with_label("chain", "cosmoshub-4");
        let second = MetricKey::new("signer_missed_ephemeral_shares")
            .with_label("chain", "cosmoshub-4")
            .with_label("peerid", "2");

        assert_eq!(first, second);
        assert_eq!(
            first.to_string(),
            "signer_missed_ephemeral_shares{chain=\"cosmoshub-4\",peerid=\"2\"}"
        );
    }

    #[test]
    fn snapshot_hides_nan_samples() {
        let snapshot = MetricsSnapshot::new(DateTime::<Utc>::MIN_UTC)
            .with_value(MetricKey::new("go_goroutines"), f64::NAN)
            .with_value(MetricKey::new("signer_missed_prevotes"), 2.0);

        assert_eq!(snapshot.get_unlabeled("go_goroutines"), None);
        assert_eq!(snapshot.get_unlabeled("signer_missed_prevotes"), Some(2.0));
        assert_eq!(snapshot.len(), 2);
    }
}
