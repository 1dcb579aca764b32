use crate::{
    catalog,
    config::{ClusterTopology, Thresholds},
    models::{CheckGroup, CheckId, MetricKey, Severity},
};

pub const METRICS_TARGET: &str = "signer";

#[derive(Debug, Clone, PartialEq)]
pub enum CheckRule {
    /// Bad while the metric is strictly above `max`.
    Threshold { metric: MetricKey, max: f64 },
    /// Bad when a monotonic counter rose since the previous cycle.
    CounterIncrease { metric: MetricKey },
    /// Bad once the same value has been seen for `cycles` consecutive cycles.
    Staleness { metric: MetricKey, cycles: u32 },
    /// Bad while `numerator / denominator` is above `max_percent` percent.
    Ratio {
        numerator: MetricKey,
        denominator: MetricKey,
        max_percent: f64,
    },
    /// Bad when any probe for `target` failed, or when `counter` grew.
    /// With `requires_signer_metrics`, a successful scrape that carries no
    /// known `signer_*` series is bad as well.
    Reachability {
        target: String,
        counter: Option<MetricKey>,
        missing_probe_fails: bool,
        requires_signer_metrics: bool,
    },
    /// Bad when the spread of RPC heights across `targets` exceeds `max_blocks`.
    HeightDivergence { targets: Vec<String>, max_blocks: f64 },
}

impl CheckRule {
    pub fn metrics(&self) -> Vec<&MetricKey> {
        match self {
            Self::Threshold { metric, .. }
            | Self::CounterIncrease { metric }
            | Self::Staleness { metric, .. } => vec![metric],
            Self::Ratio {
                numerator,
                denominator,
                ..
            } => vec![numerator, denominator],
            Self::Reachability { counter, .. } => counter.iter().collect(),
            Self::HeightDivergence { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckDefinition {
    pub id: CheckId,
    pub label: String,
    pub group: CheckGroup,
    pub severity: Severity,
    pub sticky_threshold: u32,
    pub rule: CheckRule,
}

impl CheckDefinition {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        group: CheckGroup,
        severity: Severity,
        rule: CheckRule,
    ) -> Self {
        Self {
            id: CheckId::new(id),
            label: label.into(),
            group,
            severity,
            sticky_threshold: 1,
            rule,
        }
    }

    pub fn debounced(mut self, cycles: u32) -> Self {
        self.sticky_threshold = cycles;
        self
    }
}

pub fn cosigner_target(shard_id: u32) -> String {
    format!("cosigner-{shard_id}")
}

pub fn sentry_target(index: usize) -> String {
    format!("sentry-{index}")
}

/// Builds the full check table for one cluster.
pub fn build_check_table(thresholds: &Thresholds, cluster: &ClusterTopology) -> Vec<CheckDefinition> {
    use CheckGroup::{Cosigners, Process, Raft, Sentries, Signing};
    use Severity::{Critical, Warning};

    let counter = |id: &str, label: &str, group, severity, name: &str| {
        CheckDefinition::new(
            id,
            label,
            group,
            severity,
            CheckRule::CounterIncrease {
                metric: MetricKey::new(name),
            },
        )
    };
    let threshold = |id: &str, label: &str, severity, name: &str, max: f64| {
        CheckDefinition::new(
            id,
            label,
            Signing,
            severity,
            CheckRule::Threshold {
                metric: MetricKey::new(name),
                max,
            },
        )
    };

    let mut checks = vec![
        CheckDefinition::new(
            "metrics_endpoint",
            "Metrics endpoint",
            Signing,
            Critical,
            CheckRule::Reachability {
                target: METRICS_TARGET.to_owned(),
                counter: None,
                missing_probe_fails: true,
                requires_signer_metrics: true,
            },
        ),
        CheckDefinition::new(
            "height_stale",
            "Last prevote height",
            Signing,
            Critical,
            CheckRule::Staleness {
                metric: MetricKey::new(catalog::LAST_PREVOTE_HEIGHT),
                cycles: thresholds.height_stale_checks,
            },
        ),
        threshold(
            "missed_prevotes",
            "Missed prevotes (consecutive)",
            Warning,
            catalog::MISSED_PREVOTES,
            thresholds.missed_prevotes,
        ),
        threshold(
            "missed_precommits",
            "Missed precommits (consecutive)",
            Critical,
            catalog::MISSED_PRECOMMITS,
            thresholds.missed_precommits,
        ),
        threshold(
            "seconds_since_last_sign",
            "Seconds since last precommit",
            Critical,
            catalog::SECONDS_SINCE_LAST_PRECOMMIT,
            thresholds.seconds_since_last_sign,
        ),
        counter(
            "insufficient_cosigners",
            "Insufficient cosigner errors",
            Signing,
            Critical,
            catalog::INSUFFICIENT_COSIGNER_ERRORS,
        ),
        counter(
            "invalid_signatures",
            "Invalid signature errors",
            Signing,
            Warning,
            catalog::INVALID_SIGNATURE_ERRORS,
        ),
        counter(
            "beyond_block_errors",
            "Beyond-block errors",
            Signing,
            Warning,
            catalog::BEYOND_BLOCK_ERRORS,
        ),
        counter(
            "failed_sign_votes",
            "Failed sign votes",
            Signing,
            Warning,
            catalog::FAILED_SIGN_VOTES,
        ),
        counter(
            "sentry_connect_tries",
            "Sentry connect retries",
            Sentries,
            Warning,
            catalog::SENTRY_CONNECT_TRIES,
        ),
        counter(
            "raft_election_timeouts",
            "Election timeouts",
            Raft,
            Warning,
            catalog::RAFT_ELECTION_TIMEOUTS,
        ),
        CheckDefinition::new(
            "fd_usage",
            "File descriptors",
            Process,
            Warning,
            CheckRule::Ratio {
                numerator: MetricKey::new(catalog::PROCESS_OPEN_FDS),
                denominator: MetricKey::new(catalog::PROCESS_MAX_FDS),
                max_percent: thresholds.fd_usage_percent,
            },
        ),
    ];

    for cosigner in cluster.cosigners.iter().filter(|cosigner| !cosigner.is_self) {
        let shares = MetricKey::new(catalog::MISSED_EPHEMERAL_SHARES)
            .with_label(catalog::PEER_ID_LABEL, cosigner.address.clone());
        checks.push(
            CheckDefinition::new(
                format!("cosigner_{}", cosigner.shard_id),
                format!("Cosigner shard {} ({})", cosigner.shard_id, cosigner.address),
                Cosigners,
                Warning,
                CheckRule::Reachability {
                    target: cosigner_target(cosigner.shard_id),
                    counter: Some(shares),
                    missing_probe_fails: false,
                    requires_signer_metrics: false,
                },
            )
            .debounced(thresholds.cosigner_debounce),
        );
    }

    for sentry in &cluster.sentries {
        checks.push(CheckDefinition::new(
            format!("sentry_{}", sentry.index),
            format!("Sentry {} ({})", sentry.index, sentry.address),
            Sentries,
            Warning,
            CheckRule::Reachability {
                target: sentry_target(sentry.index),
                counter: None,
                missing_probe_fails: false,
                requires_signer_metrics: false,
            },
        ));
    }

    if cluster.sentries.len() >= 2 {
        checks.push(CheckDefinition::new(
            "sentry_height_divergence",
            "Sentry height divergence",
            Sentries,
            Warning,
            CheckRule::HeightDivergence {
                targets: cluster
                    .sentries
                    .iter()
                    .map(|sentry| sentry_target(sentry.index))
                    .collect(),
                max_blocks: thresholds.sentry_height_divergence,
            },
        ));
    }

    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CosignerNode, SentryNode};

    fn cluster() -> ClusterTopology {
        ClusterTopology {
            metrics_url: Some("http://127.0.0.1:6001/metrics".to_owned()),
            threshold: 2,
            shards_total: 3,
            cosigners: vec![
                CosignerNode {
                    shard_id: 1,
                    address: String::new(),
                    is_self: true,
                },
                CosignerNode {
                    shard_id: 2,
                    address: "tcp://10.0.0.2:2222".to_owned(),
                    is_self: false,
                },
                CosignerNode {
                    shard_id: 3,
                    address: "tcp://10.0.0.3:2222".to_owned(),
                    is_self: false,
                },
            ],
            sentries: vec![
                SentryNode {
                    index: 1,
                    address: "tcp://10.1.0.1:1234".to_owned(),
                },
                SentryNode {
                    index: 2,
                    address: "tcp://10.1.0.2:1234".to_owned(),
                },
            ],
        }
    }

    #[test]
    fn builds_one_check_per_remote_cosigner_and_sentry() {
        let checks = build_check_table(&Thresholds::default(), &cluster());
        let ids: Vec<&str> = checks.iter().map(|check| check.id.as_str()).collect();

        assert!(ids.contains(&"cosigner_2"));
        assert!(ids.contains(&"cosigner_3"));
        assert!(!ids.contains(&"cosigner_1"));
        assert!(ids.contains(&"sentry_1"));
        assert!(ids.contains(&"sentry_2"));
        assert!(ids.contains(&"sentry_height_divergence"));
    }

    #[test]
    fn only_cosigner_checks_are_debounced() {
        let checks = build_check_table(&Thresholds::default(), &cluster());

        for check in &checks {
            let expected = if check.group == CheckGroup::Cosigners { 3 } else { 1 };
            assert_eq!(check.sticky_threshold, expected, "{}", check.id);
        }
    }

    #[test]
    fn only_the_metrics_endpoint_requires_signer_series() {
        let checks = build_check_table(&Thresholds::default(), &cluster());
        let strict: Vec<&str> = checks
            .iter()
            .filter(|check| matches!(check.rule, CheckRule::Reachability { requires_signer_metrics: true, .. }))
            .map(|check| check.id.as_str())
            .collect();

        assert_eq!(strict, vec!["metrics_endpoint"]);
    }
}
