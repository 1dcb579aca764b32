//! Metric names exported by the Horcrux signer that the monitor knows about.
//!
//! Check definitions may only reference names listed in [`KNOWN_METRICS`];
//! the evaluator refuses to start otherwise.

pub const LAST_PREVOTE_HEIGHT: &str = "signer_last_prevote_height";
pub const LAST_PRECOMMIT_HEIGHT: &str = "signer_last_precommit_height";
pub const MISSED_PREVOTES: &str = "signer_missed_prevotes";
pub const MISSED_PRECOMMITS: &str = "signer_missed_precommits";
pub const SECONDS_SINCE_LAST_PRECOMMIT: &str = "signer_seconds_since_last_precommit";
pub const SECONDS_SINCE_LAST_SIGN_FINISH: &str = "signer_seconds_since_last_local_sign_finish_time";
pub const INSUFFICIENT_COSIGNER_ERRORS: &str = "signer_error_total_insufficient_cosigners";
pub const INVALID_SIGNATURE_ERRORS: &str = "signer_error_total_invalid_signatures";
pub const BEYOND_BLOCK_ERRORS: &str = "signer_total_beyond_block_errors";
pub const FAILED_SIGN_VOTES: &str = "signer_total_failed_sign_vote";
pub const SENTRY_CONNECT_TRIES: &str = "signer_total_sentry_connect_tries";
pub const RAFT_ELECTION_TIMEOUTS: &str = "signer_total_raft_leader_election_timeout";
pub const SECONDS_SINCE_LAST_EPHEMERAL_SHARE: &str =
    "signer_seconds_since_last_local_ephemeral_share_time";
/// Labelled by `peerid`, which carries the cosigner's p2p address.
pub const MISSED_EPHEMERAL_SHARES: &str = "signer_missed_ephemeral_shares";
pub const PROCESS_OPEN_FDS: &str = "process_open_fds";
pub const PROCESS_MAX_FDS: &str = "process_max_fds";
pub const PROCESS_RESIDENT_MEMORY: &str = "process_resident_memory_bytes";
pub const GO_GOROUTINES: &str = "go_goroutines";

pub const PEER_ID_LABEL: &str = "peerid";

pub const KNOWN_METRICS: &[&str] = &[
    LAST_PREVOTE_HEIGHT,
    LAST_PRECOMMIT_HEIGHT,
    MISSED_PREVOTES,
    MISSED_PRECOMMITS,
    SECONDS_SINCE_LAST_PRECOMMIT,
    SECONDS_SINCE_LAST_SIGN_FINISH,
    INSUFFICIENT_COSIGNER_ERRORS,
    INVALID_SIGNATURE_ERRORS,
    BEYOND_BLOCK_ERRORS,
    FAILED_SIGN_VOTES,
    SENTRY_CONNECT_TRIES,
    RAFT_ELECTION_TIMEOUTS,
    SECONDS_SINCE_LAST_EPHEMERAL_SHARE,
    MISSED_EPHEMERAL_SHARES,
    PROCESS_OPEN_FDS,
    PROCESS_MAX_FDS,
    PROCESS_RESIDENT_MEMORY,
    GO_GOROUTINES,
];

pub fn is_known(name: &str) -> bool {
    KNOWN_METRICS.contains(&name)
}

/// True for the signer's own series, as opposed to process and runtime ones.
pub fn is_signer_metric(name: &str) -> bool {
    name.starts_with("signer_") && is_known(name)
}
