use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub name: String,
    pub check_interval: Duration,
    pub metrics_timeout: Duration,
    pub alert_cooldown: Duration,
    pub shutdown_grace: Duration,
    pub timezone: Tz,
    pub state_file: PathBuf,
    pub schedule_slots: Vec<NaiveTime>,
    pub thresholds: Thresholds,
    pub slack: Option<SlackConfig>,
    pub telegram: Option<TelegramConfig>,
    pub cluster: ClusterTopology,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("unknown time zone: {0}")]
    UnknownTimezone(String),
    #[error("invalid scheduled report slot: {0}")]
    InvalidSlot(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid telegram chat id: {0}")]
    InvalidChatId(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub missed_precommits: f64,
    pub missed_prevotes: f64,
    pub seconds_since_last_sign: f64,
    pub height_stale_checks: u32,
    pub cosigner_debounce: u32,
    pub sentry_height_divergence: f64,
    pub fd_usage_percent: f64,
    pub tcp_timeout: u64,
    pub rpc_port: u16,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            missed_precommits: 3.0,
            missed_prevotes: 5.0,
            seconds_since_last_sign: 30.0,
            height_stale_checks: 3,
            cosigner_debounce: 3,
            sentry_height_divergence: 10.0,
            fd_usage_percent: 90.0,
            tcp_timeout: 3,
            rpc_port: 26657,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub webhook_url: String,
    pub mention: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
    pub retry_max: u8,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosignerNode {
    pub shard_id: u32,
    pub address: String,
    pub is_self: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentryNode {
    /// 1-based position in the Horcrux `chainNodes` list.
    pub index: usize,
    pub address: String,
}

/// Cluster layout read from the Horcrux cosigner config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    pub metrics_url: Option<String>,
    pub threshold: u32,
    pub shards_total: u32,
    pub cosigners: Vec<CosignerNode>,
    pub sentries: Vec<SentryNode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawConfig {
    name: String,
    check_interval: u64,
    metrics_timeout: u64,
    alert_cooldown: u64,
    shutdown_grace: u64,
    timezone: String,
    state_file: PathBuf,
    metrics_url: Option<String>,
    scheduled_reports: RawSchedule,
    thresholds: Thresholds,
    slack: SlackConfig,
    telegram: RawTelegram,
    horcrux_config: Option<PathBuf>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            name: "horcrux".to_owned(),
            check_interval: 30,
            metrics_timeout: 5,
            alert_cooldown: 300,
            shutdown_grace: 10,
            timezone: "Asia/Dubai".to_owned(),
            state_file: PathBuf::from("horcrux-monitor.sqlite"),
            metrics_url: None,
            scheduled_reports: RawSchedule::default(),
            thresholds: Thresholds::default(),
            slack: SlackConfig::default(),
            telegram: RawTelegram::default(),
            horcrux_config: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawSchedule {
    hours: Vec<u32>,
    times: Vec<String>,
}

impl Default for RawSchedule {
    fn default() -> Self {
        Self {
            hours: vec![9, 13, 17],
            times: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawTelegram {
    enabled: bool,
    bot_token: String,
    chat_id: Option<RawChatId>,
    retry_max: u8,
    retry_delay_ms: u64,
}

impl Default for RawTelegram {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: None,
            retry_max: 3,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawChatId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HorcruxFile {
    #[serde(rename = "debugAddr")]
    debug_addr: String,
    #[serde(rename = "shardID")]
    shard_id: u32,
    shards: u32,
    threshold: u32,
    cosigners: Vec<HorcruxCosigner>,
    #[serde(rename = "thresholdMode")]
    threshold_mode: Option<HorcruxThresholdMode>,
    #[serde(rename = "chainNodes")]
    chain_nodes: Vec<HorcruxChainNode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HorcruxThresholdMode {
    threshold: u32,
    cosigners: Vec<HorcruxCosigner>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HorcruxCosigner {
    #[serde(rename = "shardID")]
    shard_id: u32,
    #[serde(rename = "p2pAddr")]
    p2p_addr: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HorcruxChainNode {
    #[serde(rename = "privValAddr")]
    priv_val_addr: String,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_yaml(&raw, path, |name| env::var(name).ok())
    }

    /// Builds the config from YAML text. `env_lookup` resolves the
    /// `SLACK_WEBHOOK_URL`, `TELEGRAM_BOT_TOKEN` and `TELEGRAM_CHAT_ID` overrides.
    pub fn from_yaml(
        raw: &str,
        origin: &Path,
        env_lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut parsed: RawConfig = if raw.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(raw).map_err(|source| ConfigError::Yaml {
                path: origin.to_owned(),
                source,
            })?
        };
        apply_env_overrides(&mut parsed, env_lookup);

        let mut cluster = match &parsed.horcrux_config {
            Some(path) => load_cluster(path)?,
            None => ClusterTopology::default(),
        };
        if let Some(metrics_url) = parsed.metrics_url.take().filter(|url| !url.is_empty()) {
            cluster.metrics_url = Some(metrics_url);
        }

        Self::validate(parsed, cluster)
    }

    fn validate(parsed: RawConfig, cluster: ClusterTopology) -> Result<Self, ConfigError> {
        if parsed.check_interval == 0 {
            return Err(ConfigError::Zero("check_interval"));
        }
        if parsed.metrics_timeout == 0 {
            return Err(ConfigError::Zero("metrics_timeout"));
        }
        if parsed.thresholds.height_stale_checks == 0 {
            return Err(ConfigError::Zero("thresholds.height_stale_checks"));
        }
        if parsed.thresholds.cosigner_debounce == 0 {
            return Err(ConfigError::Zero("thresholds.cosigner_debounce"));
        }
        if parsed.thresholds.tcp_timeout == 0 {
            return Err(ConfigError::Zero("thresholds.tcp_timeout"));
        }

        let timezone = parsed
            .timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(parsed.timezone.clone()))?;
        let schedule_slots = parse_slots(&parsed.scheduled_reports)?;
        let telegram = telegram_config(parsed.telegram)?;
        let slack = Some(parsed.slack).filter(|slack| !slack.webhook_url.is_empty());

        Ok(Self {
            name: parsed.name,
            check_interval: Duration::from_secs(parsed.check_interval),
            metrics_timeout: Duration::from_secs(parsed.metrics_timeout),
            alert_cooldown: Duration::from_secs(parsed.alert_cooldown),
            shutdown_grace: Duration::from_secs(parsed.shutdown_grace),
            timezone,
            state_file: parsed.state_file,
            schedule_slots,
            thresholds: parsed.thresholds,
            slack,
            telegram,
            cluster,
        })
    }
}

fn apply_env_overrides(parsed: &mut RawConfig, env_lookup: impl Fn(&str) -> Option<String>) {
    if let Some(webhook_url) = env_lookup("SLACK_WEBHOOK_URL") {
        parsed.slack.webhook_url = webhook_url;
    }
    if let Some(bot_token) = env_lookup("TELEGRAM_BOT_TOKEN") {
        parsed.telegram.bot_token = bot_token;
    }
    if let Some(chat_id) = env_lookup("TELEGRAM_CHAT_ID") {
        parsed.telegram.chat_id = Some(RawChatId::Text(chat_id));
    }
}

fn parse_slots(schedule: &RawSchedule) -> Result<Vec<NaiveTime>, ConfigError> {
    let mut slots = Vec::with_capacity(schedule.hours.len() + schedule.times.len());

    for hour in &schedule.hours {
        let slot = NaiveTime::from_hms_opt(*hour, 0, 0)
            .ok_or_else(|| ConfigError::InvalidSlot(format!("hour {hour}")))?;
        slots.push(slot);
    }
    for time in &schedule.times {
        let slot = NaiveTime::parse_from_str(time.trim(), "%H:%M")
            .map_err(|_| ConfigError::InvalidSlot(time.clone()))?;
        slots.push(slot);
    }

    slots.sort();
    slots.dedup();
    Ok(slots)
}

fn telegram_config(raw: RawTelegram) -> Result<Option<TelegramConfig>, ConfigError> {
    if !raw.enabled || raw.bot_token.is_empty() {
        return Ok(None);
    }

    let chat_id = match raw.chat_id {
        Some(RawChatId::Number(chat_id)) => chat_id,
        Some(RawChatId::Text(text)) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidChatId(text.clone()))?,
        None => return Err(ConfigError::InvalidChatId("missing".to_owned())),
    };

    Ok(Some(TelegramConfig {
        bot_token: raw.bot_token,
        chat_id,
        retry_max: raw.retry_max,
        retry_delay: Duration::from_millis(raw.retry_delay_ms),
    }))
}

fn load_cluster(path: &Path) -> Result<ClusterTopology, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    parse_cluster(&raw, path)
}

fn parse_cluster(raw: &str, origin: &Path) -> Result<ClusterTopology, ConfigError> {
    let file: HorcruxFile = serde_yaml::from_str(raw).map_err(|source| ConfigError::Yaml {
        path: origin.to_owned(),
        source,
    })?;

    let (threshold, listed) = match file.threshold_mode {
        Some(mode) if !mode.cosigners.is_empty() => (mode.threshold, mode.cosigners),
        _ => (file.threshold, file.cosigners),
    };

    let mut cosigners: Vec<CosignerNode> = listed
        .into_iter()
        .map(|cosigner| CosignerNode {
            is_self: cosigner.shard_id == file.shard_id,
            shard_id: cosigner.shard_id,
            address: cosigner.p2p_addr,
        })
        .collect();

    if file.shard_id != 0 && !cosigners.iter().any(|cosigner| cosigner.shard_id == file.shard_id) {
        cosigners.push(CosignerNode {
            shard_id: file.shard_id,
            address: String::new(),
            is_self: true,
        });
    }
    cosigners.sort_by_key(|cosigner| cosigner.shard_id);

    let sentries = file
        .chain_nodes
        .into_iter()
        .map(|node| node.priv_val_addr)
        .filter(|address| !address.is_empty())
        .enumerate()
        .map(|(position, address)| SentryNode {
            index: position + 1,
            address,
        })
        .collect();

    let shards_total = if file.shards > 0 {
        file.shards
    } else {
        u32::try_from(cosigners.len()).unwrap_or(u32::MAX)
    };

    Ok(ClusterTopology {
        metrics_url: metrics_url(&file.debug_addr),
        threshold,
        shards_total,
        cosigners,
        sentries,
    })
}

fn metrics_url(debug_addr: &str) -> Option<String> {
    if debug_addr.is_empty() {
        return None;
    }
    let base = if debug_addr.starts_with("http") {
        debug_addr.to_owned()
    } else {
        format!("http://{debug_addr}")
    };
    Some(format!("{}/metrics", base.trim_end_matches('/')))
}
