use crate::{
    models::{AlertState, CheckId, ScheduleState, SlotMark},
    tracker::AlertStore,
};
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid stored timestamp: {0}")]
    Time(#[from] chrono::ParseError),
}

/// State that survives a restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub alerts: AlertStore,
    pub schedule: ScheduleState,
}

#[derive(Debug)]
pub struct StateRepository {
    connection: Connection,
}

struct AlertRow {
    check_id: String,
    consecutive_bad_count: u32,
    is_alerting: bool,
    last_alert_sent_at: Option<String>,
    alerting_since: Option<String>,
    last_value: Option<f64>,
    unchanged_cycles: u32,
    is_unavailable: bool,
}

impl StateRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let connection = Connection::open(path)?;
        let repository = Self { connection };
        repository.ensure_schema()?;
        Ok(repository)
    }

    fn ensure_schema(&self) -> Result<(), StorageError> {
        self.connection.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS alert_states (
                check_id TEXT PRIMARY KEY,
                consecutive_bad_count INTEGER NOT NULL,
                is_alerting INTEGER NOT NULL,
                last_alert_sent_at TEXT,
                alerting_since TEXT,
                last_value REAL,
                unchanged_cycles INTEGER NOT NULL,
                is_unavailable INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS schedule_state (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                last_fired_date TEXT,
                last_fired_slot TEXT,
                last_cycle_at TEXT
            );
            ",
        )?;

        Ok(())
    }

    pub fn load(&self) -> Result<PersistedState, StorageError> {
        let mut statement = self.connection.prepare(
            "
            SELECT check_id, consecutive_bad_count, is_alerting, last_alert_sent_at,
                   alerting_since, last_value, unchanged_cycles, is_unavailable
            FROM alert_states
            ",
        )?;

        let rows = statement.query_map([], |row| {
            Ok(AlertRow {
                check_id: row.get(0)?,
                consecutive_bad_count: row.get(1)?,
                is_alerting: row.get(2)?,
                last_alert_sent_at: row.get(3)?,
                alerting_since: row.get(4)?,
                last_value: row.get(5)?,
                unchanged_cycles: row.get(6)?,
                is_unavailable: row.get(7)?,
            })
        })?;

        let mut alerts = AlertStore::default();
        for row in rows {
            let row = row?;
            let state = AlertState {
                consecutive_bad_count: row.consecutive_bad_count,
                is_currently_alerting: row.is_alerting,
                last_alert_sent_at: parse_time(row.last_alert_sent_at)?,
                alerting_since: parse_time(row.alerting_since)?,
                last_value: row.last_value,
                unchanged_cycles: row.unchanged_cycles,
                is_unavailable: row.is_unavailable,
            };
            alerts.insert(CheckId::new(row.check_id), state);
        }

        let schedule_row: Option<(Option<String>, Option<String>, Option<String>)> = self
            .connection
            .query_row(
                "SELECT last_fired_date, last_fired_slot, last_cycle_at FROM schedule_state WHERE id = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let schedule = match schedule_row {
            Some((date, slot, last_cycle_at)) => ScheduleState {
                last_fired: match (date, slot) {
                    (Some(date), Some(slot)) => Some(SlotMark {
                        date: date.parse::<NaiveDate>()?,
                        time: slot.parse::<NaiveTime>()?,
                    }),
                    _ => None,
                },
                last_cycle_at: parse_time(last_cycle_at)?,
            },
            None => ScheduleState::default(),
        };

        Ok(PersistedState { alerts, schedule })
    }

    /// Replaces the stored state in one transaction.
    pub fn save(&mut self, alerts: &AlertStore, schedule: &ScheduleState) -> Result<(), StorageError> {
        let transaction = self.connection.transaction()?;
        transaction.execute("DELETE FROM alert_states", [])?;
        {
            let mut insert = transaction.prepare(
                "
                INSERT INTO alert_states (
                    check_id, consecutive_bad_count, is_alerting, last_alert_sent_at,
                    alerting_since, last_value, unchanged_cycles, is_unavailable
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
            )?;
            for (id, state) in alerts.iter() {
                insert.execute(params![
                    id.as_str(),
                    state.consecutive_bad_count,
                    state.is_currently_alerting,
                    state.last_alert_sent_at.map(format_time),
                    state.alerting_since.map(format_time),
                    state.last_value,
                    state.unchanged_cycles,
                    state.is_unavailable,
                ])?;
            }
        }

        transaction.execute(
            "
            INSERT OR REPLACE INTO schedule_state (id, last_fired_date, last_fired_slot, last_cycle_at)
            VALUES (0, ?1, ?2, ?3)
            ",
            params![
                schedule.last_fired.map(|mark| mark.date.to_string()),
                schedule.last_fired.map(|mark| mark.time.to_string()),
                schedule.last_cycle_at.map(format_time),
            ],
        )?;

        transaction.commit()?;
        Ok(())
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
    raw.map(|raw| DateTime::parse_from_rfc3339(&raw).map(|time| time.with_timezone(&Utc)))
        .transpose()
        .map_err(StorageError::from)
}

/// Storage as seen by the daemon loop. Failures never stop monitoring: a
/// broken load starts from empty state and a failed open is retried on the
/// next save.
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    repository: Option<StateRepository>,
}

impl StateStore {
    /// No persistence at all (dry-run).
    pub fn disabled() -> Self {
        Self {
            path: None,
            repository: None,
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let repository = match StateRepository::open(&path) {
            Ok(repository) => Some(repository),
            Err(error) => {
                error!(path = %path.display(), %error, "failed to open state database");
                None
            }
        };

        Self {
            path: Some(path),
            repository,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn load(&self) -> PersistedState {
        let Some(repository) = &self.repository else {
            return PersistedState::default();
        };

        match repository.load() {
            Ok(state) => {
                info!(
                    checks = state.alerts.len(),
                    alerting = state.alerts.alerting().count(),
                    "restored persisted alert state"
                );
                state
            }
            Err(error) => {
                error!(%error, "failed to load persisted state, starting empty");
                PersistedState::default()
            }
        }
    }

    pub fn save(&mut self, alerts: &AlertStore, schedule: &ScheduleState) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let repository = match self.repository.take() {
            Some(repository) => repository,
            None => StateRepository::open(path)?,
        };
        self.repository.insert(repository).save(alerts, schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::NamedTempFile;

    fn sample_state() -> PersistedState {
        let sent_at = DateTime::<Utc>::from(SystemTime::UNIX_EPOCH + Duration::new(1_700_000_123, 456_789_012));
        let alerts = [
            (
                CheckId::new("cosigner_2"),
                AlertState {
                    consecutive_bad_count: 2,
                    ..AlertState::default()
                },
            ),
            (
                CheckId::new("height_stale"),
                AlertState {
                    consecutive_bad_count: 4,
                    is_currently_alerting: true,
                    last_alert_sent_at: Some(sent_at),
                    alerting_since: Some(sent_at),
                    last_value: Some(18_234_567.000_000_1),
                    unchanged_cycles: 4,
                    is_unavailable: false,
                },
            ),
        ]
        .into_iter()
        .collect();

        PersistedState {
            alerts,
            schedule: ScheduleState {
                last_fired: NaiveDate::from_ymd_opt(2023, 11, 14)
                    .zip(NaiveTime::from_hms_opt(13, 0, 0))
                    .map(|(date, time)| SlotMark { date, time }),
                last_cycle_at: Some(sent_at),
            },
        }
    }

    #[test]
    fn round_trips_state_exactly() {
        let file_result = NamedTempFile::new();
        assert!(file_result.is_ok());
        let file = match file_result {
            Ok(file) => file,
            Err(_) => return,
        };

        let repository_result = StateRepository::open(file.path());
        assert!(repository_result.is_ok());
        let mut repository = match repository_result {
            Ok(repository) => repository,
            Err(_) => return,
        };

        let state = sample_state();
        assert!(repository.save(&state.alerts, &state.schedule).is_ok());

        let reopened = match StateRepository::open(file.path()) {
            Ok(repository) => repository,
            Err(_) => return,
        };
        let loaded = reopened.load();
        assert!(loaded.is_ok());
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(_) => return,
        };

        assert_eq!(loaded, state);
        let value = loaded
            .alerts
            .get(&CheckId::new("height_stale"))
            .and_then(|alert| alert.last_value);
        assert_eq!(value.map(f64::to_bits), Some(18_234_567.000_000_1_f64.to_bits()));
    }

    #[test]
    fn empty_database_loads_default_state() {
        let file = match NamedTempFile::new() {
            Ok(file) => file,
            Err(_) => return,
        };

        let repository = StateRepository::open(file.path());
        assert!(repository.is_ok());
        let loaded = repository.and_then(|repository| repository.load());
        assert!(matches!(loaded, Ok(state) if state == PersistedState::default()));
    }

    #[test]
    fn save_replaces_previous_rows() {
        let file = match NamedTempFile::new() {
            Ok(file) => file,
            Err(_) => return,
        };
        let mut store = StateStore::open(file.path());

        let state = sample_state();
        assert!(store.save(&state.alerts, &state.schedule).is_ok());
        assert!(store.save(&AlertStore::default(), &ScheduleState::default()).is_ok());

        assert_eq!(store.load(), PersistedState::default());
    }

    #[test]
    fn unopenable_path_falls_open() {
        let directory = match tempfile::tempdir() {
            Ok(directory) => directory,
            Err(_) => return,
        };
        let path = directory.path().join("missing").join("state.sqlite");

        let mut store = StateStore::open(&path);
        assert!(store.is_enabled());
        assert_eq!(store.load(), PersistedState::default());
        assert!(store.save(&AlertStore::default(), &ScheduleState::default()).is_err());

        assert!(std::fs::create_dir_all(path.parent().unwrap_or(directory.path())).is_ok());
        assert!(store.save(&AlertStore::default(), &ScheduleState::default()).is_ok());
    }

    #[test]
    fn disabled_store_is_a_no_op() {
        let mut store = StateStore::disabled();
        assert!(!store.is_enabled());
        assert!(store.save(&AlertStore::default(), &ScheduleState::default()).is_ok());
        assert_eq!(store.load(), PersistedState::default());
    }
}
