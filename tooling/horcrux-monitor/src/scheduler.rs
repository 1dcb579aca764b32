use crate::models::{ScheduleState, SlotMark};
use chrono::{DateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{debug, info};

/// Fires a scheduled report when a cycle crosses one of the configured
/// local times of day. Each slot fires at most once per local date.
#[derive(Debug, Clone)]
pub struct ReportScheduler {
    slots: Vec<NaiveTime>,
    timezone: Tz,
    state: ScheduleState,
}

impl ReportScheduler {
    pub fn new(mut slots: Vec<NaiveTime>, timezone: Tz, state: ScheduleState) -> Self {
        slots.sort();
        slots.dedup();
        Self {
            slots,
            timezone,
            state,
        }
    }

    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    /// Returns the slot that fired in this cycle, if any. A slot fires when
    /// `previous cycle < slot instant <= now`; the previous cycle time is
    /// persisted, so downtime spanning a slot still yields one report.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<SlotMark> {
        let previous = self.state.last_cycle_at.replace(now)?;
        if now <= previous {
            return None;
        }

        let window_start = previous.max(now - TimeDelta::days(1));
        let (mark, instant) = self.latest_slot_between(window_start, now)?;
        if self.state.last_fired.is_some_and(|fired| fired >= mark) {
            debug!(?mark, "scheduled slot already reported");
            return None;
        }

        info!(date = %mark.date, time = %mark.time, slot_at = %instant, "scheduled report due");
        self.state.last_fired = Some(mark);
        Some(mark)
    }

    fn latest_slot_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<(SlotMark, DateTime<Utc>)> {
        let last_date = end.with_timezone(&self.timezone).date_naive();
        let mut date = start.with_timezone(&self.timezone).date_naive();
        let mut latest = None;

        while date <= last_date {
            for slot in &self.slots {
                // Slots that fall into a DST gap are skipped for that day.
                let Some(local) = self
                    .timezone
                    .from_local_datetime(&date.and_time(*slot))
                    .earliest()
                else {
                    continue;
                };
                let instant = local.with_timezone(&Utc);
                if start < instant && instant <= end {
                    latest = Some((SlotMark { date, time: *slot }, instant));
                }
            }
            date = date.succ_opt()?;
        }

        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    /// 2023-11-14 00:00:00 UTC.
    const DAY: u64 = 1_699_920_000;

    fn at(second: u64) -> DateTime<Utc> {
        DateTime::<Utc>::from(SystemTime::UNIX_EPOCH + Duration::from_secs(DAY + second))
    }

    fn hour(hour: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN)
    }

    fn fired_count(scheduler: &mut ReportScheduler, times: impl IntoIterator<Item = u64>) -> usize {
        times
            .into_iter()
            .filter_map(|second| scheduler.poll(at(second)))
            .count()
    }

    #[test]
    fn fires_once_when_crossing_a_slot_at_an_uneven_interval() {
        let mut scheduler = ReportScheduler::new(vec![hour(9)], Tz::UTC, ScheduleState::default());

        // 37s cycles never land exactly on 09:00:00.
        let fired = fired_count(&mut scheduler, (8 * 3600..10 * 3600).step_by(37));
        assert_eq!(fired, 1);
        assert_eq!(
            scheduler.state().last_fired.map(|mark| mark.time),
            Some(hour(9))
        );
    }

    #[test]
    fn first_cycle_only_records_its_time() {
        let mut scheduler = ReportScheduler::new(vec![hour(9)], Tz::UTC, ScheduleState::default());

        assert_eq!(scheduler.poll(at(9 * 3600 + 5)), None);
        assert_eq!(scheduler.state().last_cycle_at, Some(at(9 * 3600 + 5)));
    }

    #[test]
    fn restart_inside_the_slot_window_does_not_refire() {
        let mut scheduler = ReportScheduler::new(vec![hour(9)], Tz::UTC, ScheduleState::default());
        assert_eq!(fired_count(&mut scheduler, [8 * 3600 + 59 * 60, 9 * 3600 + 30]), 1);

        for restart in 0..3u64 {
            let persisted = scheduler.state().clone();
            scheduler = ReportScheduler::new(vec![hour(9)], Tz::UTC, persisted);
            let start = 9 * 3600 + 60 + restart * 120;
            assert_eq!(fired_count(&mut scheduler, [start, start + 30]), 0);
        }
    }

    #[test]
    fn downtime_across_a_slot_reports_once_after_restart() {
        let mut scheduler = ReportScheduler::new(vec![hour(9), hour(13)], Tz::UTC, ScheduleState::default());
        assert_eq!(scheduler.poll(at(8 * 3600)), None);

        let persisted = scheduler.state().clone();
        let mut restarted = ReportScheduler::new(vec![hour(9), hour(13)], Tz::UTC, persisted);
        let fired = restarted.poll(at(14 * 3600));
        assert_eq!(fired.map(|mark| mark.time), Some(hour(13)));
        assert_eq!(restarted.poll(at(14 * 3600 + 30)), None);
    }

    #[test]
    fn fires_every_day_in_the_configured_zone() {
        let mut scheduler = ReportScheduler::new(vec![hour(9)], chrono_tz::Asia::Dubai, ScheduleState::default());

        // 09:00 in Dubai is 05:00 UTC.
        let fired: Vec<SlotMark> = (0..3u64)
            .flat_map(|day| [day * 86_400 + 4 * 3600 + 59 * 60, day * 86_400 + 5 * 3600 + 15])
            .filter_map(|second| scheduler.poll(at(second)))
            .collect();

        assert_eq!(fired.len(), 3);
        assert!(fired.iter().all(|mark| mark.time == hour(9)));
        assert!(fired.windows(2).all(|pair| matches!(pair, [a, b] if a.date < b.date)));
    }
}
