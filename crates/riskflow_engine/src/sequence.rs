//! Valuation date sequences and the per-cycle contexts derived from them.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// The dates an evaluation cycles through, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionSequence {
    /// Every calendar day between `start` and `end`.
    Historical {
        start: NaiveDate,
        end: NaiveDate,
        include_start: bool,
        include_end: bool,
    },
    /// An explicit list of dates.
    Fixed { dates: Vec<NaiveDate> },
}

/// One cycle of an evaluation: the date, the instant it is valued at, and
/// the correction cutoff applied to inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationContext {
    pub valuation_date: NaiveDate,
    pub valuation_instant: DateTime<Utc>,
    pub correction: Option<DateTime<Utc>>,
}

impl ExecutionSequence {
    pub fn historical(start: NaiveDate, end: NaiveDate, include_start: bool, include_end: bool) -> Self {
        Self::Historical {
            start,
            end,
            include_start,
            include_end,
        }
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        match self {
            Self::Historical {
                start,
                end,
                include_start,
                include_end,
            } => {
                let mut dates = Vec::new();
                let mut day = *start;
                while day <= *end {
                    let excluded = (day == *start && !include_start) || (day == *end && !include_end);
                    if !excluded {
                        dates.push(day);
                    }
                    match day.succ_opt() {
                        Some(next) => day = next,
                        None => break,
                    }
                }
                dates
            }
            Self::Fixed { dates } => dates.clone(),
        }
    }

    /// Contexts valued at `valuation_time` local to `time_zone`.
    pub fn contexts(
        &self,
        time_zone: Tz,
        valuation_time: NaiveTime,
        correction: Option<DateTime<Utc>>,
    ) -> Vec<ValuationContext> {
        self.dates()
            .into_iter()
            .map(|valuation_date| ValuationContext {
                valuation_date,
                valuation_instant: local_instant(time_zone, valuation_date, valuation_time),
                correction,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.dates().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolve a local wall-clock time; the earlier instant wins on overlaps and
/// times inside a DST gap move forward by an hour.
fn local_instant(time_zone: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let local = date.and_time(time);
    time_zone
        .from_local_datetime(&local)
        .earliest()
        .or_else(|| time_zone.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&local))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_historical_inclusivity() {
        let seq = ExecutionSequence::historical(d(2024, 1, 1), d(2024, 1, 5), true, true);
        assert_eq!(seq.len(), 5);

        let seq = ExecutionSequence::historical(d(2024, 1, 1), d(2024, 1, 5), false, false);
        assert_eq!(seq.dates(), vec![d(2024, 1, 2), d(2024, 1, 3), d(2024, 1, 4)]);

        let single = ExecutionSequence::historical(d(2024, 1, 1), d(2024, 1, 1), true, false);
        assert!(single.is_empty());
    }

    #[test]
    fn test_contexts_use_local_valuation_time() {
        let seq = ExecutionSequence::Fixed {
            dates: vec![d(2024, 7, 1)],
        };
        let time = NaiveTime::from_hms_opt(17, 0, 0).unwrap();
        let contexts = seq.contexts(chrono_tz::Europe::London, time, None);
        assert_eq!(contexts.len(), 1);
        // BST is UTC+1 in July.
        assert_eq!(
            contexts[0].valuation_instant,
            Utc.with_ymd_and_hms(2024, 7, 1, 16, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_time_in_dst_gap_moves_forward() {
        let seq = ExecutionSequence::Fixed {
            dates: vec![d(2024, 3, 31)],
        };
        let time = NaiveTime::from_hms_opt(1, 30, 0).unwrap();
        let contexts = seq.contexts(chrono_tz::Europe::London, time, None);
        assert_eq!(
            contexts[0].valuation_instant,
            Utc.with_ymd_and_hms(2024, 3, 31, 1, 30, 0).unwrap()
        );
    }
}
