/*
 * Copyright 2020 Actyx AG
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
//! Production records and the small value types they are made of
//!
//! All types in here are plain immutable values that can travel through a
//! [`Flow`](../flow/struct.Flow.html): they are totally ordered, hashable and abomonable.
//! Durations are therefore kept as integer microseconds instead of floating point minutes,
//! which also makes every sum formed during aggregation exact and independent of the order
//! in which records are folded.
use crate::error::{ParseShiftError, ValidationError};
use abomonation::Abomonation;
use abomonation_derive::Abomonation;
use chrono::{Datelike, NaiveDate};
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    fmt,
    ops::{Add, AddAssign, Sub},
    str::FromStr,
};

pub const MICROS_PER_SECOND: i64 = 1_000_000;
pub const MICROS_PER_MINUTE: i64 = 60 * MICROS_PER_SECOND;

/// A duration (or a sum of durations) in microseconds
///
/// Negative values are representable so that bad input can be rejected by
/// [`ProductionRecord::validate`](struct.ProductionRecord.html#method.validate)
/// instead of being lost in a conversion.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Ord,
    PartialOrd,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    Abomonation,
    From,
    Into,
)]
pub struct Micros(pub i64);

// sums over many records stay at the i64 bounds instead of wrapping around
impl Add for Micros {
    type Output = Micros;
    fn add(self, other: Micros) -> Micros {
        Micros(self.0.saturating_add(other.0))
    }
}

impl AddAssign for Micros {
    fn add_assign(&mut self, other: Micros) {
        *self = *self + other;
    }
}

impl Sub for Micros {
    type Output = Micros;
    fn sub(self, other: Micros) -> Micros {
        Micros(self.0.saturating_sub(other.0))
    }
}

impl Micros {
    pub const ZERO: Micros = Micros(0);

    /// Convert fractional minutes, rounding to the nearest microsecond
    pub fn from_minutes(minutes: f64) -> Self {
        Micros((minutes * MICROS_PER_MINUTE as f64).round() as i64)
    }

    /// Convert fractional seconds, rounding to the nearest microsecond
    pub fn from_seconds(seconds: f64) -> Self {
        Micros((seconds * MICROS_PER_SECOND as f64).round() as i64)
    }

    pub fn as_minutes(self) -> f64 {
        self.0 as f64 / MICROS_PER_MINUTE as f64
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Multiply by a unit count or multiplicity, saturating instead of wrapping
    pub fn times(self, factor: i64) -> Self {
        Micros(self.0.saturating_mul(factor))
    }
}

/// A calendar day
#[derive(Clone, Copy, Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Day(pub NaiveDate);

// NaiveDate is a plain packed integer without heap data, so the defaults are correct.
impl Abomonation for Day {}

impl Day {
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Day)
    }

    /// The calendar month this day belongs to
    pub fn month(self) -> YearMonth {
        YearMonth {
            year: self.0.year(),
            month: self.0.month(),
        }
    }
}

impl From<NaiveDate> for Day {
    fn from(date: NaiveDate) -> Self {
        Day(date)
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// Monthly bucket used for trend rollups
#[derive(
    Clone, Copy, Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize, Abomonation,
)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(
    Clone, Copy, Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize, Abomonation,
)]
pub enum Shift {
    Morning,
    Afternoon,
    Night,
}

impl Shift {
    pub const ALL: [Shift; 3] = [Shift::Morning, Shift::Afternoon, Shift::Night];

    pub fn as_str(self) -> &'static str {
        match self {
            Shift::Morning => "Morning",
            Shift::Afternoon => "Afternoon",
            Shift::Night => "Night",
        }
    }
}

impl fmt::Display for Shift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Shift {
    type Err = ParseShiftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Shift::ALL
            .iter()
            .copied()
            .find(|shift| shift.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseShiftError(s.to_owned()))
    }
}

/// Categorical cause of lost production time
///
/// The named variants are the categories used on the plant floor; anything else is kept
/// verbatim in `Other`.
#[derive(Clone, Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize, Abomonation)]
pub enum DowntimeReason {
    Breakdown,
    Changeover,
    Cleaning,
    MinorStoppage,
    PowerFailure,
    Other(String),
}

/// Pareto label for downtime that was booked without a reason
pub const UNSPECIFIED_REASON: &str = "Unspecified";

impl DowntimeReason {
    pub fn name(&self) -> &str {
        match self {
            DowntimeReason::Breakdown => "Breakdown",
            DowntimeReason::Changeover => "Changeover",
            DowntimeReason::Cleaning => "Cleaning",
            DowntimeReason::MinorStoppage => "Minor Stoppage",
            DowntimeReason::PowerFailure => "Power Failure",
            DowntimeReason::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for DowntimeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DowntimeReason {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        Ok(match normalized.as_str() {
            "breakdown" => DowntimeReason::Breakdown,
            "changeover" => DowntimeReason::Changeover,
            "cleaning" => DowntimeReason::Cleaning,
            "minorstoppage" => DowntimeReason::MinorStoppage,
            "powerfailure" => DowntimeReason::PowerFailure,
            _ => DowntimeReason::Other(s.trim().to_owned()),
        })
    }
}

/// One observation for a machine over a reporting interval (usually a shift)
#[derive(Clone, Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize, Abomonation)]
pub struct ProductionRecord {
    pub date: Day,
    pub machine: String,
    pub shift: Shift,
    pub planned_time: Micros,
    pub downtime: Micros,
    pub downtime_reason: Option<DowntimeReason>,
    /// ideal time per produced unit
    pub ideal_cycle_time: Micros,
    pub total_units: i64,
    pub good_units: i64,
}

impl ProductionRecord {
    pub fn operating_time(&self) -> Micros {
        self.planned_time - self.downtime
    }

    /// Label under which this record's downtime is counted in a Pareto analysis
    pub fn downtime_label(&self) -> String {
        self.downtime_reason
            .as_ref()
            .map(|r| r.name().to_owned())
            .unwrap_or_else(|| UNSPECIFIED_REASON.to_owned())
    }

    /// Check the record invariants, naming the first offending field
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.planned_time.is_negative() {
            return Err(ValidationError::new("planned_time", "must not be negative"));
        }
        if self.downtime.is_negative() {
            return Err(ValidationError::new("downtime", "must not be negative"));
        }
        if self.downtime > self.planned_time {
            return Err(ValidationError::new("downtime", "exceeds planned_time"));
        }
        if self.ideal_cycle_time <= Micros::ZERO {
            return Err(ValidationError::new(
                "ideal_cycle_time",
                "must be greater than zero",
            ));
        }
        if self.total_units < 0 {
            return Err(ValidationError::new("total_units", "must not be negative"));
        }
        if self.good_units < 0 {
            return Err(ValidationError::new("good_units", "must not be negative"));
        }
        if self.good_units > self.total_units {
            return Err(ValidationError::new("good_units", "exceeds total_units"));
        }
        if self.ideal_cycle_time.0.checked_mul(self.total_units).is_none() {
            return Err(ValidationError::new(
                "total_units",
                "ideal run time exceeds the representable range",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Record builder for tests, durations in minutes
    pub fn record(
        machine: &str,
        shift: Shift,
        date: (i32, u32, u32),
        planned: f64,
        downtime: f64,
        ideal_cycle: f64,
        total: i64,
        good: i64,
    ) -> ProductionRecord {
        ProductionRecord {
            date: Day::from_ymd(date.0, date.1, date.2).unwrap(),
            machine: machine.to_owned(),
            shift,
            planned_time: Micros::from_minutes(planned),
            downtime: Micros::from_minutes(downtime),
            downtime_reason: None,
            ideal_cycle_time: Micros::from_minutes(ideal_cycle),
            total_units: total,
            good_units: good,
        }
    }

    pub fn with_reason(mut record: ProductionRecord, reason: DowntimeReason) -> ProductionRecord {
        record.downtime_reason = Some(reason);
        record
    }

    #[test]
    fn must_convert_durations() {
        assert_eq!(Micros::from_minutes(0.1), Micros(6_000_000));
        assert_eq!(Micros::from_seconds(2.5), Micros(2_500_000));
        assert_eq!(Micros::from_minutes(480.0).as_minutes(), 480.0);
        assert_eq!(Micros(3).times(4), Micros(12));
        assert_eq!(Micros(i64::MAX).times(2), Micros(i64::MAX));
    }

    #[test]
    fn must_parse_shifts_and_reasons() {
        assert_eq!("night".parse::<Shift>(), Ok(Shift::Night));
        assert_eq!(" Morning ".parse::<Shift>(), Ok(Shift::Morning));
        assert!("Graveyard".parse::<Shift>().is_err());

        let reason: DowntimeReason = "Minor Stoppage".parse().unwrap();
        assert_eq!(reason, DowntimeReason::MinorStoppage);
        let reason: DowntimeReason = "power_failure".parse().unwrap();
        assert_eq!(reason, DowntimeReason::PowerFailure);
        let reason: DowntimeReason = "Jam".parse().unwrap();
        assert_eq!(reason, DowntimeReason::Other("Jam".to_owned()));
        assert_eq!(reason.name(), "Jam");
    }

    #[test]
    fn must_bucket_by_month() {
        let day = Day::from_ymd(2025, 7, 31).unwrap();
        assert_eq!(day.month(), YearMonth { year: 2025, month: 7 });
        assert_eq!(day.month().to_string(), "2025-07");
        assert_eq!(day.to_string(), "2025-07-31");
    }

    #[test]
    fn must_validate() {
        let ok = record("Mixer", Shift::Morning, (2025, 7, 1), 480.0, 60.0, 0.1, 3600, 3528);
        assert_eq!(ok.validate(), Ok(()));

        let mut r = ok.clone();
        r.good_units = 3601;
        assert_eq!(r.validate().unwrap_err().field, "good_units");

        let mut r = ok.clone();
        r.downtime = Micros::from_minutes(481.0);
        let err = r.validate().unwrap_err();
        assert_eq!(err.field, "downtime");
        assert_eq!(err.to_string(), "invalid downtime: exceeds planned_time");

        let mut r = ok.clone();
        r.downtime = Micros::from_minutes(-1.0);
        assert_eq!(r.validate().unwrap_err().field, "downtime");

        let mut r = ok.clone();
        r.planned_time = Micros::from_minutes(-1.0);
        assert_eq!(r.validate().unwrap_err().field, "planned_time");

        let mut r = ok.clone();
        r.ideal_cycle_time = Micros::ZERO;
        assert_eq!(r.validate().unwrap_err().field, "ideal_cycle_time");

        let mut r = ok.clone();
        r.total_units = -1;
        assert_eq!(r.validate().unwrap_err().field, "total_units");

        let mut r = ok;
        r.total_units = i64::MAX / 2;
        r.good_units = 0;
        assert_eq!(r.validate().unwrap_err().field, "total_units");
    }

    #[test]
    fn durations_must_saturate() {
        assert_eq!(Micros(i64::MAX - 1) + Micros(5), Micros(i64::MAX));
        assert_eq!(Micros(i64::MIN + 1) - Micros(5), Micros(i64::MIN));
        let mut sum = Micros(i64::MAX / 2 + 1);
        sum += Micros(i64::MAX / 2 + 1);
        assert_eq!(sum, Micros(i64::MAX));
        assert_eq!(Micros(7) - Micros(2), Micros(5));
    }

    #[test]
    fn must_label_missing_reason() {
        let r = record("Mixer", Shift::Night, (2025, 7, 1), 420.0, 10.0, 0.1, 100, 100);
        assert_eq!(r.downtime_label(), UNSPECIFIED_REASON);
        let r = with_reason(r, DowntimeReason::Cleaning);
        assert_eq!(r.downtime_label(), "Cleaning");
    }
}
