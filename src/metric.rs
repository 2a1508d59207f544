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
//! OEE ratios and the additive totals they are computed from
//!
//! Every metric, whether for a single record or for a whole month of a machine, is computed
//! from an [`OeeTotals`](struct.OeeTotals.html) value: the underlying quantities are summed
//! first and divided once. Averaging per-record ratios instead would weigh a short, low-volume
//! record as much as a full shift.
use crate::{
    error::ValidationError,
    model::{Micros, ProductionRecord},
};
use abomonation_derive::Abomonation;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Tuning of the metric computation
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    /// upper bound for performance; speed-loss noise (e.g. an ideal cycle time that is
    /// slightly too pessimistic) can otherwise push it above 100%
    pub performance_ceiling: f64,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            performance_ceiling: 1.0,
        }
    }
}

impl MetricConfig {
    /// A ceiling outside `(0, 1]` is rejected
    pub fn with_ceiling(performance_ceiling: f64) -> Result<Self, ValidationError> {
        let config = Self {
            performance_ceiling,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let ceiling = self.performance_ceiling;
        if ceiling > 0.0 && ceiling <= 1.0 {
            Ok(())
        } else {
            Err(ValidationError::new(
                "performance_ceiling",
                format!("{} is not in (0, 1]", ceiling),
            ))
        }
    }

    // the field is public and deserialized, so a config that skipped `validate` is clamped
    fn ceiling(&self) -> f64 {
        if self.performance_ceiling.is_finite() {
            self.performance_ceiling.max(0.0).min(1.0)
        } else {
            1.0
        }
    }
}

/// The derived OEE figures, ratios in `[0, 1]`
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OeeMetric {
    pub operating_minutes: f64,
    pub availability: f64,
    pub performance: f64,
    pub quality: f64,
    pub oee: f64,
}

/// Summable quantities behind an [`OeeMetric`](struct.OeeMetric.html)
///
/// Merging two totals with `+=` is commutative and associative, so partitions of a dataset
/// can be folded independently and combined in any order.
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
)]
pub struct OeeTotals {
    pub planned_time: Micros,
    pub downtime: Micros,
    /// sum of `ideal_cycle_time × total_units`
    pub ideal_run_time: Micros,
    pub total_units: i64,
    pub good_units: i64,
}

impl Add for OeeTotals {
    type Output = OeeTotals;
    fn add(self, other: OeeTotals) -> OeeTotals {
        Self {
            planned_time: self.planned_time + other.planned_time,
            downtime: self.downtime + other.downtime,
            ideal_run_time: self.ideal_run_time + other.ideal_run_time,
            total_units: self.total_units.saturating_add(other.total_units),
            good_units: self.good_units.saturating_add(other.good_units),
        }
    }
}

impl AddAssign for OeeTotals {
    fn add_assign(&mut self, other: OeeTotals) {
        *self = *self + other;
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

fn unit(x: f64) -> f64 {
    x.max(0.0).min(1.0)
}

impl OeeTotals {
    pub fn of(record: &ProductionRecord) -> Self {
        Self {
            planned_time: record.planned_time,
            downtime: record.downtime,
            ideal_run_time: record.ideal_cycle_time.times(record.total_units),
            total_units: record.total_units,
            good_units: record.good_units,
        }
    }

    /// Totals of `multiplicity` copies of this value (negative for retractions)
    pub fn scaled(self, multiplicity: i64) -> Self {
        Self {
            planned_time: self.planned_time.times(multiplicity),
            downtime: self.downtime.times(multiplicity),
            ideal_run_time: self.ideal_run_time.times(multiplicity),
            total_units: self.total_units.saturating_mul(multiplicity),
            good_units: self.good_units.saturating_mul(multiplicity),
        }
    }

    pub fn operating_time(&self) -> Micros {
        self.planned_time - self.downtime
    }

    pub fn defective_units(&self) -> i64 {
        self.total_units - self.good_units
    }

    /// Performance before clamping, may exceed 1 on noisy data
    pub fn raw_performance(&self) -> f64 {
        ratio(
            self.ideal_run_time.0 as f64,
            self.operating_time().0 as f64,
        )
    }

    /// `1 − actual rate / ideal rate` in percent, never negative
    pub fn speed_loss_pct(&self) -> f64 {
        if self.operating_time() <= Micros::ZERO {
            return 0.0;
        }
        (100.0 * (1.0 - self.raw_performance())).max(0.0)
    }

    pub fn defect_rate_pct(&self) -> f64 {
        100.0 * ratio(self.defective_units() as f64, self.total_units as f64)
    }

    pub fn metric(&self, config: &MetricConfig) -> OeeMetric {
        let operating = self.operating_time();
        let availability = unit(ratio(operating.0 as f64, self.planned_time.0 as f64));
        let performance = self.raw_performance().max(0.0).min(config.ceiling());
        let quality = unit(ratio(self.good_units as f64, self.total_units as f64));
        OeeMetric {
            operating_minutes: operating.as_minutes(),
            availability,
            performance,
            quality,
            oee: availability * performance * quality,
        }
    }
}

/// OEE figures of a single record
pub fn compute_metric(
    record: &ProductionRecord,
    config: &MetricConfig,
) -> Result<OeeMetric, ValidationError> {
    record.validate()?;
    Ok(OeeTotals::of(record).metric(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{tests::record, Shift};

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn must_compute_reference_example() {
        let r = record("Filler", Shift::Morning, (2025, 7, 1), 480.0, 60.0, 0.1, 3600, 3528);
        let m = compute_metric(&r, &MetricConfig::default()).unwrap();
        assert!(close(m.operating_minutes, 420.0));
        assert!(close(m.availability, 0.875));
        assert!(close(m.performance, 360.0 / 420.0));
        assert!(close(m.quality, 0.98));
        assert!(close(m.oee, 0.875 * 360.0 / 420.0 * 0.98));
        assert!((m.oee - 0.735).abs() < 1e-3);
    }

    #[test]
    fn full_downtime_means_zero_availability() {
        for planned in &[1.0, 420.0, 480.0] {
            let r = record("Packer", Shift::Night, (2025, 8, 3), *planned, *planned, 0.05, 0, 0);
            let m = compute_metric(&r, &MetricConfig::default()).unwrap();
            assert_eq!(m.availability, 0.0);
            assert_eq!(m.performance, 0.0);
            assert_eq!(m.oee, 0.0);
        }
    }

    #[test]
    fn all_good_units_means_full_quality() {
        for units in &[1, 17, 9000] {
            let r = record("Packer", Shift::Afternoon, (2025, 8, 3), 480.0, 20.0, 0.01, *units, *units);
            let m = compute_metric(&r, &MetricConfig::default()).unwrap();
            assert_eq!(m.quality, 1.0);
        }
    }

    #[test]
    fn zero_denominators_yield_zero() {
        let r = record("Conveyor", Shift::Morning, (2025, 8, 3), 0.0, 0.0, 0.03, 0, 0);
        let m = compute_metric(&r, &MetricConfig::default()).unwrap();
        assert_eq!(m, OeeMetric::default());
        assert_eq!(OeeTotals::of(&r).speed_loss_pct(), 0.0);
        assert_eq!(OeeTotals::of(&r).defect_rate_pct(), 0.0);
    }

    #[test]
    fn must_cap_performance() {
        // 500 units at 1 min ideal in 420 min operating time
        let r = record("Mixer", Shift::Morning, (2025, 8, 3), 480.0, 60.0, 1.0, 500, 500);
        let m = compute_metric(&r, &MetricConfig::default()).unwrap();
        assert_eq!(m.performance, 1.0);
        assert!(OeeTotals::of(&r).raw_performance() > 1.0);
        assert_eq!(OeeTotals::of(&r).speed_loss_pct(), 0.0);

        let m = compute_metric(&r, &MetricConfig::with_ceiling(0.95).unwrap()).unwrap();
        assert_eq!(m.performance, 0.95);
        assert!(close(m.oee, 0.875 * 0.95));

        let err = MetricConfig::with_ceiling(7.0).unwrap_err();
        assert_eq!(err.field, "performance_ceiling");
        assert!(MetricConfig::with_ceiling(0.0).is_err());
        assert!(MetricConfig::with_ceiling(f64::NAN).is_err());
        assert!(MetricConfig::with_ceiling(1.0).is_ok());

        let unchecked = MetricConfig {
            performance_ceiling: 7.0,
        };
        let m = compute_metric(&r, &unchecked).unwrap();
        assert_eq!(m.performance, 1.0);
    }

    #[test]
    fn must_reject_invalid_record() {
        let r = record("Mixer", Shift::Morning, (2025, 8, 3), 480.0, 60.0, 0.1, 100, 101);
        let err = compute_metric(&r, &MetricConfig::default()).unwrap_err();
        assert_eq!(err.field, "good_units");
    }

    #[test]
    fn must_report_losses() {
        let r = record("Filler", Shift::Morning, (2025, 7, 1), 480.0, 60.0, 0.1, 3600, 3528);
        let totals = OeeTotals::of(&r);
        assert_eq!(totals.defective_units(), 72);
        assert!(close(totals.defect_rate_pct(), 2.0));
        assert!(close(totals.speed_loss_pct(), 100.0 * (1.0 - 360.0 / 420.0)));
    }

    #[test]
    fn must_scale_and_merge() {
        let r = record("Filler", Shift::Morning, (2025, 7, 1), 480.0, 60.0, 0.1, 3600, 3528);
        let one = OeeTotals::of(&r);
        let mut two = one;
        two += one;
        assert_eq!(two, one.scaled(2));
        assert_eq!(one + one.scaled(-1), OeeTotals::default());
    }
}
