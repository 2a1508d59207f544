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
//! Grouped OEE rollups over in-memory record sets
//!
//! ```rust
//! use oee_data_flow::aggregate::{aggregate, GroupBy};
//! use oee_data_flow::metric::MetricConfig;
//! # use oee_data_flow::model::ProductionRecord;
//! # fn records() -> Vec<ProductionRecord> { vec![] }
//!
//! let by_machine_and_month = GroupBy::MACHINE.and(GroupBy::MONTH);
//! let rollups = aggregate(&records(), by_machine_and_month, &MetricConfig::default())?;
//! for (key, rollup) in &rollups {
//!     println!("{}: OEE {:.1}%", key, rollup.metric.oee * 100.0);
//! }
//! # Ok::<(), oee_data_flow::error::ValidationError>(())
//! ```
use crate::{
    error::{GroupByError, ValidationError},
    metric::{MetricConfig, OeeMetric, OeeTotals},
    model::{ProductionRecord, Shift, YearMonth},
};
use abomonation_derive::Abomonation;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// A single grouping dimension
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dimension {
    Machine,
    Shift,
    Month,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Machine => "machine",
            Dimension::Shift => "shift",
            Dimension::Month => "month",
        }
    }
}

impl FromStr for Dimension {
    type Err = GroupByError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "machine" => Ok(Dimension::Machine),
            "shift" => Ok(Dimension::Shift),
            "month" => Ok(Dimension::Month),
            other => Err(GroupByError::UnknownDimension(other.to_owned())),
        }
    }
}

/// A non-empty set of grouping dimensions
///
/// Only the constants and their combinations with [`and`](#method.and) can be constructed
/// directly, so an empty grouping cannot occur.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupBy {
    machine: bool,
    shift: bool,
    month: bool,
}

impl GroupBy {
    pub const MACHINE: GroupBy = GroupBy {
        machine: true,
        shift: false,
        month: false,
    };
    pub const SHIFT: GroupBy = GroupBy {
        machine: false,
        shift: true,
        month: false,
    };
    pub const MONTH: GroupBy = GroupBy {
        machine: false,
        shift: false,
        month: true,
    };

    pub fn and(self, other: GroupBy) -> GroupBy {
        GroupBy {
            machine: self.machine || other.machine,
            shift: self.shift || other.shift,
            month: self.month || other.month,
        }
    }

    pub fn from_dimensions(
        dims: impl IntoIterator<Item = Dimension>,
    ) -> Result<GroupBy, GroupByError> {
        dims.into_iter()
            .map(|dim| match dim {
                Dimension::Machine => GroupBy::MACHINE,
                Dimension::Shift => GroupBy::SHIFT,
                Dimension::Month => GroupBy::MONTH,
            })
            .fold(None, |acc: Option<GroupBy>, g| {
                Some(acc.map_or(g, |acc| acc.and(g)))
            })
            .ok_or(GroupByError::Empty)
    }

    pub fn dimensions(&self) -> Vec<Dimension> {
        let mut dims = Vec::with_capacity(3);
        if self.machine {
            dims.push(Dimension::Machine);
        }
        if self.shift {
            dims.push(Dimension::Shift);
        }
        if self.month {
            dims.push(Dimension::Month);
        }
        dims
    }

    /// Project a record onto this grouping
    pub fn key(&self, record: &ProductionRecord) -> AggregationKey {
        AggregationKey {
            machine: if self.machine {
                Some(record.machine.clone())
            } else {
                None
            },
            shift: if self.shift { Some(record.shift) } else { None },
            month: if self.month {
                Some(record.date.month())
            } else {
                None
            },
        }
    }
}

impl FromStr for GroupBy {
    type Err = GroupByError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dims = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Dimension>, _>>()?;
        GroupBy::from_dimensions(dims)
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .dimensions()
            .into_iter()
            .map(Dimension::as_str)
            .collect::<Vec<_>>();
        f.write_str(&dims.join(","))
    }
}

/// Projection of a record onto the chosen grouping dimensions
///
/// Dimensions that are not part of the grouping are `None`.
#[derive(
    Clone,
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
pub struct AggregationKey {
    pub machine: Option<String>,
    pub shift: Option<Shift>,
    pub month: Option<YearMonth>,
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(machine) = &self.machine {
            parts.push(machine.clone());
        }
        if let Some(shift) = self.shift {
            parts.push(shift.to_string());
        }
        if let Some(month) = self.month {
            parts.push(month.to_string());
        }
        if parts.is_empty() {
            f.write_str("all")
        } else {
            f.write_str(&parts.join("/"))
        }
    }
}

/// Aggregated OEE for one key
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Rollup {
    pub metric: OeeMetric,
    pub totals: OeeTotals,
    /// number of records folded into this rollup
    pub records: usize,
    pub speed_loss_pct: f64,
    pub defect_rate_pct: f64,
}

impl Rollup {
    pub fn new(totals: OeeTotals, records: usize, config: &MetricConfig) -> Self {
        Self {
            metric: totals.metric(config),
            totals,
            records,
            speed_loss_pct: totals.speed_loss_pct(),
            defect_rate_pct: totals.defect_rate_pct(),
        }
    }
}

/// Per-key accumulator state for a partition of the input
///
/// Folding validates each record. Accumulators of separate shards can be
/// [`merge`](#method.merge)d in any order before calling [`finish`](#method.finish).
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregator {
    group_by: GroupBy,
    groups: BTreeMap<AggregationKey, (OeeTotals, usize)>,
}

impl Aggregator {
    pub fn new(group_by: GroupBy) -> Self {
        Self {
            group_by,
            groups: BTreeMap::new(),
        }
    }

    pub fn group_by(&self) -> GroupBy {
        self.group_by
    }

    pub fn fold(&mut self, record: &ProductionRecord) -> Result<(), ValidationError> {
        record.validate()?;
        let entry = self
            .groups
            .entry(self.group_by.key(record))
            .or_insert((OeeTotals::default(), 0));
        entry.0 += OeeTotals::of(record);
        entry.1 += 1;
        Ok(())
    }

    /// Combine with the accumulator of another shard using the same grouping
    pub fn merge(&mut self, other: Aggregator) {
        debug_assert_eq!(self.group_by, other.group_by);
        for (key, (totals, records)) in other.groups {
            let entry = self
                .groups
                .entry(key)
                .or_insert((OeeTotals::default(), 0));
            entry.0 += totals;
            entry.1 += records;
        }
    }

    pub fn finish(self, config: &MetricConfig) -> BTreeMap<AggregationKey, Rollup> {
        self.groups
            .into_iter()
            .map(|(key, (totals, records))| (key, Rollup::new(totals, records, config)))
            .collect()
    }
}

/// OEE per distinct key of the given grouping
///
/// Quantities are summed per key and divided once; the result does not depend on the order
/// of the records. The first record failing validation aborts the computation.
pub fn aggregate<'a>(
    records: impl IntoIterator<Item = &'a ProductionRecord>,
    group_by: GroupBy,
    config: &MetricConfig,
) -> Result<BTreeMap<AggregationKey, Rollup>, ValidationError> {
    let mut aggregator = Aggregator::new(group_by);
    for record in records {
        aggregator.fold(record)?;
    }
    Ok(aggregator.finish(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{tests::record, Micros};

    fn sample() -> Vec<ProductionRecord> {
        vec![
            record("Mixer", Shift::Morning, (2025, 7, 1), 480.0, 45.0, 0.75, 480, 475),
            record("Mixer", Shift::Night, (2025, 7, 2), 420.0, 70.0, 0.75, 390, 387),
            record("Filler", Shift::Morning, (2025, 7, 1), 480.0, 35.0, 0.0417, 7800, 7620),
            record("Filler", Shift::Afternoon, (2025, 8, 5), 480.0, 12.5, 0.0417, 8400, 8300),
            record("Packer", Shift::Night, (2025, 8, 6), 420.0, 25.0, 0.05, 6100, 6050),
        ]
    }

    #[test]
    fn must_parse_group_by() {
        assert_eq!("machine".parse::<GroupBy>(), Ok(GroupBy::MACHINE));
        assert_eq!(
            "Month, machine".parse::<GroupBy>(),
            Ok(GroupBy::MACHINE.and(GroupBy::MONTH))
        );
        assert_eq!("".parse::<GroupBy>(), Err(GroupByError::Empty));
        assert_eq!(
            "machine,line".parse::<GroupBy>(),
            Err(GroupByError::UnknownDimension("line".to_owned()))
        );
        assert_eq!(
            GroupBy::MONTH.and(GroupBy::SHIFT).to_string(),
            "shift,month"
        );
    }

    #[test]
    fn must_project_keys() {
        let r = &sample()[1];
        let key = GroupBy::MACHINE.and(GroupBy::MONTH).key(r);
        assert_eq!(key.machine.as_deref(), Some("Mixer"));
        assert_eq!(key.shift, None);
        assert_eq!(key.month, Some(YearMonth { year: 2025, month: 7 }));
        assert_eq!(key.to_string(), "Mixer/2025-07");
    }

    #[test]
    fn empty_input_yields_empty_map() {
        let rollups = aggregate(&[], GroupBy::MACHINE, &MetricConfig::default()).unwrap();
        assert!(rollups.is_empty());
    }

    #[test]
    fn must_group_and_count() {
        let rollups = aggregate(&sample(), GroupBy::MACHINE, &MetricConfig::default()).unwrap();
        let counts = rollups
            .iter()
            .map(|(k, r)| (k.machine.clone().unwrap(), r.records))
            .collect::<Vec<_>>();
        assert_eq!(
            counts,
            vec![
                ("Filler".to_owned(), 2),
                ("Mixer".to_owned(), 2),
                ("Packer".to_owned(), 1)
            ]
        );

        let by_month = aggregate(&sample(), GroupBy::MONTH, &MetricConfig::default()).unwrap();
        assert_eq!(by_month.len(), 2);
        assert_eq!(by_month.values().map(|r| r.records).sum::<usize>(), 5);
    }

    #[test]
    fn must_be_order_independent() {
        let group_by = GroupBy::MACHINE.and(GroupBy::SHIFT);
        let config = MetricConfig::default();
        let forward = aggregate(&sample(), group_by, &config).unwrap();
        let mut reversed = sample();
        reversed.reverse();
        assert_eq!(aggregate(&reversed, group_by, &config).unwrap(), forward);
        let mut rotated = sample();
        rotated.rotate_left(2);
        assert_eq!(aggregate(&rotated, group_by, &config).unwrap(), forward);
    }

    #[test]
    fn must_sum_then_divide() {
        // a short record with poor quality and a full shift with perfect quality
        let records = vec![
            record("Filler", Shift::Morning, (2025, 7, 1), 60.0, 0.0, 0.1, 100, 50),
            record("Filler", Shift::Afternoon, (2025, 7, 1), 480.0, 0.0, 0.1, 4000, 4000),
        ];
        let config = MetricConfig::default();
        let rollups = aggregate(&records, GroupBy::MACHINE, &config).unwrap();
        let rollup = rollups.values().next().unwrap();

        let naive_quality = (0.5 + 1.0) / 2.0;
        let pooled_quality = 4050.0 / 4100.0;
        assert!((rollup.metric.quality - pooled_quality).abs() < 1e-12);
        assert!((rollup.metric.quality - naive_quality).abs() > 0.2);

        let naive_performance = (10.0 / 60.0 + 400.0 / 480.0) / 2.0;
        let pooled_performance = 410.0 / 540.0;
        assert!((rollup.metric.performance - pooled_performance).abs() < 1e-12);
        assert!((rollup.metric.performance - naive_performance).abs() > 0.1);
    }

    #[test]
    fn must_reject_invalid_records() {
        let mut records = sample();
        records[2].good_units = records[2].total_units + 1;
        let err = aggregate(&records, GroupBy::MACHINE, &MetricConfig::default()).unwrap_err();
        assert_eq!(err.field, "good_units");
    }

    #[test]
    fn huge_totals_must_saturate() {
        let mut big = record("Mixer", Shift::Night, (2025, 7, 1), 0.0, 0.0, 0.0, 0, 0);
        big.planned_time = Micros(i64::MAX / 2 + 1);
        big.ideal_cycle_time = Micros(1);
        big.total_units = i64::MAX / 2 + 1;
        big.good_units = big.total_units;
        let rollups = aggregate(&[big.clone(), big], GroupBy::MACHINE, &MetricConfig::default())
            .unwrap();
        let mixer = rollups.values().next().unwrap();
        assert_eq!(mixer.records, 2);
        assert_eq!(mixer.totals.planned_time, Micros(i64::MAX));
        assert_eq!(mixer.totals.total_units, i64::MAX);
        assert_eq!(mixer.totals.good_units, i64::MAX);
        assert!(mixer.metric.oee >= 0.0 && mixer.metric.oee <= 1.0);
    }

    #[test]
    fn shard_merge_equals_single_pass() {
        let group_by = GroupBy::SHIFT.and(GroupBy::MONTH);
        let config = MetricConfig::default();
        let records = sample();

        let mut left = Aggregator::new(group_by);
        let mut right = Aggregator::new(group_by);
        for (idx, r) in records.iter().enumerate() {
            if idx % 2 == 0 {
                left.fold(r).unwrap();
            } else {
                right.fold(r).unwrap();
            }
        }
        let mut right_first = right.clone();
        right_first.merge(left.clone());
        left.merge(right);

        let single = aggregate(&records, group_by, &config).unwrap();
        assert_eq!(left.finish(&config), single);
        assert_eq!(right_first.finish(&config), single);
    }
}
