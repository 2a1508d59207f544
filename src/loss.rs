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
//! Loss analysis: downtime Pareto, speed loss, quality loss and dataset summaries
//!
//! These functions expect records that already passed validation (see
//! [`ProductionRecord::validate`](../model/struct.ProductionRecord.html#method.validate)).
use crate::{
    aggregate::{AggregationKey, GroupBy},
    metric::{MetricConfig, OeeMetric, OeeTotals},
    model::{Day, Micros, ProductionRecord, Shift},
};
use abomonation_derive::Abomonation;
use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One line of a downtime Pareto table in exact units
///
/// This is the form computed by the incremental flow and stored in the database;
/// [`ParetoEntry`](struct.ParetoEntry.html) is the floating point view of it.
#[derive(Clone, Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize, Abomonation)]
pub struct ParetoLine {
    /// 1-based position, largest downtime first
    pub rank: i64,
    pub reason: String,
    pub downtime: Micros,
    /// downtime of this and all higher ranked reasons
    pub cumulative: Micros,
    /// downtime of all reasons
    pub grand_total: Micros,
    pub events: i64,
}

impl ParetoLine {
    pub fn share_pct(&self) -> f64 {
        pct(self.downtime, self.grand_total)
    }

    pub fn cumulative_pct(&self) -> f64 {
        pct(self.cumulative, self.grand_total)
    }

    pub fn average_minutes(&self) -> f64 {
        if self.events > 0 {
            self.downtime.as_minutes() / self.events as f64
        } else {
            0.0
        }
    }
}

fn pct(part: Micros, total: Micros) -> f64 {
    if total > Micros::ZERO {
        100.0 * part.0 as f64 / total.0 as f64
    } else {
        0.0
    }
}

/// Rank per-reason downtime totals
///
/// Sorted by downtime descending, ties by reason name ascending. Reasons with no downtime
/// are left out, so the last line always reaches the grand total.
pub fn rank_downtime(per_reason: BTreeMap<String, (Micros, i64)>) -> Vec<ParetoLine> {
    let grand_total = per_reason
        .values()
        .filter(|(downtime, _)| *downtime > Micros::ZERO)
        .fold(Micros::ZERO, |acc, (downtime, _)| acc + *downtime);
    let mut cumulative = Micros::ZERO;
    per_reason
        .into_iter()
        .filter(|(_, (downtime, _))| *downtime > Micros::ZERO)
        .sorted_by(|(r1, (d1, _)), (r2, (d2, _))| d2.cmp(d1).then_with(|| r1.cmp(r2)))
        .enumerate()
        .map(|(idx, (reason, (downtime, events)))| {
            cumulative += downtime;
            ParetoLine {
                rank: idx as i64 + 1,
                reason,
                downtime,
                cumulative,
                grand_total,
                events,
            }
        })
        .collect()
}

/// One downtime reason's contribution to total downtime
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParetoEntry {
    pub reason: String,
    pub total_minutes: f64,
    pub cumulative_pct: f64,
    pub share_pct: f64,
    pub events: usize,
    pub average_minutes: f64,
}

impl From<&ParetoLine> for ParetoEntry {
    fn from(line: &ParetoLine) -> Self {
        Self {
            reason: line.reason.clone(),
            total_minutes: line.downtime.as_minutes(),
            cumulative_pct: line.cumulative_pct(),
            share_pct: line.share_pct(),
            events: line.events.max(0) as usize,
            average_minutes: line.average_minutes(),
        }
    }
}

/// Downtime minutes by reason, largest first, with running cumulative percentage
pub fn downtime_pareto<'a>(
    records: impl IntoIterator<Item = &'a ProductionRecord>,
) -> Vec<ParetoEntry> {
    let mut per_reason = BTreeMap::<String, (Micros, i64)>::new();
    for record in records {
        if record.downtime > Micros::ZERO {
            let entry = per_reason
                .entry(record.downtime_label())
                .or_insert((Micros::ZERO, 0));
            entry.0 += record.downtime;
            entry.1 += 1;
        }
    }
    rank_downtime(per_reason)
        .iter()
        .map(ParetoEntry::from)
        .collect()
}

/// Total downtime and number of downtime events
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct DowntimeTotals {
    pub minutes: f64,
    pub events: usize,
}

/// Downtime per grouping key and reason, e.g. per machine and reason
pub fn downtime_breakdown<'a>(
    records: impl IntoIterator<Item = &'a ProductionRecord>,
    group_by: GroupBy,
) -> BTreeMap<(AggregationKey, String), DowntimeTotals> {
    let mut exact = BTreeMap::<(AggregationKey, String), (Micros, usize)>::new();
    for record in records {
        if record.downtime > Micros::ZERO {
            let entry = exact
                .entry((group_by.key(record), record.downtime_label()))
                .or_insert((Micros::ZERO, 0));
            entry.0 += record.downtime;
            entry.1 += 1;
        }
    }
    exact
        .into_iter()
        .map(|(key, (downtime, events))| {
            (
                key,
                DowntimeTotals {
                    minutes: downtime.as_minutes(),
                    events,
                },
            )
        })
        .collect()
}

fn totals<'a>(records: impl IntoIterator<Item = &'a ProductionRecord>) -> OeeTotals {
    records
        .into_iter()
        .fold(OeeTotals::default(), |acc, r| acc + OeeTotals::of(r))
}

/// Speed loss in percent over all records
///
/// Actual and ideal rates are formed from summed ideal run time and summed operating time,
/// the same way performance is aggregated.
pub fn speed_loss<'a>(records: impl IntoIterator<Item = &'a ProductionRecord>) -> f64 {
    totals(records).speed_loss_pct()
}

/// A record with its individual speed loss
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpeedLossRecord {
    pub date: Day,
    pub machine: String,
    pub shift: Shift,
    pub speed_loss_pct: f64,
    pub performance: f64,
}

/// The `n` records with the highest speed loss
pub fn worst_speed_loss<'a>(
    records: impl IntoIterator<Item = &'a ProductionRecord>,
    n: usize,
    config: &MetricConfig,
) -> Vec<SpeedLossRecord> {
    records
        .into_iter()
        .map(|r| {
            let totals = OeeTotals::of(r);
            SpeedLossRecord {
                date: r.date,
                machine: r.machine.clone(),
                shift: r.shift,
                speed_loss_pct: totals.speed_loss_pct(),
                performance: totals.metric(config).performance,
            }
        })
        .sorted_by(|a, b| {
            b.speed_loss_pct
                .total_cmp(&a.speed_loss_pct)
                .then_with(|| a.date.cmp(&b.date))
                .then_with(|| a.machine.cmp(&b.machine))
                .then_with(|| a.shift.cmp(&b.shift))
        })
        .take(n)
        .collect()
}

/// Dataset-wide statistics
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub records: usize,
    pub first_date: Option<Day>,
    pub last_date: Option<Day>,
    pub machines: usize,
    pub shifts: usize,
    pub production_days: usize,
    pub total_units: i64,
    pub defective_units: i64,
    pub total_downtime_minutes: f64,
    pub overall: OeeMetric,
    pub speed_loss_pct: f64,
    pub defect_rate_pct: f64,
}

pub fn summarize<'a>(
    records: impl IntoIterator<Item = &'a ProductionRecord>,
    config: &MetricConfig,
) -> Summary {
    let records = records.into_iter().collect::<Vec<_>>();
    let totals = totals(records.iter().copied());
    let (first_date, last_date) = match records.iter().map(|r| r.date).minmax() {
        MinMaxResult::NoElements => (None, None),
        MinMaxResult::OneElement(day) => (Some(day), Some(day)),
        MinMaxResult::MinMax(first, last) => (Some(first), Some(last)),
    };
    Summary {
        records: records.len(),
        first_date,
        last_date,
        machines: records.iter().map(|r| &r.machine).collect::<BTreeSet<_>>().len(),
        shifts: records.iter().map(|r| r.shift).collect::<BTreeSet<_>>().len(),
        production_days: records.iter().map(|r| r.date).collect::<BTreeSet<_>>().len(),
        total_units: totals.total_units,
        defective_units: totals.defective_units(),
        total_downtime_minutes: totals.downtime.as_minutes(),
        overall: totals.metric(config),
        speed_loss_pct: totals.speed_loss_pct(),
        defect_rate_pct: totals.defect_rate_pct(),
    }
}

/// The record holding the extreme value of one metric
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Extreme {
    pub machine: String,
    pub date: Day,
    pub shift: Shift,
    pub value: f64,
}

/// A shift with its OEE over all of its records
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ShiftOee {
    pub shift: Shift,
    pub oee: f64,
}

/// Best and worst single records per metric
///
/// Ratios are in `[0, 1]`, production in units, downtime in minutes. When several records
/// share the extreme value the earliest one in input order is reported. All fields are
/// `None` for an empty record set.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TopPerformers {
    pub best_oee: Option<Extreme>,
    pub worst_oee: Option<Extreme>,
    pub best_availability: Option<Extreme>,
    pub best_performance: Option<Extreme>,
    pub best_quality: Option<Extreme>,
    pub highest_production: Option<Extreme>,
    pub lowest_downtime: Option<Extreme>,
    /// pooled over the shift's records, not averaged per record
    pub best_shift: Option<ShiftOee>,
}

fn extreme<'a>(
    scored: &[(&'a ProductionRecord, OeeMetric)],
    value: impl Fn(&ProductionRecord, &OeeMetric) -> f64,
    highest: bool,
) -> Option<Extreme> {
    let mut found: Option<(&ProductionRecord, f64)> = None;
    for &(record, ref metric) in scored {
        let v = value(record, metric);
        let better = match found {
            None => true,
            Some((_, current)) if highest => v > current,
            Some((_, current)) => v < current,
        };
        if better {
            found = Some((record, v));
        }
    }
    found.map(|(record, value)| Extreme {
        machine: record.machine.clone(),
        date: record.date,
        shift: record.shift,
        value,
    })
}

pub fn top_performers<'a>(
    records: impl IntoIterator<Item = &'a ProductionRecord>,
    config: &MetricConfig,
) -> TopPerformers {
    let mut per_shift = BTreeMap::<Shift, OeeTotals>::new();
    let scored = records
        .into_iter()
        .map(|r| {
            let totals = OeeTotals::of(r);
            *per_shift.entry(r.shift).or_default() += totals;
            (r, totals.metric(config))
        })
        .collect::<Vec<_>>();

    let mut best_shift: Option<ShiftOee> = None;
    for (shift, totals) in per_shift {
        let oee = totals.metric(config).oee;
        if best_shift.as_ref().map_or(true, |best| oee > best.oee) {
            best_shift = Some(ShiftOee { shift, oee });
        }
    }

    TopPerformers {
        best_oee: extreme(&scored, |_, m| m.oee, true),
        worst_oee: extreme(&scored, |_, m| m.oee, false),
        best_availability: extreme(&scored, |_, m| m.availability, true),
        best_performance: extreme(&scored, |_, m| m.performance, true),
        best_quality: extreme(&scored, |_, m| m.quality, true),
        highest_production: extreme(&scored, |r, _| r.total_units as f64, true),
        lowest_downtime: extreme(&scored, |r, _| r.downtime.as_minutes(), false),
        best_shift,
    }
}

/// Lowest and highest single-record OEE of one machine
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct OeeSpread {
    pub min: f64,
    pub max: f64,
}

/// How far the OEE of individual records varies per machine
pub fn oee_spread<'a>(
    records: impl IntoIterator<Item = &'a ProductionRecord>,
    config: &MetricConfig,
) -> BTreeMap<String, OeeSpread> {
    let mut spread = BTreeMap::<String, OeeSpread>::new();
    for r in records {
        let oee = OeeTotals::of(r).metric(config).oee;
        spread
            .entry(r.machine.clone())
            .and_modify(|s| {
                s.min = s.min.min(oee);
                s.max = s.max.max(oee);
            })
            .or_insert(OeeSpread { min: oee, max: oee });
    }
    spread
}
