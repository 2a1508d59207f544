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
//! Incremental OEE rollups and downtime Pareto as dataflow logic
//!
//! The flows here compute the same figures as [`aggregate`](../aggregate/fn.aggregate.html)
//! and [`downtime_pareto`](../loss/fn.downtime_pareto.html), but emit only the changes
//! caused by each batch of new (or retracted) records.
use crate::{
    aggregate::{AggregationKey, GroupBy},
    db::Union,
    flow::{Flow, Input, NeedsState, Scope, Stateful},
    loss::{rank_downtime, ParetoLine},
    metric::OeeTotals,
    model::{Micros, ProductionRecord},
};
use abomonation_derive::Abomonation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summed quantities of all records sharing one key
#[derive(Clone, Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize, Abomonation)]
pub struct GroupTotals {
    pub key: AggregationKey,
    pub totals: OeeTotals,
    pub records: i64,
}

/// Everything the export writes, before ratios are derived
pub type ExportDelta = Union<GroupTotals, ParetoLine>;

/// Per-key totals of the given grouping
pub fn rollups<'a, St: NeedsState>(
    records: &Flow<'a, ProductionRecord, St>,
    group_by: GroupBy,
) -> Flow<'a, GroupTotals, Stateful> {
    records
        .group_by(move |record| group_by.key(record))
        .reduce(|_key, inputs, outputs| {
            let mut totals = OeeTotals::default();
            let mut count = 0;
            for (record, mult) in inputs {
                let mult = *mult as i64;
                totals += OeeTotals::of(record).scaled(mult);
                count += mult;
            }
            if count > 0 {
                outputs.push(((totals, count), 1));
            }
        })
        .ungroup_with(|key, (totals, records)| GroupTotals {
            key: key.clone(),
            totals: *totals,
            records: *records,
        })
}

/// Ranked downtime per reason over all records
pub fn pareto<'a, St: NeedsState>(
    records: &Flow<'a, ProductionRecord, St>,
) -> Flow<'a, ParetoLine, Stateful> {
    records
        .filter(|record| record.downtime > Micros::ZERO)
        .map(|record| (record.downtime_label(), record.downtime))
        // a single group: ranks depend on all reasons
        .group_by(|_| ())
        .reduce(|_, inputs, outputs| {
            let mut per_reason = BTreeMap::<String, (Micros, i64)>::new();
            for ((reason, downtime), mult) in inputs {
                let mult = *mult as i64;
                let entry = per_reason
                    .entry(reason.clone())
                    .or_insert((Micros::ZERO, 0));
                entry.0 += downtime.times(mult);
                entry.1 += mult;
            }
            outputs.extend(rank_downtime(per_reason).into_iter().map(|line| (line, 1)));
        })
        .ungroup()
}

pub fn rollup_logic<'a>(
    scope: &mut Scope<'a>,
    group_by: GroupBy,
) -> (Input<ProductionRecord>, Flow<'a, GroupTotals, Stateful>) {
    let (input, records) = Flow::new(scope);
    (input, rollups(&records, group_by))
}

pub fn pareto_logic<'a>(
    scope: &mut Scope<'a>,
) -> (Input<ProductionRecord>, Flow<'a, ParetoLine, Stateful>) {
    let (input, records) = Flow::new(scope);
    (input, pareto(&records))
}

/// Rollups and Pareto lines from the same records, to be written in one transaction
pub fn export_logic<'a>(
    scope: &mut Scope<'a>,
    group_by: GroupBy,
) -> (Input<ProductionRecord>, Flow<'a, ExportDelta, Stateful>) {
    let (input, records) = Flow::new(scope);
    let out = rollups(&records, group_by)
        .map(ExportDelta::T1)
        .concat(&pareto(&records).map(ExportDelta::T2));
    (input, out)
}
