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
//! All batch analyses of a record set in one serializable document
use crate::{
    aggregate::{aggregate, AggregationKey, GroupBy, Rollup},
    error::ValidationError,
    loss::{
        downtime_breakdown, downtime_pareto, oee_spread, summarize, top_performers,
        worst_speed_loss, OeeSpread, ParetoEntry, SpeedLossRecord, Summary, TopPerformers,
    },
    metric::MetricConfig,
    model::ProductionRecord,
};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KeyedRollup {
    pub key: AggregationKey,
    #[serde(flatten)]
    pub rollup: Rollup,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BreakdownEntry {
    pub key: AggregationKey,
    pub reason: String,
    pub minutes: f64,
    pub events: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    pub group_by: String,
    /// rows of the source that were discarded before the analysis
    pub rejected: usize,
    pub summary: Summary,
    pub rollups: Vec<KeyedRollup>,
    pub downtime_pareto: Vec<ParetoEntry>,
    pub downtime_breakdown: Vec<BreakdownEntry>,
    pub worst_speed_loss: Vec<SpeedLossRecord>,
    pub top_performers: TopPerformers,
    /// per machine
    pub oee_spread: BTreeMap<String, OeeSpread>,
}

impl Report {
    /// Analyse valid records; `top` limits the worst speed-loss list
    pub fn new(
        records: &[ProductionRecord],
        rejected: usize,
        group_by: GroupBy,
        top: usize,
        config: &MetricConfig,
    ) -> Result<Self, ValidationError> {
        let rollups = aggregate(records, group_by, config)?
            .into_iter()
            .map(|(key, rollup)| KeyedRollup { key, rollup })
            .collect();
        let breakdown = downtime_breakdown(records, group_by)
            .into_iter()
            .map(|((key, reason), totals)| BreakdownEntry {
                key,
                reason,
                minutes: totals.minutes,
                events: totals.events,
            })
            .collect();
        Ok(Self {
            group_by: group_by.to_string(),
            rejected,
            summary: summarize(records, config),
            rollups,
            downtime_pareto: downtime_pareto(records),
            downtime_breakdown: breakdown,
            worst_speed_loss: worst_speed_loss(records, top, config),
            top_performers: top_performers(records, config),
            oee_spread: oee_spread(records, config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        tests::{record, with_reason},
        DowntimeReason, Shift,
    };
    use serde_json::json;

    #[test]
    fn must_render_json() {
        let records = vec![
            with_reason(
                record("Filler", Shift::Morning, (2025, 7, 1), 480.0, 60.0, 0.1, 3600, 3528),
                DowntimeReason::Breakdown,
            ),
            record("Packer", Shift::Night, (2025, 7, 2), 480.0, 0.0, 0.05, 7000, 6990),
        ];
        let report = Report::new(&records, 1, GroupBy::MACHINE, 1, &MetricConfig::default())
            .unwrap();
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["group_by"], json!("machine"));
        assert_eq!(value["rejected"], json!(1));
        assert_eq!(value["summary"]["records"], json!(2));
        assert_eq!(value["summary"]["first_date"], json!("2025-07-01"));
        assert_eq!(value["rollups"][0]["key"]["machine"], json!("Filler"));
        assert_eq!(value["rollups"][0]["key"]["shift"], json!(null));
        assert_eq!(value["rollups"][0]["records"], json!(1));
        assert!(value["rollups"][0]["metric"]["oee"].as_f64().unwrap() > 0.7);
        assert_eq!(value["downtime_pareto"][0]["reason"], json!("Breakdown"));
        assert_eq!(value["downtime_pareto"][0]["cumulative_pct"], json!(100.0));
        assert_eq!(value["downtime_breakdown"][0]["minutes"], json!(60.0));
        assert_eq!(value["worst_speed_loss"].as_array().unwrap().len(), 1);
        assert_eq!(value["worst_speed_loss"][0]["machine"], json!("Packer"));
        assert_eq!(value["top_performers"]["highest_production"]["machine"], json!("Packer"));
        assert_eq!(value["top_performers"]["lowest_downtime"]["value"], json!(0.0));
        assert_eq!(value["top_performers"]["best_shift"]["shift"], json!("Morning"));
        assert!(value["oee_spread"]["Filler"]["min"].as_f64().unwrap() > 0.7);
    }
}
