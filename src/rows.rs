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
//! Table rows written by the export
//!
//! Column types are chosen to be understood by both bundled drivers, so one column list
//! serves SQLite and PostgreSQL alike.
use crate::{
    db::{DbColumn, DbMechanics, DbRecord, PostgresDbMechanics, SqliteDbMechanics, Union},
    logic::{ExportDelta, GroupTotals},
    loss::ParetoLine,
    metric::MetricConfig,
};
use serde::Serialize;

/// One rollup with its derived ratios, as stored in the `oee_rollup` table
///
/// Grouping columns that are not part of the configured grouping are NULL.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RollupRow {
    pub machine: Option<String>,
    pub shift: Option<String>,
    pub month: Option<String>,
    pub records: i64,
    pub planned_minutes: f64,
    pub downtime_minutes: f64,
    pub operating_minutes: f64,
    pub total_units: i64,
    pub good_units: i64,
    pub availability: f64,
    pub performance: f64,
    pub quality: f64,
    pub oee: f64,
    pub speed_loss_pct: f64,
    pub defect_rate_pct: f64,
}

impl RollupRow {
    pub fn new(group: GroupTotals, config: &MetricConfig) -> Self {
        let GroupTotals {
            key,
            totals,
            records,
        } = group;
        let metric = totals.metric(config);
        Self {
            machine: key.machine,
            shift: key.shift.map(|s| s.to_string()),
            month: key.month.map(|m| m.to_string()),
            records,
            planned_minutes: totals.planned_time.as_minutes(),
            downtime_minutes: totals.downtime.as_minutes(),
            operating_minutes: metric.operating_minutes,
            total_units: totals.total_units,
            good_units: totals.good_units,
            availability: metric.availability,
            performance: metric.performance,
            quality: metric.quality,
            oee: metric.oee,
            speed_loss_pct: totals.speed_loss_pct(),
            defect_rate_pct: totals.defect_rate_pct(),
        }
    }
}

/// The rows of all export tables
pub type ExportRow = Union<RollupRow, ParetoLine>;

/// Derive the stored form of a delta
///
/// Ratios are a pure function of the totals and the configuration, so a retraction yields
/// exactly the row that was inserted for the same totals earlier.
pub fn export_row(delta: ExportDelta, config: &MetricConfig) -> ExportRow {
    match delta {
        Union::T1(group) => Union::T1(RollupRow::new(group, config)),
        Union::T2(line) => Union::T2(line),
        Union::T3(x) => Union::T3(x),
        Union::T4(x) => Union::T4(x),
        Union::T5(x) => Union::T5(x),
    }
}

static ROLLUP_COLUMNS: &[DbColumn] = &[
    DbColumn {
        name: "machine",
        tpe: "text",
        exclude: false,
        index: true,
    },
    DbColumn {
        name: "shift",
        tpe: "text",
        exclude: false,
        index: true,
    },
    DbColumn {
        name: "month",
        tpe: "text",
        exclude: false,
        index: true,
    },
    DbColumn {
        name: "records",
        tpe: "bigint not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "planned_minutes",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "downtime_minutes",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "operating_minutes",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "total_units",
        tpe: "bigint not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "good_units",
        tpe: "bigint not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "availability",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "performance",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "quality",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "oee",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "speed_loss_pct",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "defect_rate_pct",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
];

static PARETO_COLUMNS: &[DbColumn] = &[
    DbColumn {
        name: "pareto_rank",
        tpe: "bigint not null",
        exclude: false,
        index: true,
    },
    DbColumn {
        name: "reason",
        tpe: "text not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "downtime_minutes",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "share_pct",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "cumulative_pct",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "events",
        tpe: "bigint not null",
        exclude: false,
        index: false,
    },
    DbColumn {
        name: "average_minutes",
        tpe: "double precision not null",
        exclude: false,
        index: false,
    },
];

// The drivers differ only in the boxed value type.
macro_rules! export_tables {
    ($($mechanics:ty),*) => {$(
        impl DbRecord<$mechanics> for RollupRow {
            fn table_version() -> i32 {
                1
            }
            fn table_name() -> &'static str {
                "oee_rollup"
            }
            fn columns() -> &'static [DbColumn] {
                ROLLUP_COLUMNS
            }
            fn values(&self) -> Vec<<$mechanics as DbMechanics>::SqlValue> {
                vec![
                    Box::new(self.machine.clone()),
                    Box::new(self.shift.clone()),
                    Box::new(self.month.clone()),
                    Box::new(self.records),
                    Box::new(self.planned_minutes),
                    Box::new(self.downtime_minutes),
                    Box::new(self.operating_minutes),
                    Box::new(self.total_units),
                    Box::new(self.good_units),
                    Box::new(self.availability),
                    Box::new(self.performance),
                    Box::new(self.quality),
                    Box::new(self.oee),
                    Box::new(self.speed_loss_pct),
                    Box::new(self.defect_rate_pct),
                ]
            }
        }

        impl DbRecord<$mechanics> for ParetoLine {
            fn table_version() -> i32 {
                1
            }
            fn table_name() -> &'static str {
                "downtime_pareto"
            }
            fn columns() -> &'static [DbColumn] {
                PARETO_COLUMNS
            }
            fn values(&self) -> Vec<<$mechanics as DbMechanics>::SqlValue> {
                vec![
                    Box::new(self.rank),
                    Box::new(self.reason.clone()),
                    Box::new(self.downtime.as_minutes()),
                    Box::new(self.share_pct()),
                    Box::new(self.cumulative_pct()),
                    Box::new(self.events),
                    Box::new(self.average_minutes()),
                ]
            }
        }
    )*};
}

export_tables!(SqliteDbMechanics, PostgresDbMechanics);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregate::GroupBy,
        metric::OeeTotals,
        model::{tests::record, Shift},
    };

    #[test]
    fn must_derive_rollup_row() {
        let r = record("Filler", Shift::Morning, (2025, 7, 1), 480.0, 60.0, 0.1, 3600, 3528);
        let group = GroupTotals {
            key: GroupBy::MACHINE.and(GroupBy::MONTH).key(&r),
            totals: OeeTotals::of(&r),
            records: 1,
        };
        let row = RollupRow::new(group, &MetricConfig::default());
        assert_eq!(row.machine.as_deref(), Some("Filler"));
        assert_eq!(row.shift, None);
        assert_eq!(row.month.as_deref(), Some("2025-07"));
        assert_eq!(row.operating_minutes, 420.0);
        assert_eq!(row.total_units - row.good_units, 72);
        assert!((row.oee - 0.735).abs() < 1e-3);
    }

    #[test]
    fn values_must_match_columns() {
        let r = record("Filler", Shift::Morning, (2025, 7, 1), 480.0, 60.0, 0.1, 3600, 3528);
        let group = GroupTotals {
            key: GroupBy::SHIFT.key(&r),
            totals: OeeTotals::of(&r),
            records: 1,
        };
        let row = RollupRow::new(group, &MetricConfig::default());
        assert_eq!(
            DbRecord::<SqliteDbMechanics>::values(&row).len(),
            <RollupRow as DbRecord<SqliteDbMechanics>>::columns().len()
        );
        let line = crate::loss::rank_downtime(
            vec![("Breakdown".to_owned(), (r.downtime, 1))]
                .into_iter()
                .collect(),
        )
        .remove(0);
        assert_eq!(
            DbRecord::<PostgresDbMechanics>::values(&line).len(),
            <ParetoLine as DbRecord<PostgresDbMechanics>>::columns().len()
        );
    }
}
