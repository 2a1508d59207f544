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
//! Overall Equipment Effectiveness for plant production logs
//!
//! Each row of a production log describes one machine during one shift: planned time,
//! downtime with its reason, ideal cycle time and unit counts. From these the crate computes
//! availability, performance, quality and OEE, groups them by machine, shift or month, and
//! ranks downtime reasons in a Pareto list.
//!
//! The batch functions in [`aggregate`](aggregate/index.html) and [`loss`](loss/index.html)
//! work on slices of records. The same rollups can also be maintained incrementally with
//! differential dataflow and exported into SQL databases, so that appending rows to a log
//! only writes the changed rollups:
//!
//! ```rust,no_run
//! use oee_data_flow::{
//!     aggregate::GroupBy, db::SqliteDB, logic::export_logic, machine::Machine,
//!     metric::MetricConfig, rows::export_row, runner::run_source_on_db,
//!     settings::ExportSettings, source::{CsvSource, CycleTimeUnit},
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut db = SqliteDB::new("", "oee.sqlite")?;
//! let source = CsvSource::from_path("july.csv", CycleTimeUnit::Seconds)?;
//! let config = MetricConfig::default();
//! let group_by = GroupBy::MACHINE.and(GroupBy::SHIFT);
//!
//! run_source_on_db(
//!     &mut db,
//!     Machine::new(move |scope| export_logic(scope, group_by)),
//!     source,
//!     move |delta| export_row(delta, &config),
//!     &ExportSettings::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod db;
pub mod deltas;
pub mod error;
pub mod flow;
pub mod logic;
pub mod loss;
pub mod machine;
pub mod metric;
pub mod model;
pub mod report;
pub mod rows;
pub mod runner;
pub mod settings;
pub mod source;
