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
//! Named streams of production records
//!
//! A source yields one item per data row, in a stable order, so that the number of items
//! consumed can serve as its offset in the export tables.
use crate::{
    error::ValidationError,
    model::{Day, DowntimeReason, Micros, ProductionRecord, Shift},
    settings::InvalidRecordPolicy,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{fs::File, io::Read, path::Path};
use thiserror::Error;
use tracing::warn;

/// Failure to turn one row of a source into a valid record
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("row {row}: {source}")]
    Csv { row: usize, source: csv::Error },
    #[error("row {row}: invalid {field}: {reason}")]
    Field {
        row: usize,
        field: &'static str,
        reason: String,
    },
    #[error("row {row}: {source}")]
    Invalid {
        row: usize,
        source: ValidationError,
    },
}

impl SourceError {
    /// 1-based data row the error refers to, if any
    pub fn row(&self) -> Option<usize> {
        match self {
            SourceError::Open { .. } => None,
            SourceError::Csv { row, .. }
            | SourceError::Field { row, .. }
            | SourceError::Invalid { row, .. } => Some(*row),
        }
    }
}

/// A named, ordered stream of records
pub trait RecordSource: Iterator<Item = Result<ProductionRecord, SourceError>> {
    /// stable name under which the export stores this source's offset
    fn name(&self) -> &str;
}

/// Unit of the `Ideal_Cycle_Time` column
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleTimeUnit {
    Seconds,
    Minutes,
}

impl Default for CycleTimeUnit {
    fn default() -> Self {
        CycleTimeUnit::Seconds
    }
}

impl CycleTimeUnit {
    fn to_micros(self, value: f64) -> Micros {
        match self {
            CycleTimeUnit::Seconds => Micros::from_seconds(value),
            CycleTimeUnit::Minutes => Micros::from_minutes(value),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Shift")]
    shift: String,
    #[serde(rename = "Machine_Name")]
    machine: String,
    #[serde(rename = "Planned_Production_Time")]
    planned_minutes: f64,
    #[serde(rename = "Downtime_Minutes")]
    downtime_minutes: f64,
    #[serde(rename = "Downtime_Reason", default)]
    downtime_reason: Option<String>,
    #[serde(rename = "Ideal_Cycle_Time")]
    ideal_cycle_time: f64,
    #[serde(rename = "Total_Units_Produced")]
    total_units: i64,
    #[serde(rename = "Good_Units")]
    good_units: i64,
}

/// Plant CSV export with a header line
///
/// Columns are matched by header name; unknown columns such as `Actual_Cycle_Time` or
/// `Defective_Units` are ignored. A `Downtime_Reason` of `None` or an empty cell means no
/// reason was booked.
pub struct CsvSource<R: Read> {
    name: String,
    rows: csv::DeserializeRecordsIntoIter<R, CsvRow>,
    unit: CycleTimeUnit,
    row: usize,
}

impl CsvSource<File> {
    /// Open a file, using its path as source name
    pub fn from_path(path: impl AsRef<Path>, unit: CycleTimeUnit) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_reader(path.display().to_string(), file, unit))
    }
}

impl<R: Read> CsvSource<R> {
    pub fn from_reader(name: impl Into<String>, reader: R, unit: CycleTimeUnit) -> Self {
        let rows = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader)
            .into_deserialize();
        Self {
            name: name.into(),
            rows,
            unit,
            row: 0,
        }
    }
}

fn convert(row: usize, raw: CsvRow, unit: CycleTimeUnit) -> Result<ProductionRecord, SourceError> {
    let date = NaiveDate::parse_from_str(&raw.date, "%Y-%m-%d").map_err(|e| SourceError::Field {
        row,
        field: "Date",
        reason: format!("{:?}: {}", raw.date, e),
    })?;
    let shift = raw
        .shift
        .parse::<Shift>()
        .map_err(|e| SourceError::Field {
            row,
            field: "Shift",
            reason: e.to_string(),
        })?;
    if raw.machine.is_empty() {
        return Err(SourceError::Field {
            row,
            field: "Machine_Name",
            reason: "must not be empty".to_owned(),
        });
    }
    let downtime_reason = raw
        .downtime_reason
        .filter(|r| !r.is_empty() && !r.eq_ignore_ascii_case("none"))
        .map(|r| r.parse::<DowntimeReason>())
        .transpose()
        .unwrap_or_else(|never| match never {});
    let record = ProductionRecord {
        date: Day(date),
        machine: raw.machine,
        shift,
        planned_time: Micros::from_minutes(raw.planned_minutes),
        downtime: Micros::from_minutes(raw.downtime_minutes),
        downtime_reason,
        ideal_cycle_time: unit.to_micros(raw.ideal_cycle_time),
        total_units: raw.total_units,
        good_units: raw.good_units,
    };
    record
        .validate()
        .map_err(|source| SourceError::Invalid { row, source })?;
    Ok(record)
}

impl<R: Read> Iterator for CsvSource<R> {
    type Item = Result<ProductionRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = self.rows.next()?;
        self.row += 1;
        let row = self.row;
        let unit = self.unit;
        Some(
            raw.map_err(|source| SourceError::Csv { row, source })
                .and_then(|raw| convert(row, raw, unit)),
        )
    }
}

impl<R: Read> RecordSource for CsvSource<R> {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Records that are already in memory, e.g. constructed by another system
pub struct MemorySource {
    name: String,
    records: std::vec::IntoIter<ProductionRecord>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, records: Vec<ProductionRecord>) -> Self {
        Self {
            name: name.into(),
            records: records.into_iter(),
        }
    }
}

impl Iterator for MemorySource {
    type Item = Result<ProductionRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next().map(Ok)
    }
}

impl RecordSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Read a whole source into memory
///
/// Returns the valid records and the number of discarded rows; with
/// [`InvalidRecordPolicy::Abort`](../settings/enum.InvalidRecordPolicy.html) the first bad
/// row is returned as error instead.
pub fn collect_records<S: RecordSource>(
    source: S,
    policy: InvalidRecordPolicy,
) -> Result<(Vec<ProductionRecord>, usize), SourceError> {
    let name = source.name().to_owned();
    let mut records = Vec::new();
    let mut rejected = 0;
    for item in source {
        match item {
            Ok(record) => records.push(record),
            Err(err) if policy == InvalidRecordPolicy::Discard => {
                warn!(source = %name, "discarding {}", err);
                rejected += 1;
            }
            Err(err) => return Err(err),
        }
    }
    Ok((records, rejected))
}
