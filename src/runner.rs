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
//! Driving a [`Machine`](../machine/struct.Machine.html) from record sources into a database
//!
//! The plan for each run is:
//!
//! - read the stored offsets `O` of all sources
//! - feed the rows below `O` again if the logic is stateful, ignoring the output
//! - feed the remaining rows, writing deltas and new offsets every `records_per_txn` rows
//!
//! Each database transaction thus holds deltas and offsets that match each other, and an
//! interrupted export picks up after the last committed batch.
use crate::{
    db::{SourceOffsets, DB},
    deltas::Deltas,
    flow::NeedsState,
    machine::{Inputs, Machine},
    model::ProductionRecord,
    settings::{ExportSettings, InvalidRecordPolicy},
    source::RecordSource,
};
use anyhow::{bail, Context, Result};
use differential_dataflow::ExchangeData;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, trace, warn};

/// Row counts of one export run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExportStats {
    /// previously exported rows fed again to rebuild state
    pub replayed: usize,
    /// new rows reflected in the database
    pub ingested: usize,
    /// new rows skipped because they could not be read or failed validation
    pub rejected: usize,
    /// deltas written
    pub deltas: usize,
}

/// Export a single source, see [`run_sources_on_db`](fn.run_sources_on_db.html)
pub fn run_source_on_db<D, I, O, St, S, F>(
    db: &mut D,
    machine: Machine<I, O, St>,
    source: S,
    convert: F,
    settings: &ExportSettings,
) -> Result<ExportStats>
where
    D: DB,
    I: Inputs<Elem = ProductionRecord>,
    O: ExchangeData,
    St: NeedsState,
    S: RecordSource,
    F: FnMut(O) -> D::Record,
{
    run_sources_on_db(db, machine, vec![source], convert, settings)
}

/// Export the given sources in order, resuming from the offsets stored in the database
///
/// `convert` turns the machine’s output into database rows. A stateful machine must be
/// given every source that contributed to the stored tables, otherwise the previous state
/// cannot be rebuilt and the run is refused.
pub fn run_sources_on_db<D, I, O, St, S, F>(
    db: &mut D,
    mut machine: Machine<I, O, St>,
    sources: Vec<S>,
    mut convert: F,
    settings: &ExportSettings,
) -> Result<ExportStats>
where
    D: DB,
    I: Inputs<Elem = ProductionRecord>,
    O: ExchangeData,
    St: NeedsState,
    S: RecordSource,
    F: FnMut(O) -> D::Record,
{
    let mut offsets = db.get_offsets().context("reading stored offsets")?;
    info!(db = D::name(), sources = sources.len(), "starting export");

    let names = sources
        .iter()
        .map(|s| s.name().to_owned())
        .collect::<BTreeSet<_>>();
    if names.len() < sources.len() {
        bail!("source names must be unique");
    }
    if machine.needs_state() {
        if let Some((missing, _)) = offsets.iter().find(|(name, _)| !names.contains(*name)) {
            bail!(
                "source {} was exported before but is not given, cannot rebuild the rollups",
                missing
            );
        }
    }

    let batch = settings.records_per_txn.max(1);
    let mut stats = ExportStats::default();

    for mut source in sources {
        let name = source.name().to_owned();
        let done = offsets.get(&name).max(0) as usize;

        // rows up to the stored offset are already reflected in the database
        let mut row = 0;
        if machine.needs_state() {
            while row < done {
                let item = match source.next() {
                    Some(item) => item,
                    None => break,
                };
                row += 1;
                if let Ok(record) = item {
                    if machine.inputs().feed(&record).is_ok() {
                        stats.replayed += 1;
                    }
                }
                if row % batch == 0 {
                    let ignored = machine.drain_deltas();
                    debug!(source = %name, row, deltas = ignored.len(), "replaying");
                }
            }
            let ignored = machine.drain_deltas();
            info!(
                source = %name,
                rows = row,
                deltas = ignored.len(),
                "ignored previous output"
            );
        } else {
            while row < done && source.next().is_some() {
                row += 1;
            }
            info!(source = %name, rows = row, "logic is stateless, skipped previous rows");
        }
        if row < done {
            bail!(
                "source {} has only {} rows but {} were exported before",
                name,
                row,
                done
            );
        }

        let mut pending = 0;
        for item in source {
            row += 1;
            pending += 1;
            let fed = item
                .map_err(anyhow::Error::from)
                .and_then(|record| machine.inputs().feed(&record));
            match fed {
                Ok(()) => stats.ingested += 1,
                Err(err) => match settings.on_invalid {
                    InvalidRecordPolicy::Discard => {
                        warn!(source = %name, row, "discarding row: {:#}", err);
                        stats.rejected += 1;
                    }
                    InvalidRecordPolicy::Abort => {
                        return Err(err.context(format!("{} row {}", name, row)));
                    }
                },
            }
            if pending == batch {
                offsets.set(name.as_str(), row as i64);
                stats.deltas += write_batch(db, &mut machine, &offsets, &mut convert)?;
                debug!(source = %name, row, "committed batch");
                pending = 0;
            }
        }
        if pending > 0 {
            offsets.set(name.as_str(), row as i64);
            stats.deltas += write_batch(db, &mut machine, &offsets, &mut convert)?;
        }
        info!(source = %name, rows = row, "source done");
    }

    info!(
        replayed = stats.replayed,
        ingested = stats.ingested,
        rejected = stats.rejected,
        deltas = stats.deltas,
        "export complete"
    );
    Ok(stats)
}

fn write_batch<D, I, O, St, F>(
    db: &mut D,
    machine: &mut Machine<I, O, St>,
    offsets: &SourceOffsets,
    convert: &mut F,
) -> Result<usize>
where
    D: DB,
    I: Inputs<Elem = ProductionRecord>,
    O: ExchangeData,
    St: NeedsState,
    F: FnMut(O) -> D::Record,
{
    let deltas: Deltas<O> = machine.drain_deltas();
    let count = deltas.len();
    trace!(deltas = count, removals = deltas.removals(), "writing batch");
    db.advance_offsets(
        offsets,
        deltas.into_iter().map(|(out, mult)| (convert(out), mult)),
    )
    .context("writing batch")?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregate::{aggregate, GroupBy},
        db::{SqliteDB, Union},
        logic::{export_logic, rollup_logic},
        loss::downtime_pareto,
        metric::MetricConfig,
        model::{
            tests::{record, with_reason},
            DowntimeReason, Shift,
        },
        rows::{export_row, ExportRow, RollupRow},
        source::MemorySource,
    };
    use rusqlite::types::Value;
    use tempfile::NamedTempFile;

    fn july() -> Vec<ProductionRecord> {
        vec![
            with_reason(
                record("Mixer", Shift::Morning, (2025, 7, 1), 480.0, 45.0, 0.75, 480, 475),
                DowntimeReason::Breakdown,
            ),
            with_reason(
                record("Filler", Shift::Morning, (2025, 7, 1), 480.0, 60.0, 0.1, 3600, 3528),
                DowntimeReason::Changeover,
            ),
            record("Packer", Shift::Night, (2025, 7, 2), 420.0, 0.0, 0.05, 7000, 6990),
            with_reason(
                record("Mixer", Shift::Night, (2025, 7, 2), 480.0, 20.0, 0.75, 520, 500),
                DowntimeReason::Cleaning,
            ),
            with_reason(
                record("Filler", Shift::Afternoon, (2025, 7, 3), 480.0, 90.0, 0.1, 3000, 2990),
                DowntimeReason::Breakdown,
            ),
        ]
    }

    fn settings(records_per_txn: usize, on_invalid: InvalidRecordPolicy) -> ExportSettings {
        ExportSettings {
            records_per_txn,
            on_invalid,
            ..ExportSettings::default()
        }
    }

    fn export(
        db: &mut SqliteDB<ExportRow>,
        records: Vec<ProductionRecord>,
        settings: &ExportSettings,
    ) -> Result<ExportStats> {
        let config = MetricConfig::default();
        run_source_on_db(
            db,
            Machine::new(|scope| export_logic(scope, GroupBy::MACHINE)),
            MemorySource::new("july", records),
            move |delta| export_row(delta, &config),
            settings,
        )
    }

    fn text(v: &Value) -> String {
        match v {
            Value::Text(s) => s.clone(),
            other => panic!("not text: {:?}", other),
        }
    }

    fn real(v: &Value) -> f64 {
        match v {
            Value::Real(x) => *x,
            other => panic!("not real: {:?}", other),
        }
    }

    fn int(v: &Value) -> i64 {
        match v {
            Value::Integer(x) => *x,
            other => panic!("not integer: {:?}", other),
        }
    }

    /// (machine, records, oee) sorted by machine
    fn stored_rollups(db: &mut SqliteDB<ExportRow>) -> Vec<(String, i64, f64)> {
        let mut rows = db
            .get_records("oee_rollup")
            .unwrap()
            .iter()
            .map(|row| (text(&row[0]), int(&row[3]), real(&row[12])))
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// (rank, reason, cumulative_pct) sorted by rank
    fn stored_pareto(db: &mut SqliteDB<ExportRow>) -> Vec<(i64, String, f64)> {
        let mut rows = db
            .get_records("downtime_pareto")
            .unwrap()
            .iter()
            .map(|row| (int(&row[0]), text(&row[1]), real(&row[4])))
            .collect::<Vec<_>>();
        rows.sort_by_key(|r| r.0);
        rows
    }

    fn expected_rollups(records: &[ProductionRecord]) -> Vec<(String, i64, f64)> {
        aggregate(records, GroupBy::MACHINE, &MetricConfig::default())
            .unwrap()
            .into_iter()
            .map(|(key, rollup)| {
                (
                    key.machine.unwrap_or_default(),
                    rollup.records as i64,
                    rollup.metric.oee,
                )
            })
            .collect()
    }

    fn expected_pareto(records: &[ProductionRecord]) -> Vec<(i64, String, f64)> {
        downtime_pareto(records)
            .into_iter()
            .enumerate()
            .map(|(idx, e)| (idx as i64 + 1, e.reason, e.cumulative_pct))
            .collect()
    }

    #[test_env_log::test]
    fn must_export_rollups_and_pareto() {
        let mut db = SqliteDB::<ExportRow>::new("", ":memory:").unwrap();
        let records = july();
        let stats = export(&mut db, records.clone(), &settings(2, InvalidRecordPolicy::Abort))
            .unwrap();
        assert_eq!(stats.ingested, 5);
        assert_eq!(stats.replayed, 0);
        assert_eq!(stats.rejected, 0);

        assert_eq!(stored_rollups(&mut db), expected_rollups(&records));
        assert_eq!(stored_pareto(&mut db), expected_pareto(&records));
        assert_eq!(db.get_offsets().unwrap().get("july"), 5);
    }

    #[test_env_log::test]
    fn must_resume_without_duplicates() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().display().to_string();
        let records = july();

        {
            let mut db = SqliteDB::<ExportRow>::new("plant1", &path).unwrap();
            let stats = export(
                &mut db,
                records[..3].to_vec(),
                &settings(1000, InvalidRecordPolicy::Abort),
            )
            .unwrap();
            assert_eq!(stats.ingested, 3);
        }

        let mut db = SqliteDB::<ExportRow>::new("plant1", &path).unwrap();
        let stats = export(&mut db, records.clone(), &settings(1000, InvalidRecordPolicy::Abort))
            .unwrap();
        assert_eq!(stats.replayed, 3);
        assert_eq!(stats.ingested, 2);
        assert_eq!(stored_rollups(&mut db), expected_rollups(&records));
        assert_eq!(stored_pareto(&mut db), expected_pareto(&records));

        // nothing new: nothing written
        let stats = export(&mut db, records.clone(), &settings(1000, InvalidRecordPolicy::Abort))
            .unwrap();
        assert_eq!((stats.replayed, stats.ingested, stats.deltas), (5, 0, 0));
        assert_eq!(stored_rollups(&mut db), expected_rollups(&records));
    }

    #[test_env_log::test]
    fn must_apply_invalid_record_policy() {
        let mut records = july();
        records[1].good_units = records[1].total_units + 1;

        let mut db = SqliteDB::<ExportRow>::new("", ":memory:").unwrap();
        let stats = export(&mut db, records.clone(), &settings(2, InvalidRecordPolicy::Discard))
            .unwrap();
        assert_eq!((stats.ingested, stats.rejected), (4, 1));
        let mut valid = records.clone();
        valid.remove(1);
        assert_eq!(stored_rollups(&mut db), expected_rollups(&valid));
        assert_eq!(db.get_offsets().unwrap().get("july"), 5);

        let mut db = SqliteDB::<ExportRow>::new("", ":memory:").unwrap();
        let err = export(&mut db, records, &settings(1, InvalidRecordPolicy::Abort)).unwrap_err();
        assert!(format!("{:#}", err).contains("good_units"));
        // the first row was committed before the bad one was seen
        assert_eq!(db.get_offsets().unwrap().get("july"), 1);
        assert_eq!(stored_rollups(&mut db).len(), 1);
    }

    #[test_env_log::test]
    fn must_refuse_incomplete_sources() {
        let mut db = SqliteDB::<Union<RollupRow>>::new("", ":memory:").unwrap();
        let config = MetricConfig::default();
        let convert = move |group| Union::T1(RollupRow::new(group, &config));
        let mut offsets = SourceOffsets::empty();
        offsets.set("june", 10);
        db.advance_offsets(&offsets, Vec::<(Union<RollupRow>, isize)>::new())
            .unwrap();

        let err = run_source_on_db(
            &mut db,
            Machine::new(|scope| rollup_logic(scope, GroupBy::SHIFT)),
            MemorySource::new("july", july()),
            convert,
            &ExportSettings::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("june"));

        let err = run_sources_on_db(
            &mut db,
            Machine::new(|scope| rollup_logic(scope, GroupBy::SHIFT)),
            vec![
                MemorySource::new("june", july()[..2].to_vec()),
                MemorySource::new("july", july()),
            ],
            convert,
            &ExportSettings::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("only 2 rows"));
    }
}
