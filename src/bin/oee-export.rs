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
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oee_data_flow::{
    aggregate::GroupBy,
    db::{PostgresDB, SqliteDB, DB},
    logic::export_logic,
    machine::Machine,
    report::Report,
    rows::{export_row, ExportRow},
    runner::{run_sources_on_db, ExportStats},
    settings::{InvalidRecordPolicy, Settings},
    source::{collect_records, CsvSource},
};
use std::{fs::File, path::PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OEE rollups and downtime analysis for plant production logs
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Settings file (defaults to ./oee.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Stop at the first invalid row instead of skipping it
    #[arg(long, global = true)]
    strict: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyse CSV files and print a JSON report
    Report {
        /// Production log CSV files
        #[arg(long = "input", required = true)]
        inputs: Vec<PathBuf>,
        /// Comma-separated grouping dimensions: machine, shift, month
        #[arg(long, default_value = "machine")]
        group_by: GroupBy,
        /// Length of the worst speed-loss list
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
    /// Incrementally export rollups and the downtime Pareto into a database
    Export {
        /// Production log CSV files, all files of earlier runs must be given again
        #[arg(long = "input", required = true)]
        inputs: Vec<PathBuf>,
        /// SQLite file name or postgres:// connection string
        #[arg(long)]
        db: String,
        #[arg(long, default_value = "machine")]
        group_by: GroupBy,
        /// Input rows per database transaction
        #[arg(long)]
        records_per_txn: Option<usize>,
    },
}

impl Args {
    /// Flags given on the command line win over the settings file and environment
    fn override_settings(&self, settings: &mut Settings) {
        if let Some(level) = &self.log_level {
            settings.log_level = level.clone();
        }
        if self.strict {
            settings.export.on_invalid = InvalidRecordPolicy::Abort;
        }
        if let Command::Export {
            records_per_txn: Some(n),
            ..
        } = self.command
        {
            settings.export.records_per_txn = n;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    args.override_settings(&mut settings);

    // set up logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .context("parsing log filter")?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Report {
            inputs,
            group_by,
            top,
        } => {
            let mut records = Vec::new();
            let mut rejected = 0;
            for path in &inputs {
                let source = CsvSource::from_path(path, settings.source.cycle_time_unit)?;
                let (mut valid, skipped) = collect_records(source, settings.export.on_invalid)
                    .with_context(|| format!("reading {}", path.display()))?;
                info!(file = %path.display(), records = valid.len(), skipped, "loaded");
                records.append(&mut valid);
                rejected += skipped;
            }
            let report = Report::new(&records, rejected, group_by, top, &settings.metric)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Export {
            inputs,
            db,
            group_by,
            ..
        } => {
            settings.validate()?;
            let prefix = settings.export.table_prefix.clone();
            let stats = if db.starts_with("postgres://") || db.starts_with("postgresql://") {
                export(&mut PostgresDB::<ExportRow>::new(prefix, &db)?, &inputs, group_by, &settings)?
            } else {
                export(&mut SqliteDB::<ExportRow>::new(prefix, &db)?, &inputs, group_by, &settings)?
            };
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

fn export<D: DB<Record = ExportRow>>(
    db: &mut D,
    inputs: &[PathBuf],
    group_by: GroupBy,
    settings: &Settings,
) -> Result<ExportStats> {
    let sources = inputs
        .iter()
        .map(|path| CsvSource::<File>::from_path(path, settings.source.cycle_time_unit))
        .collect::<Result<Vec<_>, _>>()?;
    let metric = settings.metric;
    run_sources_on_db(
        db,
        Machine::new(move |scope| export_logic(scope, group_by)),
        sources,
        move |delta| export_row(delta, &metric),
        &settings.export,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn must_parse_report_args() {
        let args = Args::try_parse_from(&[
            "oee-export",
            "report",
            "--input",
            "july.csv",
            "--input",
            "august.csv",
            "--group-by",
            "shift,month",
        ])
        .unwrap();
        match args.command {
            Command::Report {
                inputs,
                group_by,
                top,
            } => {
                assert_eq!(inputs, vec![PathBuf::from("july.csv"), PathBuf::from("august.csv")]);
                assert_eq!(group_by, GroupBy::SHIFT.and(GroupBy::MONTH));
                assert_eq!(top, 5);
            }
            cmd => panic!("unexpected command {:?}", cmd),
        }
        assert!(!args.strict);
    }

    #[test]
    fn must_reject_bad_grouping() {
        let res = Args::try_parse_from(&["oee-export", "report", "--input", "a.csv", "--group-by", "week"]);
        assert!(res.is_err());
        let res = Args::try_parse_from(&["oee-export", "report"]);
        assert!(res.is_err());
    }

    #[test]
    fn flags_must_override_settings() {
        let args = Args::try_parse_from(&[
            "oee-export",
            "export",
            "--input",
            "july.csv",
            "--db",
            ":memory:",
            "--records-per-txn",
            "250",
            "--strict",
            "--log-level",
            "debug",
        ])
        .unwrap();
        let mut settings = Settings::default();
        assert_eq!(settings.export.on_invalid, InvalidRecordPolicy::Discard);
        args.override_settings(&mut settings);
        assert_eq!(settings.export.on_invalid, InvalidRecordPolicy::Abort);
        assert_eq!(settings.export.records_per_txn, 250);
        assert_eq!(settings.log_level, "debug");

        let args = Args::try_parse_from(&["oee-export", "report", "--input", "july.csv"]).unwrap();
        let mut untouched = Settings::default();
        args.override_settings(&mut untouched);
        assert_eq!(untouched, Settings::default());
    }
}
