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
//! Persisting export deltas together with the source offsets they correspond to
//!
//! A [`DB`](trait.DB.html) stands for a group of tables in one database. Reading it yields
//! the [`SourceOffsets`](struct.SourceOffsets.html) up to which input rows are reflected in
//! the tables; advancing it applies a batch of deltas and the new offsets atomically, so
//! a crash can never leave rows and offsets out of step.
//!
//! Row types describe their table through [`DbRecord`](trait.DbRecord.html). Up to five of
//! them are written side by side by wrapping them in a [`Union`](enum.Union.html); the
//! driver only sees the union's [`DbRecordExt`](trait.DbRecordExt.html), which renders all
//! SQL from the table descriptions and the driver's [`DbMechanics`](trait.DbMechanics.html).
//!
//! # Tables
//!
//! Every row type gets the table named by `table_name()` (with the configured prefix). The
//! offsets live in one extra table named after the first row type's table plus
//! `_`[`OFFSETS_TABLE_SUFFIX`](constant.OFFSETS_TABLE_SUFFIX.html).
//!
//! # Versions
//!
//! The tables hold derived data only. When a row type's `table_version()` differs from the
//! version recorded in [`SCHEMA_VERSIONS_TABLE_NAME`](constant.SCHEMA_VERSIONS_TABLE_NAME.html),
//! its table and the offsets are dropped and recreated empty, and the next export starts
//! over from the first row of every source.

use abomonation_derive::Abomonation;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, iter::FromIterator};

mod postgre;
mod sqlite;

pub use postgre::{PostgresDB, PostgresDbMechanics};
pub use sqlite::{SqliteDB, SqliteDbMechanics};

pub const SCHEMA_VERSIONS_TABLE_NAME: &str = "_schema_versions";
pub const OFFSETS_TABLE_SUFFIX: &str = "offsets";

/// Number of rows consumed per named input source
///
/// A source that has never been seen has offset 0. Offsets only ever grow while exporting
/// into the same set of tables; they are reset together with the tables on a schema change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOffsets(BTreeMap<String, i64>);

impl SourceOffsets {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, source: &str) -> i64 {
        self.0.get(source).copied().unwrap_or(0)
    }

    pub fn set(&mut self, source: impl Into<String>, offset: i64) {
        self.0.insert(source.into(), offset);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(s, o)| (s.as_str(), *o))
    }

    /// number of sources
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, i64)> for SourceOffsets {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// SQL dialect of one database driver
pub trait DbMechanics {
    /// boxed parameter type accepted by the driver's prepared statements
    type SqlValue;

    /// prefix of all table names, already including its separator
    fn table_prefix(&self) -> &str;
    fn table_name(&self, table: &str) -> String {
        format!("{}{}", self.table_prefix(), table)
    }

    /// Placeholders for statement parameters, in order (`?` or `$1`, `$2`, …)
    fn field_iter() -> Box<dyn Iterator<Item = String>>;
    fn create_table(name: String, definition: String) -> String;
    fn create_index(name: String, table: String, definition: String) -> String;
    /// Turn `from <table> where <matches>` into a delete statement
    ///
    /// Placeholders not consumed by the match clause are passed along for dialects that
    /// support limiting the number of deleted rows. The bundled drivers delete all copies
    /// and re-insert the surplus.
    fn delete_limit(clause: String, fields: Box<dyn Iterator<Item = String>>) -> String;
    /// Condition that holds when the column equals the placeholder, NULL matching NULL
    fn compare_value(column: &str, value: String) -> String;
}

/// A group of tables fed from the same sources
pub trait DB {
    type Mechanics: DbMechanics;
    /// the rows of all tables, usually a [`Union`](enum.Union.html)
    type Record: 'static + DbRecordExt<Self::Mechanics>;

    /// driver name for log output
    fn name() -> &'static str;

    /// Offsets up to which the sources are reflected in the stored tables
    fn get_offsets(&mut self) -> Result<SourceOffsets>;
    /// Apply deltas (inserting or deleting as many copies as the multiplicity says) and
    /// store the offsets they bring the tables up to, in one transaction
    fn advance_offsets<C>(&mut self, offsets: &SourceOffsets, deltas: C) -> Result<()>
    where
        C: IntoIterator<Item = (Self::Record, isize)>;
}

/// One column of an export table
pub struct DbColumn {
    /// used unquoted in SQL
    pub name: &'static str,
    /// type and constraints as written in `create table`
    pub tpe: &'static str,
    /// filled by the database itself, no value is written
    pub exclude: bool,
    /// include in the (non-unique) index of the table; columns are indexed in the order given
    pub index: bool,
}

/// A row type with its own table
///
/// ```rust
/// use oee_data_flow::db::{DbColumn, DbMechanics, DbRecord, SqliteDbMechanics};
///
/// struct Scrap { machine: String, units: i64 }
///
/// static SCRAP: &[DbColumn] = &[
///     DbColumn { name: "machine", tpe: "text", exclude: false, index: true },
///     DbColumn { name: "units", tpe: "bigint not null", exclude: false, index: false },
/// ];
///
/// impl DbRecord<SqliteDbMechanics> for Scrap {
///     fn table_version() -> i32 { 1 }
///     fn table_name() -> &'static str { "scrap" }
///     fn columns() -> &'static [DbColumn] { SCRAP }
///     fn values(&self) -> Vec<<SqliteDbMechanics as DbMechanics>::SqlValue> {
///         vec![Box::new(self.machine.clone()), Box::new(self.units)]
///     }
/// }
/// ```
pub trait DbRecord<D: DbMechanics>: Sized {
    /// bump to have the table dropped and recomputed, starting at 1
    fn table_version() -> i32;
    /// unprefixed table name
    fn table_name() -> &'static str;
    fn columns() -> &'static [DbColumn];
    /// one value per non-excluded column, in column order
    fn values(&self) -> Vec<D::SqlValue>;
}

/// The SQL a driver needs for a [`Union`](enum.Union.html) of row types
pub trait DbRecordExt<D: DbMechanics>: Sized {
    /// query yielding `(table_name, version)` of the recorded tables
    fn select_table_versions(db: &D) -> String;
    fn table_versions(db: &D) -> BTreeMap<String, i32>;
    /// Statements that bring the schema up to date, empty if `stored` already matches
    fn migrate(db: &D, stored: &BTreeMap<String, i32>) -> Vec<String>;

    fn offsets_table_name(db: &D) -> String;
    /// query yielding `(source, offset)` pairs
    fn select_offsets(db: &D) -> String;
    /// statement taking source and offset, replacing a previous offset of the source
    fn upsert_offset(db: &D) -> String;

    fn insert_record(db: &D) -> Vec<(&'static str, String)>;
    fn delete_record(db: &D) -> Vec<(&'static str, String)>;
    /// the row's table and its column values
    fn values(&self) -> (&'static str, Vec<D::SqlValue>);
}

/// `plant1` becomes `plant1_`, the empty prefix stays empty
fn join_prefix(prefix: String) -> String {
    if prefix.is_empty() {
        prefix
    } else {
        format!("{}_", prefix)
    }
}

/// Statement creating the table that records table versions
pub fn create_schema_versions<D: DbMechanics>() -> String {
    D::create_table(
        SCHEMA_VERSIONS_TABLE_NAME.to_owned(),
        "table_name text, version int not null".to_owned(),
    )
}

/// Rows of up to five tables that are derived from the same sources
///
/// All variants share one offsets table. Unused variants default to `()`, which has no
/// table. Only the union implements [`DbRecordExt`](trait.DbRecordExt.html); a single row
/// type is lifted into `Union<T>` with `From`.
#[derive(Clone, Debug, Serialize, Deserialize, Abomonation, PartialOrd, Ord, PartialEq, Eq)]
pub enum Union<T1, T2 = (), T3 = (), T4 = (), T5 = ()> {
    T1(T1),
    T2(T2),
    T3(T3),
    T4(T4),
    T5(T5),
}

impl<T> From<T> for Union<T> {
    fn from(t: T) -> Self {
        Union::T1(t)
    }
}

/// Description of one table of a union
struct Table {
    name: &'static str,
    version: i32,
    columns: &'static [DbColumn],
}

impl Table {
    fn of<D: DbMechanics, T: DbRecord<D>>() -> Self {
        Self {
            name: T::table_name(),
            version: T::table_version(),
            columns: T::columns(),
        }
    }

    fn written_columns(&self) -> impl Iterator<Item = &DbColumn> {
        self.columns.iter().filter(|col| !col.exclude)
    }
}

impl<T1, T2, T3, T4, T5> Union<T1, T2, T3, T4, T5> {
    fn tables<D>() -> Vec<Table>
    where
        D: DbMechanics,
        T1: DbRecord<D>,
        T2: DbRecord<D>,
        T3: DbRecord<D>,
        T4: DbRecord<D>,
        T5: DbRecord<D>,
    {
        vec![
            Table::of::<D, T1>(),
            Table::of::<D, T2>(),
            Table::of::<D, T3>(),
            Table::of::<D, T4>(),
            Table::of::<D, T5>(),
        ]
        .into_iter()
        .filter(|table| !table.name.is_empty())
        .collect()
    }
}

impl<D, T1, T2, T3, T4, T5> DbRecordExt<D> for Union<T1, T2, T3, T4, T5>
where
    D: DbMechanics,
    T1: DbRecord<D> + 'static,
    T2: DbRecord<D> + 'static,
    T3: DbRecord<D> + 'static,
    T4: DbRecord<D> + 'static,
    T5: DbRecord<D> + 'static,
{
    fn select_table_versions(db: &D) -> String {
        let names = Self::tables::<D>()
            .iter()
            .map(|table| format!("'{}'", db.table_name(table.name)))
            .collect::<Vec<_>>();
        format!(
            "select table_name, version from {} where table_name in ({})",
            SCHEMA_VERSIONS_TABLE_NAME,
            names.join(",")
        )
    }

    fn table_versions(db: &D) -> BTreeMap<String, i32> {
        Self::tables::<D>()
            .into_iter()
            .map(|table| (db.table_name(table.name), table.version))
            .collect()
    }

    fn migrate(db: &D, stored: &BTreeMap<String, i32>) -> Vec<String> {
        if *stored == Self::table_versions(db) {
            return vec![];
        }
        let tables = Self::tables::<D>();
        let offsets = Self::offsets_table_name(db);

        let mut stmts = vec![format!("drop table if exists {}", offsets)];
        for table in &tables {
            let name = db.table_name(table.name);
            stmts.push(format!(
                "delete from {} where table_name = '{}'",
                SCHEMA_VERSIONS_TABLE_NAME, name
            ));
            stmts.push(format!(
                "insert into {} values ('{}', {})",
                SCHEMA_VERSIONS_TABLE_NAME, name, table.version
            ));
            stmts.push(format!("drop table if exists {}", name));
        }
        stmts.push(D::create_table(
            offsets,
            "source text primary key, offset_ bigint not null".to_owned(),
        ));
        for table in &tables {
            let name = db.table_name(table.name);
            let definition = table
                .columns
                .iter()
                .map(|col| format!("{} {}", col.name, col.tpe))
                .collect::<Vec<_>>()
                .join(", ");
            stmts.push(D::create_table(name.clone(), definition));

            let indexed = table
                .columns
                .iter()
                .filter(|col| col.index)
                .map(|col| col.name)
                .collect::<Vec<_>>();
            if !indexed.is_empty() {
                stmts.push(D::create_index(
                    format!("{}_index", name),
                    name,
                    indexed.join(", "),
                ));
            }
        }
        stmts
    }

    fn offsets_table_name(db: &D) -> String {
        format!(
            "{}_{}",
            db.table_name(T1::table_name()),
            OFFSETS_TABLE_SUFFIX
        )
    }

    fn select_offsets(db: &D) -> String {
        format!("select source, offset_ from {}", Self::offsets_table_name(db))
    }

    fn upsert_offset(db: &D) -> String {
        let holes = D::field_iter().take(2).collect::<Vec<_>>();
        format!(
            "insert into {} (source, offset_) values ({}) \
            on conflict(source) do update set offset_ = excluded.offset_",
            Self::offsets_table_name(db),
            holes.join(", ")
        )
    }

    fn insert_record(db: &D) -> Vec<(&'static str, String)> {
        Self::tables::<D>()
            .into_iter()
            .map(|table| {
                let columns = table.written_columns().map(|col| col.name).collect::<Vec<_>>();
                let holes = D::field_iter().take(columns.len()).collect::<Vec<_>>();
                let sql = format!(
                    "insert into {} ({}) values ({})",
                    db.table_name(table.name),
                    columns.join(", "),
                    holes.join(", ")
                );
                (table.name, sql)
            })
            .collect()
    }

    fn delete_record(db: &D) -> Vec<(&'static str, String)> {
        Self::tables::<D>()
            .into_iter()
            .map(|table| {
                let mut fields = D::field_iter();
                let matches = table
                    .written_columns()
                    .zip(&mut fields)
                    .map(|(col, field)| D::compare_value(col.name, field))
                    .collect::<Vec<_>>();
                let clause = format!(
                    "from {} where {}",
                    db.table_name(table.name),
                    matches.join(" and ")
                );
                (table.name, D::delete_limit(clause, fields))
            })
            .collect()
    }

    fn values(&self) -> (&'static str, Vec<D::SqlValue>) {
        match self {
            Union::T1(row) => (T1::table_name(), row.values()),
            Union::T2(row) => (T2::table_name(), row.values()),
            Union::T3(row) => (T3::table_name(), row.values()),
            Union::T4(row) => (T4::table_name(), row.values()),
            Union::T5(row) => (T5::table_name(), row.values()),
        }
    }
}

/// Filler for unused union variants, without a table
impl<D: DbMechanics> DbRecord<D> for () {
    fn table_version() -> i32 {
        0
    }
    fn table_name() -> &'static str {
        ""
    }
    fn columns() -> &'static [DbColumn] {
        &[]
    }
    fn values(&self) -> Vec<D::SqlValue> {
        vec![]
    }
}
