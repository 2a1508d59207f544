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
use super::{create_schema_versions, join_prefix, DbMechanics, DbRecordExt, SourceOffsets, DB};
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OpenFlags, Statement, ToSql, NO_PARAMS};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::{cell::RefCell, fmt::Debug, marker::PhantomData};
use tracing::{debug, field, info, instrument, trace_span};

#[cfg(test)]
use rusqlite::types::Value;

/// Export target in a Sqlite3 file, via rusqlite
///
/// Use `":memory:"` as database name for a throw-away in-memory database.
pub struct SqliteDB<T> {
    conn: RefCell<Connection>,
    mechanics: SqliteDbMechanics,
    ph: PhantomData<T>,
}

impl<T: DbRecordExt<SqliteDbMechanics> + Debug + 'static> SqliteDB<T> {
    pub fn new(prefix: impl Into<String>, db_name: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = trace_span!("connect").in_scope(|| -> Result<_> {
            let conn = Connection::open_with_flags(PathBuf::from(db_name), flags)?;

            // answers with the journal mode now in effect; in-memory databases cannot use WAL
            conn.query_row("PRAGMA journal_mode = WAL;", NO_PARAMS, |row| {
                match row.get_raw(0).as_str() {
                    Ok("wal") | Ok("memory") => Ok(()),
                    _ => Err(rusqlite::Error::InvalidQuery),
                }
            })?;
            // WAL keeps NORMAL crash-safe
            conn.execute("PRAGMA synchronous = NORMAL;", NO_PARAMS)?;

            debug!(db_name, "new connection");
            Ok(conn)
        })?;

        conn.execute(&create_schema_versions::<SqliteDbMechanics>(), NO_PARAMS)?;

        let ret = Self {
            conn: conn.into(),
            mechanics: SqliteDbMechanics::with_prefix(prefix),
            ph: PhantomData,
        };
        let mut borrow = ret.conn.borrow_mut();
        let tx = borrow.transaction()?;

        let stored = tx
            .prepare(T::select_table_versions(&ret.mechanics).as_str())?
            .query(NO_PARAMS)?
            .mapped(|row| Ok((row.get::<_, String>(0)?, row.get::<_, i32>(1)?)))
            .collect::<Result<BTreeMap<String, i32>, rusqlite::Error>>()?;
        debug!(versions = ?stored, "stored table versions");

        let migration = T::migrate(&ret.mechanics, &stored);
        if !migration.is_empty() {
            info!(from = ?stored, to = ?T::table_versions(&ret.mechanics), "recreating tables");
            for stmt in migration {
                tx.execute(&stmt, NO_PARAMS)?;
            }
        }

        tx.commit()?;
        info!("initialization complete");
        drop(borrow);

        Ok(ret)
    }

    /// All rows of the given (unprefixed) table, in storage order
    #[cfg(test)]
    pub(crate) fn get_records(&mut self, table: &str) -> Result<Vec<Vec<Value>>> {
        let conn = self.conn.borrow();
        let query = format!("select * from {} order by rowid", self.mechanics.table_name(table));
        let mut select = conn.prepare(&query)?;
        let width = select.column_count();
        let rows = select
            .query_map(NO_PARAMS, |row| (0..width).map(|idx| row.get::<_, Value>(idx)).collect())?
            .collect::<Result<Vec<Vec<Value>>, rusqlite::Error>>()?;
        Ok(rows)
    }
}

/// Sqlite3 dialect: `?` placeholders, `is` comparison in deletes
pub struct SqliteDbMechanics {
    prefix: String,
}

impl SqliteDbMechanics {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: join_prefix(prefix.into()),
        }
    }
}

impl DbMechanics for SqliteDbMechanics {
    type SqlValue = Box<dyn ToSql>;

    fn table_prefix(&self) -> &str {
        &self.prefix
    }
    fn field_iter() -> Box<dyn Iterator<Item = String>> {
        Box::new(std::iter::repeat("?".to_owned()))
    }
    fn create_table(name: String, definition: String) -> String {
        format!("create table if not exists {} ({})", name, definition)
    }
    fn create_index(name: String, table: String, definition: String) -> String {
        format!(
            "create index if not exists {} on {} ({})",
            name, table, definition
        )
    }
    fn delete_limit(clause: String, _fields: Box<dyn Iterator<Item = String>>) -> String {
        format!("delete {}", clause)
    }
    fn compare_value(column: &str, value: String) -> String {
        format!("{} is {}", column, value)
    }
}

fn statements<'a>(
    tx: &'a rusqlite::Transaction<'_>,
    stmts: Vec<(&'static str, String)>,
) -> Result<BTreeMap<&'static str, Statement<'a>>> {
    stmts
        .into_iter()
        .map(|(table, sql)| Ok((table, tx.prepare(&sql)?)))
        .collect()
}

fn prepared<'a, 'b>(
    stmts: &'b mut BTreeMap<&'static str, Statement<'a>>,
    table: &str,
) -> Result<&'b mut Statement<'a>> {
    stmts
        .get_mut(table)
        .ok_or_else(|| anyhow!("no statement prepared for table {}", table))
}

impl<T: DbRecordExt<SqliteDbMechanics> + Debug + 'static> DB for SqliteDB<T> {
    type Mechanics = SqliteDbMechanics;
    type Record = T;

    fn name() -> &'static str {
        "Sqlite3(rusqlite)"
    }

    #[instrument(skip(self), level = "trace")]
    fn get_offsets(&mut self) -> Result<SourceOffsets> {
        let mut borrow = self.conn.borrow_mut();
        let tx = borrow.transaction()?;
        let result = tx
            .prepare(T::select_offsets(&self.mechanics).as_str())?
            .query(NO_PARAMS)?
            .mapped(|row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .collect::<Result<SourceOffsets, rusqlite::Error>>()?;
        tx.commit()?;
        Ok(result)
    }

    #[instrument(skip(self, offsets, deltas), level = "trace")]
    fn advance_offsets<C>(&mut self, offsets: &SourceOffsets, deltas: C) -> Result<()>
    where
        C: IntoIterator<Item = (T, isize)>,
    {
        let mut borrow = self.conn.borrow_mut();
        let tx = borrow.transaction()?;

        trace_span!("writing offsets").in_scope(|| -> Result<_> {
            let mut offset = tx.prepare(T::upsert_offset(&self.mechanics).as_str())?;
            for (source, o) in offsets.iter() {
                offset.execute(params![source, o])?;
            }
            Ok(())
        })?;

        let mut insert = statements(&tx, T::insert_record(&self.mechanics))?;
        let mut delete = statements(&tx, T::delete_record(&self.mechanics))?;

        let mut written = 0;
        let span = trace_span!("writing records", deltas = field::Empty);
        let guard = span.enter();
        for (record, mult) in deltas {
            written += 1;
            let copies = if mult < 0 {
                // rusqlite is built without DELETE … LIMIT: remove every match, re-insert the surplus
                let (table, values) = record.values();
                prepared(&mut delete, table)?.execute(values)? as isize + mult
            } else {
                mult
            };
            for _ in 0..copies {
                let (table, values) = record.values();
                prepared(&mut insert, table)?.execute(values)?;
            }
        }
        span.record("deltas", &written);
        drop(guard);
        drop(insert);
        drop(delete);

        tx.commit()?;
        debug!(deltas = written, sources = offsets.len(), "done writing");
        Ok(())
    }
}
