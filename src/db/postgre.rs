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
use native_tls::TlsConnector;
use postgres::{fallible_iterator::FallibleIterator, types::ToSql, Client, Statement, Transaction};
use postgres_native_tls::MakeTlsConnector;
use std::collections::BTreeMap;
use std::{cell::RefCell, iter::empty, marker::PhantomData};
use tracing::{debug, field, info, instrument, trace_span};

/// Database driver for PostgreSQL, based on the postgres crate
///
/// The database name is a connection string like
/// `host=localhost user=postgres dbname=oee sslmode=prefer`.
pub struct PostgresDB<T> {
    conn: RefCell<Client>,
    mechanics: PostgresDbMechanics,
    ph: PhantomData<T>,
}

fn statements(
    tx: &mut Transaction<'_>,
    stmts: Vec<(&'static str, String)>,
) -> Result<BTreeMap<&'static str, Statement>> {
    stmts
        .into_iter()
        .map(|(table, sql)| Ok((table, tx.prepare(sql.as_str())?)))
        .collect()
}

fn prepared<'a>(stmts: &'a BTreeMap<&'static str, Statement>, table: &str) -> Result<&'a Statement> {
    stmts
        .get(table)
        .ok_or_else(|| anyhow!("no statement prepared for table {}", table))
}

impl<T: DbRecordExt<PostgresDbMechanics> + 'static> PostgresDB<T> {
    pub fn new(prefix: impl Into<String>, db_name: &str) -> Result<Self> {
        let tls_mode = MakeTlsConnector::new(TlsConnector::new()?);

        let conn = trace_span!("connect").in_scope(|| -> Result<_> {
            let ret = Client::connect(db_name, tls_mode)?;
            debug!("new connection");
            Ok(ret)
        })?;

        let ret = Self {
            conn: conn.into(),
            mechanics: PostgresDbMechanics::with_prefix(prefix),
            ph: PhantomData,
        };

        let mut borrow = ret.conn.borrow_mut();
        let mut tx = borrow.transaction()?;
        tx.execute(create_schema_versions::<PostgresDbMechanics>().as_str(), &[])?;
        let stored: BTreeMap<String, i32> = tx
            .query_raw(T::select_table_versions(&ret.mechanics).as_str(), empty())?
            .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
            .collect()?;
        debug!(versions = ?stored, "stored table versions");

        let migration = T::migrate(&ret.mechanics, &stored);
        if !migration.is_empty() {
            info!(from = ?stored, to = ?T::table_versions(&ret.mechanics), "recreating tables");
            for stmt in migration {
                tx.execute(stmt.as_str(), &[])?;
            }
        }

        tx.commit()?;
        info!("initialization complete");
        drop(borrow);

        Ok(ret)
    }

    /// `(text, bigint)` rows of a two-column table, sorted
    #[cfg(test)]
    fn get_records(&mut self, table: &str) -> Result<Vec<(String, i64)>> {
        let query = format!("select * from {} order by 1, 2", self.mechanics.table_name(table));
        let rows = self.conn.borrow_mut().query(query.as_str(), &[])?;
        Ok(rows.iter().map(|row| (row.get(0), row.get(1))).collect())
    }

    #[cfg(test)]
    fn clear_database(&mut self) -> Result<()> {
        let tables = ["test_record", "test_record_offsets"];
        for table in tables.iter() {
            let stmt = format!("delete from {}", self.mechanics.table_name(table));
            self.conn.borrow_mut().execute(stmt.as_str(), &[])?;
        }
        Ok(())
    }
}

/// PostgreSQL dialect: numbered placeholders, NULL-aware equality in deletes
pub struct PostgresDbMechanics {
    prefix: String,
}

impl PostgresDbMechanics {
    /// A non-empty prefix is joined to table names with `_`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: join_prefix(prefix.into()),
        }
    }
}

impl DbMechanics for PostgresDbMechanics {
    type SqlValue = Box<dyn ToSql + Sync>;

    fn table_prefix(&self) -> &str {
        &self.prefix
    }
    fn field_iter() -> Box<dyn Iterator<Item = String>> {
        Box::new((1..usize::MAX).map(|i| format!("${}", i)))
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
        format!(
            "( {column} = {value} or \
               (case when {column} is null and {value} is null then 1 else 0 end) = 1 )",
            column = column,
            value = value
        )
    }
}

impl<T: DbRecordExt<PostgresDbMechanics> + 'static> DB for PostgresDB<T> {
    type Mechanics = PostgresDbMechanics;
    type Record = T;

    fn name() -> &'static str {
        "PostgreSQL(postgres)"
    }

    #[instrument(skip(self), level = "trace")]
    fn get_offsets(&mut self) -> Result<SourceOffsets> {
        let mut borrow = self.conn.borrow_mut();
        let mut tx = borrow.transaction()?;
        let rows: Vec<(String, i64)> = tx
            .query_raw(T::select_offsets(&self.mechanics).as_str(), empty())?
            .map(|row| {
                let source: String = row.try_get(0)?;
                let offset: i64 = row.try_get(1)?;
                Ok((source, offset))
            })
            .collect()?;
        tx.commit()?;
        Ok(rows.into_iter().collect())
    }

    #[instrument(skip(self, offsets, deltas), level = "trace")]
    fn advance_offsets<C>(&mut self, offsets: &SourceOffsets, deltas: C) -> Result<()>
    where
        C: IntoIterator<Item = (T, isize)>,
    {
        let mut borrow = self.conn.borrow_mut();
        let mut tx = borrow.transaction()?;

        trace_span!("writing offsets").in_scope(|| -> Result<_> {
            let offset = tx.prepare(T::upsert_offset(&self.mechanics).as_str())?;
            for (source, o) in offsets.iter() {
                tx.execute(&offset, &[&source, &o])?;
            }
            Ok(())
        })?;

        let insert = statements(&mut tx, T::insert_record(&self.mechanics))?;
        let delete = statements(&mut tx, T::delete_record(&self.mechanics))?;

        let mut written = 0;
        let span = trace_span!("writing records", deltas = field::Empty);
        let guard = span.enter();
        for (record, mult) in deltas {
            written += 1;
            let (table, values) = record.values();
            let params = values.iter().map(|v| &**v).collect::<Vec<&(dyn ToSql + Sync)>>();
            let copies = if mult < 0 {
                tx.execute(prepared(&delete, table)?, &params)? as i64 + mult as i64
            } else {
                mult as i64
            };
            let insert = prepared(&insert, table)?;
            for _ in 0..copies {
                tx.execute(insert, &params)?;
            }
        }
        span.record("deltas", &written);
        drop(guard);

        tx.commit()?;
        debug!(deltas = written, sources = offsets.len(), "done writing");
        Ok(())
    }
}
