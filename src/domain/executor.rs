//! Query execution over opened files.
//!
//! Every strategy shares one driving loop: read a record of the first file,
//! walk the join chain, apply `where`, then hand the matched row to one of
//! three modes:
//!
//! - streaming: distinct check, evaluate, emit;
//! - ordered: record the sort key and every file's record position, then
//!   sort and replay the positions in a second pass;
//! - grouped: fold into the group table, finalize, filter by `having`,
//!   sort, emit.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::ast::{JoinKind, Query};
use crate::domain::engine::{CancelToken, QueryStats};
use crate::domain::error::QueryError;
use crate::domain::eval::{Evaluator, GroupAccess};
use crate::domain::group::GroupTable;
use crate::domain::join::JoinIndex;
use crate::domain::progress::{Progress, Ticker};
use crate::domain::rewrite::output_columns;
use crate::domain::schema::FileData;
use crate::domain::value::Value;
use crate::ports::row_sink::RowSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Streaming,
    Ordered,
    Grouped,
}

/// Where a file's current record came from, so it can be restored.
#[derive(Debug, Clone, Copy)]
enum RowPosition {
    Offset(u64),
    Entry(usize),
    Null,
}

pub struct Executor<'a> {
    query: &'a Query,
    files: Vec<FileData>,
    evaluator: Evaluator,
    cancel: &'a CancelToken,
    progress: Arc<Progress>,
    interval: Duration,
    mode: Mode,
    indexes: Vec<JoinIndex>,
    positions: Vec<RowPosition>,
    seen: BTreeSet<Value>,
    ordered: Vec<(Value, Vec<RowPosition>)>,
    groups: GroupTable,
    emitted: usize,
    done: bool,
}

impl<'a> Executor<'a> {
    pub fn new(
        query: &'a Query,
        files: Vec<FileData>,
        evaluator: Evaluator,
        cancel: &'a CancelToken,
        interval: Duration,
    ) -> Self {
        let mode = if query.grouping {
            Mode::Grouped
        } else if query.order_by.is_some() {
            Mode::Ordered
        } else {
            Mode::Streaming
        };
        let width = files.len();
        Self {
            query,
            files,
            evaluator,
            cancel,
            progress: Arc::new(Progress::default()),
            interval,
            mode,
            indexes: Vec::with_capacity(query.joins.len()),
            positions: vec![RowPosition::Null; width],
            seen: BTreeSet::new(),
            ordered: Vec::new(),
            groups: GroupTable::new(query.group_by.len(), query.group_width),
            emitted: 0,
            done: false,
        }
    }

    /// Execute the query, writing the header and every result row to `sink`.
    pub fn run(mut self, sink: &mut dyn RowSink) -> Result<QueryStats, QueryError> {
        tracing::debug!(mode = ?self.mode, joins = self.query.joins.len(), "executing query");
        sink.header(&output_columns(self.query))?;

        let mut ticker = Ticker::start("scan", Arc::clone(&self.progress), self.interval);
        let query = self.query;
        for join in &query.joins {
            if self.cancel.is_cancelled() {
                break;
            }
            let index = JoinIndex::build(join, &mut self.files, &mut self.evaluator, self.cancel)?;
            self.indexes.push(index);
        }
        if !self.cancel.is_cancelled() {
            self.scan(sink)?;
        }
        ticker.stop();

        if !self.cancel.is_cancelled() {
            let mut ticker = Ticker::start("output", Arc::clone(&self.progress), self.interval);
            match self.mode {
                Mode::Streaming => {}
                Mode::Ordered => self.replay(sink)?,
                Mode::Grouped => self.finish_groups(sink)?,
            }
            ticker.stop();
        }
        sink.finish()?;

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            tracing::warn!(rows = self.emitted, "query cancelled");
        }
        Ok(QueryStats {
            row_count: self.emitted,
            cancelled,
        })
    }

    fn scan(&mut self, sink: &mut dyn RowSink) -> Result<(), QueryError> {
        self.files[0].rewind()?;
        while !self.done && !self.cancel.is_cancelled() {
            if !self.files[0].reader.read()? {
                break;
            }
            self.progress.add_scanned(1);
            self.positions[0] = RowPosition::Offset(self.files[0].reader.offset());
            self.join_level(0, sink)?;
        }
        if self.mode == Mode::Ordered {
            self.files[0].reader.prepare_reread();
        }
        Ok(())
    }

    fn join_level(&mut self, level: usize, sink: &mut dyn RowSink) -> Result<(), QueryError> {
        let query = self.query;
        let Some(join) = query.joins.get(level) else {
            return self.matched(sink);
        };
        let key = self
            .evaluator
            .eval(&join.driving, &self.files, &mut GroupAccess::None)?;
        let run = self.indexes[level].probe(&key);

        if run.is_empty() {
            if join.kind == JoinKind::Left {
                self.files[join.file].reader.set_null_row();
                self.positions[join.file] = RowPosition::Null;
                self.join_level(level + 1, sink)?;
            }
            return Ok(());
        }
        for entry in run {
            if self.done || self.cancel.is_cancelled() {
                break;
            }
            self.indexes[level].restore(entry, &mut self.files[join.file].reader)?;
            self.positions[join.file] = RowPosition::Entry(entry);
            self.join_level(level + 1, sink)?;
        }
        Ok(())
    }

    fn matched(&mut self, sink: &mut dyn RowSink) -> Result<(), QueryError> {
        let query = self.query;
        if let Some(filter) = &query.filter {
            if !self
                .evaluator
                .test(filter, &self.files, &mut GroupAccess::None)?
            {
                return Ok(());
            }
        }
        match self.mode {
            Mode::Streaming => self.emit_current(sink),
            Mode::Grouped => self.accumulate(),
            Mode::Ordered => {
                let key = match &query.order_by {
                    Some(order) => {
                        self.evaluator
                            .eval(&order.expr, &self.files, &mut GroupAccess::None)?
                    }
                    None => Value::Null,
                };
                self.ordered.push((key, self.positions.clone()));
                Ok(())
            }
        }
    }

    /// Distinct check, then evaluate and emit the current records.
    fn emit_current(&mut self, sink: &mut dyn RowSink) -> Result<(), QueryError> {
        let query = self.query;
        if let Some(expr) = &query.distinct {
            let value = self
                .evaluator
                .eval(expr, &self.files, &mut GroupAccess::None)?;
            if !self.seen.insert(value) {
                return Ok(());
            }
        }
        let mut row = Vec::with_capacity(query.selections.len());
        for selection in query.visible() {
            row.push(
                self.evaluator
                    .eval(&selection.expr, &self.files, &mut GroupAccess::None)?,
            );
        }
        self.emit(sink, &row)
    }

    fn emit(&mut self, sink: &mut dyn RowSink, row: &[Value]) -> Result<(), QueryError> {
        if self.limit_reached() {
            self.done = true;
            return Ok(());
        }
        sink.row(row)?;
        self.emitted += 1;
        self.progress.add_result();
        if self.limit_reached() {
            self.done = true;
        }
        Ok(())
    }

    fn limit_reached(&self) -> bool {
        self.query.limit.is_some_and(|limit| self.emitted >= limit)
    }

    // ---- grouping ----

    fn accumulate(&mut self) -> Result<(), QueryError> {
        let query = self.query;
        let mut keys = Vec::with_capacity(query.group_by.len());
        for expr in &query.group_by {
            keys.push(
                self.evaluator
                    .eval(expr, &self.files, &mut GroupAccess::None)?,
            );
        }
        let cap = if query.order_by.is_none() {
            query.limit
        } else {
            None
        };
        let Some(acc) = self.groups.entry(keys, cap) else {
            return Ok(());
        };
        for selection in &query.selections {
            match selection.group_slot {
                Some(slot) => {
                    let value =
                        self.evaluator
                            .eval(&selection.expr, &self.files, &mut GroupAccess::None)?;
                    if let Some(cell) = acc.get_mut(slot) {
                        *cell = value;
                    }
                }
                None => self.evaluator.accumulate(&selection.expr, &self.files, acc)?,
            }
        }
        Ok(())
    }

    fn finish_groups(&mut self, sink: &mut dyn RowSink) -> Result<(), QueryError> {
        let query = self.query;
        let groups = std::mem::replace(&mut self.groups, GroupTable::new(0, 0));
        tracing::debug!(groups = groups.len(), "finalizing groups");

        let mut rows = Vec::with_capacity(groups.len());
        for acc in groups.into_rows() {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let mut output: Vec<Value> = Vec::with_capacity(query.selections.len());
            for selection in &query.selections {
                let value = match selection.group_slot {
                    Some(slot) => acc.get(slot).cloned().unwrap_or(Value::Null),
                    None => self.evaluator.eval(
                        &selection.expr,
                        &self.files,
                        &mut GroupAccess::Finalize {
                            acc: &acc,
                            output: &output,
                        },
                    )?,
                };
                output.push(value);
            }
            if let Some(having) = &query.having {
                let keep = self.evaluator.test(
                    having,
                    &self.files,
                    &mut GroupAccess::Finalize {
                        acc: &acc,
                        output: &output,
                    },
                )?;
                if !keep {
                    continue;
                }
            }
            rows.push(output);
        }

        if let Some(order) = &query.order_by {
            if let Some(column) = order.selection {
                sort_by_key(&mut rows, |row| &row[column], order.ascending);
            }
        }
        for row in rows {
            if self.done || self.cancel.is_cancelled() {
                break;
            }
            let visible: Vec<Value> = row
                .into_iter()
                .zip(&query.selections)
                .filter(|(_, s)| !s.hidden)
                .map(|(v, _)| v)
                .collect();
            self.emit(sink, &visible)?;
        }
        Ok(())
    }

    // ---- ordered output ----

    fn replay(&mut self, sink: &mut dyn RowSink) -> Result<(), QueryError> {
        let ascending = self.query.order_by.as_ref().is_some_and(|o| o.ascending);
        let mut entries = std::mem::take(&mut self.ordered);
        sort_by_key(&mut entries, |(key, _)| key, ascending);
        tracing::debug!(rows = entries.len(), ascending, "replaying sorted rows");

        for (_, positions) in entries {
            if self.done || self.cancel.is_cancelled() {
                break;
            }
            self.restore(&positions)?;
            self.emit_current(sink)?;
        }
        Ok(())
    }

    fn restore(&mut self, positions: &[RowPosition]) -> Result<(), QueryError> {
        if let Some(RowPosition::Offset(offset)) = positions.first() {
            self.files[0].reader.read_at(*offset)?;
        }
        for (level, join) in self.query.joins.iter().enumerate() {
            let reader = &mut self.files[join.file].reader;
            match positions.get(join.file) {
                Some(RowPosition::Entry(entry)) => self.indexes[level].restore(*entry, reader)?,
                Some(RowPosition::Offset(offset)) => {
                    reader.read_at(*offset)?;
                }
                Some(RowPosition::Null) | None => reader.set_null_row(),
            }
        }
        Ok(())
    }
}

/// Stable sort on a value key; descending unless `ascending`. Equal keys
/// keep their input order either way.
fn sort_by_key<T>(items: &mut [T], key: impl Fn(&T) -> &Value, ascending: bool) {
    items.sort_by(|a, b| {
        let ordering = key(a).cmp(key(b));
        if ascending {
            ordering
        } else {
            ordering.reverse()
        }
    });
}
