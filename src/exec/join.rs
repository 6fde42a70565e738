//! Sort-merge joins.
//!
//! Both sides are sorted by the join key (externally, so neither side needs
//! to fit in memory), then merged with two cursors. Runs of equal keys are
//! gathered on both sides and their cross product emitted; `how` decides
//! what happens to keys present on one side only.

use std::cmp::Ordering;

use crate::error::Result;
use crate::exec::batch::BatchIter;
use crate::exec::sort::{sort_batches, SortKey, SortedStream, MERGE_BATCH_ROWS};
use crate::frame::{DataFrame, FrameBuilder, Value};
use crate::plan::JoinHow;
use crate::schema::Schema;

/// A buffered row cursor over a sorted stream.
struct RowCursor {
    stream: SortedStream,
    batch: Option<DataFrame>,
    row: usize,
}

impl RowCursor {
    fn new(stream: SortedStream) -> Result<Self> {
        let mut cursor = Self {
            stream,
            batch: None,
            row: 0,
        };
        cursor.refill()?;
        Ok(cursor)
    }

    fn refill(&mut self) -> Result<()> {
        self.batch = self.stream.next_batch()?;
        self.row = 0;
        Ok(())
    }

    fn peek_key(&self, key_columns: &[usize]) -> Result<Option<Vec<Value>>> {
        match &self.batch {
            None => Ok(None),
            Some(batch) => {
                let key = key_columns
                    .iter()
                    .map(|column| batch.value(self.row, *column))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Some(key))
            }
        }
    }

    fn take_row(&mut self) -> Result<Option<Vec<Value>>> {
        let row = match &self.batch {
            None => return Ok(None),
            Some(batch) => batch.row(self.row)?,
        };
        self.row += 1;
        if self
            .batch
            .as_ref()
            .map(|batch| self.row >= batch.num_rows())
            .unwrap_or(false)
        {
            self.refill()?;
        }
        Ok(Some(row))
    }

    /// All consecutive rows whose key equals `key`.
    fn take_group(&mut self, key: &[Value], key_columns: &[usize]) -> Result<Vec<Vec<Value>>> {
        let mut group = vec![];
        while let Some(next) = self.peek_key(key_columns)? {
            if compare_join_keys(&next, key) != Ordering::Equal {
                break;
            }
            group.push(self.take_row()?.expect("peeked row exists"));
        }
        Ok(group)
    }
}

fn compare_join_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ordering = x.cmp_total(y);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Sort-merge join of two batch streams.
pub(crate) struct JoinExec {
    left: RowCursor,
    right: RowCursor,
    left_keys: Vec<usize>,
    right_keys: Vec<usize>,
    /// Positions of non-key columns on the right, in output order.
    right_carry: Vec<usize>,
    how: JoinHow,
    output_schema: Schema,
    pending: Vec<Vec<Value>>,
    done: bool,
}

impl JoinExec {
    /// Sorts both inputs by the key and positions the merge cursors.
    pub fn new(
        left: &mut dyn BatchIter,
        right: &mut dyn BatchIter,
        on: &[String],
        how: JoinHow,
        output_schema: Schema,
    ) -> Result<Self> {
        let left_schema = left.schema().clone();
        let right_schema = right.schema().clone();
        let left_keys = on
            .iter()
            .map(|key| left_schema.index_of(key))
            .collect::<Result<Vec<_>>>()?;
        let right_keys = on
            .iter()
            .map(|key| right_schema.index_of(key))
            .collect::<Result<Vec<_>>>()?;
        let right_carry = (0..right_schema.len())
            .filter(|i| !right_keys.contains(i))
            .collect();

        let sort_keys = |columns: &[usize]| {
            columns
                .iter()
                .map(|column| SortKey {
                    column: *column,
                    descending: false,
                })
                .collect::<Vec<_>>()
        };
        let left_sorted = sort_batches(left, sort_keys(&left_keys), None)?;
        let right_sorted = sort_batches(right, sort_keys(&right_keys), None)?;

        Ok(Self {
            left: RowCursor::new(left_sorted)?,
            right: RowCursor::new(right_sorted)?,
            left_keys,
            right_keys,
            right_carry,
            how,
            output_schema,
            pending: vec![],
            done: false,
        })
    }

    fn emit(&mut self, left: Option<&[Value]>, right: Option<&[Value]>, left_width: usize) {
        let mut row = Vec::with_capacity(self.output_schema.len());
        match left {
            Some(values) => row.extend_from_slice(values),
            None => row.extend(std::iter::repeat(Value::Null).take(left_width)),
        }
        match right {
            Some(values) => {
                for i in &self.right_carry {
                    row.push(values[*i].clone());
                }
            }
            None => row.extend(std::iter::repeat(Value::Null).take(self.right_carry.len())),
        }
        self.pending.push(row);
    }

    /// Advances the merge until some rows are pending or both sides end.
    fn fill_pending(&mut self) -> Result<()> {
        let left_width = self.output_schema.len() - self.right_carry.len();
        while self.pending.is_empty() && !self.done {
            let left_key = self.left.peek_key(&self.left_keys)?;
            let right_key = self.right.peek_key(&self.right_keys)?;
            match (left_key, right_key) {
                (None, None) => self.done = true,
                (Some(key), None) => {
                    let rows = self.left.take_group(&key, &self.left_keys)?;
                    if matches!(self.how, JoinHow::Left | JoinHow::Outer) {
                        for row in rows {
                            self.emit(Some(&row), None, left_width);
                        }
                    }
                }
                (None, Some(key)) => {
                    let rows = self.right.take_group(&key, &self.right_keys)?;
                    if matches!(self.how, JoinHow::Right | JoinHow::Outer) {
                        for row in rows {
                            self.emit_right_only(&row, &key, left_width);
                        }
                    }
                }
                (Some(left_key), Some(right_key)) => {
                    match compare_join_keys(&left_key, &right_key) {
                        Ordering::Equal => {
                            let left_rows = self.left.take_group(&left_key, &self.left_keys)?;
                            let right_rows =
                                self.right.take_group(&right_key, &self.right_keys)?;
                            for left_row in &left_rows {
                                for right_row in &right_rows {
                                    self.emit(Some(left_row), Some(right_row), left_width);
                                }
                            }
                        }
                        Ordering::Less => {
                            let rows = self.left.take_group(&left_key, &self.left_keys)?;
                            if matches!(self.how, JoinHow::Left | JoinHow::Outer) {
                                for row in rows {
                                    self.emit(Some(&row), None, left_width);
                                }
                            }
                        }
                        Ordering::Greater => {
                            let rows = self.right.take_group(&right_key, &self.right_keys)?;
                            if matches!(self.how, JoinHow::Right | JoinHow::Outer) {
                                for row in rows {
                                    self.emit_right_only(&row, &right_key, left_width);
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// A right row with no left match: nulls on the left except the key
    /// columns, which carry the right side's key values.
    fn emit_right_only(&mut self, right_row: &[Value], key: &[Value], left_width: usize) {
        let mut left = vec![Value::Null; left_width];
        for (k, key_column) in self.left_keys.iter().enumerate() {
            left[*key_column] = key[k].clone();
        }
        self.emit(Some(&left), Some(right_row), left_width);
    }
}

impl BatchIter for JoinExec {
    fn schema(&self) -> &Schema {
        &self.output_schema
    }

    fn next_batch(&mut self) -> Result<Option<DataFrame>> {
        let mut builder = FrameBuilder::new(self.output_schema.clone());
        while builder.num_rows() < MERGE_BATCH_ROWS {
            if self.pending.is_empty() {
                self.fill_pending()?;
            }
            if self.pending.is_empty() {
                break;
            }
            // preserve emit order
            let row = self.pending.remove(0);
            builder.push_row(&row)?;
        }
        if builder.num_rows() == 0 {
            Ok(None)
        } else {
            Ok(Some(builder.finish()))
        }
    }
}
