//! Streaming distinct over row fingerprints.

use std::collections::HashSet;

use xxhash_rust::xxh64::xxh64;

use crate::error::Result;
use crate::exec::batch::{BatchIter, DynBatchIter};
use crate::exec::groupby::pack_row_key;
use crate::frame::DataFrame;
use crate::schema::Schema;

const FINGERPRINT_SEED: u64 = 0;

/// Keeps the first occurrence of every distinct row.
///
/// Rows are identified by a 64-bit xxh64 fingerprint of their packed key
/// bytes over the projected subset; two distinct rows colliding on the
/// fingerprint would be deduplicated, which at 64 bits is negligible for
/// realistic row counts.
pub(crate) struct DistinctExec {
    input: DynBatchIter,
    columns: Vec<usize>,
    seen: HashSet<u64>,
    scratch: Vec<u8>,
}

impl DistinctExec {
    pub fn new(input: DynBatchIter, subset: Option<&[String]>) -> Result<Self> {
        let schema = input.schema();
        let columns = match subset {
            Some(names) => names
                .iter()
                .map(|name| schema.index_of(name))
                .collect::<Result<Vec<_>>>()?,
            None => (0..schema.len()).collect(),
        };
        Ok(Self {
            input,
            columns,
            seen: HashSet::new(),
            scratch: vec![],
        })
    }
}

impl BatchIter for DistinctExec {
    fn schema(&self) -> &Schema {
        self.input.schema()
    }

    fn next_batch(&mut self) -> Result<Option<DataFrame>> {
        loop {
            let batch = match self.input.next_batch()? {
                Some(batch) => batch,
                None => return Ok(None),
            };
            let mut keep = Vec::with_capacity(batch.num_rows());
            for row in 0..batch.num_rows() {
                self.scratch.clear();
                pack_row_key(&batch, row, &self.columns, &mut self.scratch)?;
                if self.seen.insert(xxh64(&self.scratch, FINGERPRINT_SEED)) {
                    keep.push(row);
                }
            }
            if keep.len() == batch.num_rows() {
                return Ok(Some(batch));
            }
            if !keep.is_empty() {
                return Ok(Some(batch.gather(&keep)?));
            }
            // every row was a duplicate; pull the next batch
        }
    }
}
