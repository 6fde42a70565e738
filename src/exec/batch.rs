#[cfg(test)]
use std::collections::VecDeque;

use crate::error::Result;
use crate::frame::DataFrame;
use crate::schema::Schema;

/// A pull-based stream of owned batches.
///
/// Operators between the scan and the first blocking operator are expressed
/// as adapters over this trait; blocking operators drain their input and
/// re-emit batches from their own state.
pub(crate) trait BatchIter {
    fn schema(&self) -> &Schema;
    fn next_batch(&mut self) -> Result<Option<DataFrame>>;
}

/// [`BatchIter`] erased behind a box, so operators compose dynamically.
pub(crate) struct DynBatchIter {
    inner: Box<dyn BatchIter>,
}

impl DynBatchIter {
    pub fn new<I: BatchIter + 'static>(iter: I) -> Self {
        Self {
            inner: Box::new(iter),
        }
    }
}

impl BatchIter for DynBatchIter {
    fn schema(&self) -> &Schema {
        self.inner.schema()
    }

    fn next_batch(&mut self) -> Result<Option<DataFrame>> {
        self.inner.next_batch()
    }
}

/// Emits one already-materialized frame, then ends.
pub(crate) struct OnceIter {
    schema: Schema,
    frame: Option<DataFrame>,
}

impl OnceIter {
    pub fn new(frame: DataFrame) -> Self {
        Self {
            schema: frame.schema().clone(),
            frame: Some(frame),
        }
    }
}

impl BatchIter for OnceIter {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn next_batch(&mut self) -> Result<Option<DataFrame>> {
        Ok(self.frame.take())
    }
}

/// Emits a queue of frames in order.
#[cfg(test)]
pub(crate) struct VecIter {
    schema: Schema,
    frames: VecDeque<DataFrame>,
}

#[cfg(test)]
impl VecIter {
    pub fn new(schema: Schema, frames: Vec<DataFrame>) -> Self {
        Self {
            schema,
            frames: frames.into(),
        }
    }
}

#[cfg(test)]
impl BatchIter for VecIter {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn next_batch(&mut self) -> Result<Option<DataFrame>> {
        Ok(self.frames.pop_front())
    }
}

/// Drains an iterator into a single frame.
pub(crate) fn collect_frames(iter: &mut dyn BatchIter) -> Result<DataFrame> {
    let schema = iter.schema().clone();
    let mut batches = vec![];
    while let Some(batch) = iter.next_batch()? {
        batches.push(batch);
    }
    if batches.is_empty() {
        Ok(DataFrame::empty(schema))
    } else {
        DataFrame::concat(&batches)
    }
}
