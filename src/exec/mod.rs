//! Plan execution.
//!
//! The executor runs an optimized plan bottom-up. Everything between the
//! scan and the first blocking operator streams one chunk at a time through
//! the LRU cache; eligible predicates are evaluated against raw bytes inside
//! the scan, and the scan parses only the columns some downstream node
//! consumes (when that saves at least 30% of the columns). Memory denial is
//! reported in the result envelope, never raised.

pub(crate) mod batch;
mod distinct;
mod groupby;
mod join;
pub(crate) mod predicate;
mod sort;

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fallible_streaming_iterator::FallibleStreamingIterator;

use crate::datetime::DatetimeFormat;
use crate::error::{Error, MemoryError, QueryOutput, Result};
use crate::frame::DataFrame;
use crate::memory::MemoryTracker;
use crate::plan::optimizer::{optimize, OptimizedPlan};
use crate::plan::{
    CmpOp, FilterNode, FilterValue, NodeId, PlanNode, PlanRef, ScanNode, SelectNode,
};
use crate::read::{open_csv, ChunkCache, ChunkReader, ScanPredicate};
use crate::schema::Schema;
use crate::store::Store;

use batch::{collect_frames, BatchIter, DynBatchIter, OnceIter};
use distinct::DistinctExec;
use groupby::GroupByState;
use join::JoinExec;
use sort::{sort_batches, SortKey};

/// A cooperative cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything a query execution shares: the memory tracker, the cancel
/// flag, and (optionally) the on-disk materialization store.
pub struct ExecContext {
    pub tracker: Arc<MemoryTracker>,
    pub cancel: CancelToken,
    pub store: Option<Store>,
    /// Extra key mixed into the store's cache key, for per-query entries.
    pub query_key: Option<String>,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self {
            tracker: MemoryTracker::global(),
            cancel: CancelToken::new(),
            store: None,
            query_key: None,
        }
    }
}

/// Internal failure: real errors propagate, memory denial is routed into
/// the result envelope by [`execute`].
enum ExecFailure {
    Error(Error),
    Memory(MemoryError),
}

impl From<Error> for ExecFailure {
    fn from(e: Error) -> Self {
        ExecFailure::Error(e)
    }
}

type ExecResult<T> = std::result::Result<T, ExecFailure>;

/// Optimizes and executes `plan`, collecting the result frame.
pub fn execute(plan: &PlanRef, ctx: &ExecContext) -> Result<QueryOutput> {
    let output_schema = plan.output_schema()?;
    let optimized = optimize(plan)?;
    let mut requirements = HashMap::new();
    scan_requirements(&optimized.root, None, &mut requirements);
    match exec_node(&optimized.root, ctx, &optimized, &requirements) {
        Ok(mut iter) => {
            let data = collect_frames(&mut iter)?;
            Ok(QueryOutput::complete(data))
        }
        Err(ExecFailure::Memory(error)) => {
            Ok(QueryOutput::denied(DataFrame::empty(output_schema), error))
        }
        Err(ExecFailure::Error(error)) => Err(error),
    }
}

type Requirements = HashMap<NodeId, Option<HashSet<String>>>;

/// Top-down pass recording, per scan, the set of columns any node above it
/// consumes (`None` means all of them).
fn scan_requirements(node: &PlanRef, req: Option<HashSet<String>>, out: &mut Requirements) {
    match node.as_ref() {
        PlanNode::Scan(scan) => {
            out.insert(scan.id, req);
        }
        PlanNode::Filter(filter) => {
            let req = req.map(|mut set| {
                set.insert(filter.column.clone());
                set
            });
            scan_requirements(&filter.input, req, out);
        }
        PlanNode::Select(select) => {
            // the select forwards only the columns it names; anything the
            // parent asked for is among them in a valid plan
            let below = match req {
                None => select.columns.iter().cloned().collect(),
                Some(set) => set,
            };
            scan_requirements(&select.input, Some(below), out);
        }
        PlanNode::GroupBy(groupby) => {
            let mut below: HashSet<String> = groupby.keys.iter().cloned().collect();
            below.extend(groupby.aggs.iter().map(|agg| agg.column.clone()));
            scan_requirements(&groupby.input, Some(below), out);
        }
        PlanNode::Sort(sort) => {
            let req = req.map(|mut set| {
                set.extend(sort.by.iter().map(|field| field.column.clone()));
                set
            });
            scan_requirements(&sort.input, req, out);
        }
        PlanNode::Distinct(distinct) => {
            // a distinct emits whole rows; the fingerprint subset adds to
            // whatever the parent needs
            let req = match (&req, &distinct.subset) {
                (Some(set), Some(subset)) => {
                    let mut set = set.clone();
                    set.extend(subset.iter().cloned());
                    Some(set)
                }
                _ => None,
            };
            scan_requirements(&distinct.input, req, out);
        }
        PlanNode::Join(join) => {
            let (left_req, right_req) = match req {
                None => (None, None),
                Some(set) => {
                    let left_schema = join.left.output_schema();
                    let right_schema = join.right.output_schema();
                    match (left_schema, right_schema) {
                        (Ok(left_schema), Ok(right_schema)) => {
                            let map_side = |schema: &Schema, suffix: &str| {
                                let mut side = HashSet::new();
                                for name in schema.names() {
                                    let clashed = format!("{}{}", name, suffix);
                                    if join.on.contains(&name.to_string())
                                        || set.contains(name)
                                        || set.contains(&clashed)
                                    {
                                        side.insert(name.to_string());
                                    }
                                }
                                side
                            };
                            (
                                Some(map_side(&left_schema, &join.suffixes.0)),
                                Some(map_side(&right_schema, &join.suffixes.1)),
                            )
                        }
                        // schema errors surface later, at execution
                        _ => (None, None),
                    }
                }
            };
            scan_requirements(&join.left, left_req, out);
            scan_requirements(&join.right, right_req, out);
        }
    }
}

enum RunOp {
    Filter(FilterNode),
    Select(SelectNode),
}

fn exec_node(
    node: &PlanRef,
    ctx: &ExecContext,
    optimized: &OptimizedPlan,
    requirements: &Requirements,
) -> ExecResult<DynBatchIter> {
    match node.as_ref() {
        PlanNode::Scan(scan) => build_scan(scan, vec![], ctx, requirements),
        PlanNode::Filter(_) | PlanNode::Select(_) => {
            // gather the contiguous filter/select run above the scan (or
            // other operator) so eligible predicates can be claimed by it
            let mut ops: Vec<RunOp> = vec![];
            let mut cursor = node.clone();
            loop {
                match cursor.as_ref() {
                    PlanNode::Filter(filter) => {
                        ops.push(RunOp::Filter(filter.clone()));
                        cursor = filter.input.clone();
                    }
                    PlanNode::Select(select) => {
                        ops.push(RunOp::Select(select.clone()));
                        cursor = select.input.clone();
                    }
                    _ => break,
                }
            }
            ops.reverse(); // bottom-up application order

            let mut iter = if let PlanNode::Scan(scan) = cursor.as_ref() {
                let mut predicates = vec![];
                let mut claimed = HashSet::new();
                for op in &ops {
                    if let RunOp::Filter(filter) = op {
                        if optimized.pushdown_filters.contains(&filter.id) {
                            let format = filter_datetime_format(scan, filter);
                            predicates.push(
                                predicate::lower_scan_predicate(filter, &scan.schema, format)
                                    .map_err(ExecFailure::Error)?,
                            );
                            claimed.insert(filter.id);
                        }
                    }
                }
                let iter = build_scan(scan, predicates, ctx, requirements)?;
                ops.retain(|op| match op {
                    RunOp::Filter(filter) => !claimed.contains(&filter.id),
                    RunOp::Select(_) => true,
                });
                iter
            } else {
                exec_node(&cursor, ctx, optimized, requirements)?
            };

            for op in ops {
                iter = match op {
                    RunOp::Filter(filter) => DynBatchIter::new(FilterIter {
                        input: iter,
                        column: filter.column,
                        op: filter.op,
                        value: filter.value,
                    }),
                    RunOp::Select(select) => {
                        let schema = iter
                            .schema()
                            .project(&select.columns)
                            .map_err(ExecFailure::Error)?;
                        DynBatchIter::new(SelectIter {
                            input: iter,
                            columns: select.columns,
                            schema,
                        })
                    }
                };
            }
            Ok(iter)
        }
        PlanNode::GroupBy(groupby) => {
            let mut input = exec_node(&groupby.input, ctx, optimized, requirements)?;
            let output_schema = node.output_schema().map_err(ExecFailure::Error)?;
            let mut state = GroupByState::new(
                input.schema(),
                &groupby.keys,
                &groupby.aggs,
                output_schema,
            )
            .map_err(ExecFailure::Error)?;
            while let Some(batch) = input.next_batch().map_err(ExecFailure::Error)? {
                state.ingest(&batch).map_err(ExecFailure::Error)?;
            }
            tracing::debug!(groups = state.num_groups(), "group-by ingestion finished");
            let frame = state.finalize().map_err(ExecFailure::Error)?;
            Ok(DynBatchIter::new(OnceIter::new(frame)))
        }
        PlanNode::Sort(sort) => {
            let mut input = exec_node(&sort.input, ctx, optimized, requirements)?;
            let schema = input.schema().clone();
            let keys = sort
                .by
                .iter()
                .map(|field| {
                    Ok(SortKey {
                        column: schema.index_of(&field.column)?,
                        descending: field.descending,
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map_err(ExecFailure::Error)?;
            let stream =
                sort_batches(&mut input, keys, sort.run_bytes).map_err(ExecFailure::Error)?;
            Ok(DynBatchIter::new(stream))
        }
        PlanNode::Join(join) => {
            let mut left = exec_node(&join.left, ctx, optimized, requirements)?;
            let mut right = exec_node(&join.right, ctx, optimized, requirements)?;
            let output_schema = node.output_schema().map_err(ExecFailure::Error)?;
            let exec = JoinExec::new(&mut left, &mut right, &join.on, join.how, output_schema)
                .map_err(ExecFailure::Error)?;
            Ok(DynBatchIter::new(exec))
        }
        PlanNode::Distinct(distinct) => {
            let input = exec_node(&distinct.input, ctx, optimized, requirements)?;
            let exec = DistinctExec::new(input, distinct.subset.as_deref())
                .map_err(ExecFailure::Error)?;
            Ok(DynBatchIter::new(exec))
        }
    }
}

fn filter_datetime_format(scan: &ScanNode, filter: &FilterNode) -> DatetimeFormat {
    scan.options
        .datetime_formats
        .get(&filter.column)
        .copied()
        .unwrap_or(DatetimeFormat::Iso)
}

/// Fraction of columns that must be needed before pruning is skipped.
const PRUNE_RATIO: f64 = 0.7;

fn build_scan(
    scan: &ScanNode,
    predicates: Vec<ScanPredicate>,
    ctx: &ExecContext,
    requirements: &Requirements,
) -> ExecResult<DynBatchIter> {
    // a full, unfiltered, untruncated scan may be served from the store
    let full_scan = predicates.is_empty()
        && scan.options.max_rows.is_none()
        && requirements
            .get(&scan.id)
            .map(|req| req.is_none())
            .unwrap_or(true);
    if full_scan {
        if let Some(store) = &ctx.store {
            if let Some(frame) = store
                .lookup(&scan.path, ctx.query_key.as_deref())
                .map_err(ExecFailure::Error)?
            {
                tracing::debug!(path = %scan.path.display(), "scan served from store");
                return Ok(DynBatchIter::new(OnceIter::new(frame)));
            }
        }
    }

    let mut options = scan.options.clone();
    options.schema = Some(scan.schema.clone());
    let csv = open_csv(&scan.path, &options).map_err(ExecFailure::Error)?;

    // column pruning: parse only what downstream consumes, when that skips
    // at least 30% of the columns
    let projection = match requirements.get(&scan.id).and_then(|req| req.as_ref()) {
        Some(needed) => {
            let mut indices = needed
                .iter()
                .filter_map(|name| csv.schema.index_of(name).ok())
                .collect::<Vec<_>>();
            indices.sort_unstable();
            let ratio = indices.len() as f64 / csv.schema.len().max(1) as f64;
            if ratio <= PRUNE_RATIO {
                Some(indices)
            } else {
                None
            }
        }
        None => None,
    };

    let tracker = match options.memory_limit_bytes {
        Some(limit) => Arc::new(MemoryTracker::new(limit)),
        None => ctx.tracker.clone(),
    };
    let task = tracker.new_task();
    let estimate = crate::read::estimate_materialized_bytes(
        csv.file_size,
        csv.index.row_count(),
        &csv.schema,
    );
    let reservation = options.cache_memory_bytes.min(estimate.max(1));
    let outcome = tracker.request_allocation(task, reservation);
    if let Some(error) = outcome.error {
        tracker.release_allocation(task);
        return Err(ExecFailure::Memory(error));
    }

    let cache_options = options.cache_options();
    let cache = ChunkCache::new(&cache_options, tracker, task);
    let reader = ChunkReader::new(
        csv.file,
        csv.index,
        csv.schema.clone(),
        options.parse_options(),
        &cache_options,
        cache,
        projection,
        predicates,
        ctx.cancel.clone(),
    );
    let schema = reader.parsed_schema().map_err(ExecFailure::Error)?;

    let iter = ScanIter {
        reader,
        schema,
        remaining: options.max_rows,
    };

    if full_scan {
        if let Some(store) = &ctx.store {
            // materialize once, persist, and serve from memory
            let mut iter = iter;
            let frame = collect_frames(&mut iter).map_err(ExecFailure::Error)?;
            store
                .put(&scan.path, ctx.query_key.as_deref(), &frame)
                .map_err(ExecFailure::Error)?;
            return Ok(DynBatchIter::new(OnceIter::new(frame)));
        }
    }
    Ok(DynBatchIter::new(iter))
}

/// Streams chunks out of a [`ChunkReader`] as owned batches.
struct ScanIter {
    reader: ChunkReader<File>,
    schema: Schema,
    remaining: Option<usize>,
}

impl BatchIter for ScanIter {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn next_batch(&mut self) -> Result<Option<DataFrame>> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        loop {
            let chunk = match self.reader.next()? {
                Some(chunk) => chunk,
                None => return Ok(None),
            };
            if chunk.row_count() == 0 {
                continue;
            }
            let mut frame = DataFrame::from_chunk(chunk, &self.schema)?;
            if let Some(remaining) = self.remaining.as_mut() {
                if frame.num_rows() > *remaining {
                    frame = frame.slice(0, *remaining)?;
                }
                *remaining -= frame.num_rows();
            }
            return Ok(Some(frame));
        }
    }
}

struct FilterIter {
    input: DynBatchIter,
    column: String,
    op: CmpOp,
    value: FilterValue,
}

impl BatchIter for FilterIter {
    fn schema(&self) -> &Schema {
        self.input.schema()
    }

    fn next_batch(&mut self) -> Result<Option<DataFrame>> {
        loop {
            let batch = match self.input.next_batch()? {
                Some(batch) => batch,
                None => return Ok(None),
            };
            let filtered = predicate::apply_filter(&batch, &self.column, self.op, &self.value)?;
            if !filtered.is_empty() {
                return Ok(Some(filtered));
            }
        }
    }
}

struct SelectIter {
    input: DynBatchIter,
    columns: Vec<String>,
    schema: Schema,
}

impl BatchIter for SelectIter {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn next_batch(&mut self) -> Result<Option<DataFrame>> {
        match self.input.next_batch()? {
            Some(batch) => Ok(Some(batch.select(&self.columns)?)),
            None => Ok(None),
        }
    }
}
