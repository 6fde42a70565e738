//! The lazy, plan-driven frame.

use std::path::Path;

use crate::error::{QueryOutput, Result};
use crate::exec::{execute, ExecContext};
use crate::frame::Value;
use crate::plan::optimizer::optimize;
use crate::plan::{
    explain, AggExpr, CmpOp, FilterValue, JoinHow, PlanNode, PlanRef, SortField,
};
use crate::read::{open_csv, ReadOptions};
use crate::schema::Schema;

/// A deferred query over a delimited file.
///
/// Combinators build an immutable plan; nothing touches the data until
/// [`collect`] optimizes and executes it chunk by chunk.
///
/// [`collect`]: LazyFrame::collect
#[derive(Debug, Clone)]
pub struct LazyFrame {
    plan: PlanRef,
    limit: Option<usize>,
}

/// Opens `path` lazily: the file is indexed and its schema resolved, but no
/// data is parsed until the frame is collected.
pub fn scan_csv<P: AsRef<Path>>(path: P, options: ReadOptions) -> Result<LazyFrame> {
    let path = path.as_ref();
    let csv = open_csv(path, &options)?;
    let mut options = options;
    options.schema = Some(csv.schema.clone());
    Ok(LazyFrame {
        plan: PlanNode::scan(path.to_path_buf(), csv.schema, options),
        limit: None,
    })
}

impl LazyFrame {
    /// Wraps an already-built plan.
    pub fn from_plan(plan: PlanRef) -> Self {
        Self { plan, limit: None }
    }

    pub fn plan(&self) -> &PlanRef {
        &self.plan
    }

    /// The schema this frame will produce.
    pub fn schema(&self) -> Result<Schema> {
        self.plan.output_schema()
    }

    fn wrap(self, plan: PlanRef) -> Self {
        Self {
            plan,
            limit: self.limit,
        }
    }

    /// Keeps rows where `column op value`.
    pub fn filter(self, column: &str, op: CmpOp, value: Value) -> Self {
        let plan = PlanNode::filter(self.plan.clone(), column, op, FilterValue::Scalar(value));
        self.wrap(plan)
    }

    /// Keeps rows whose `column` is one of `values`.
    pub fn filter_in(self, column: &str, values: Vec<Value>) -> Self {
        let plan = PlanNode::filter(
            self.plan.clone(),
            column,
            CmpOp::In,
            FilterValue::List(values),
        );
        self.wrap(plan)
    }

    /// Keeps rows whose `column` is none of `values`.
    pub fn filter_not_in(self, column: &str, values: Vec<Value>) -> Self {
        let plan = PlanNode::filter(
            self.plan.clone(),
            column,
            CmpOp::NotIn,
            FilterValue::List(values),
        );
        self.wrap(plan)
    }

    /// Keeps rows whose string `column` contains `needle`.
    pub fn filter_contains(self, column: &str, needle: &str) -> Self {
        let plan = PlanNode::filter(
            self.plan.clone(),
            column,
            CmpOp::Contains,
            FilterValue::Scalar(Value::Utf8(needle.to_string())),
        );
        self.wrap(plan)
    }

    /// Projects (and reorders) columns.
    pub fn select(self, columns: &[&str]) -> Self {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        let plan = PlanNode::select(self.plan.clone(), columns);
        self.wrap(plan)
    }

    /// Groups by `keys` and computes `aggs` per group.
    pub fn groupby(self, keys: &[&str], aggs: Vec<AggExpr>) -> Self {
        let keys = keys.iter().map(|k| k.to_string()).collect();
        let plan = PlanNode::groupby(self.plan.clone(), keys, aggs);
        self.wrap(plan)
    }

    /// Sorts by one column.
    pub fn sort(self, column: &str, descending: bool) -> Self {
        self.sort_by(
            vec![SortField {
                column: column.to_string(),
                descending,
            }],
            None,
        )
    }

    /// Sorts by a key tuple, optionally bounding the in-memory run size.
    pub fn sort_by(self, by: Vec<SortField>, run_bytes: Option<usize>) -> Self {
        let plan = PlanNode::sort(self.plan.clone(), by, run_bytes);
        self.wrap(plan)
    }

    /// Sort-merge joins this frame with `other` on the given key columns.
    pub fn join(self, other: LazyFrame, on: &[&str], how: JoinHow) -> Self {
        self.join_suffixed(other, on, how, None)
    }

    /// Like [`join`](LazyFrame::join) with explicit clash suffixes.
    pub fn join_suffixed(
        self,
        other: LazyFrame,
        on: &[&str],
        how: JoinHow,
        suffixes: Option<(String, String)>,
    ) -> Self {
        let on = on.iter().map(|k| k.to_string()).collect();
        let plan = PlanNode::join(self.plan.clone(), other.plan, on, how, suffixes);
        self.wrap(plan)
    }

    /// Keeps the first occurrence of each distinct row (over `subset`
    /// columns when given).
    pub fn distinct(self, subset: Option<&[&str]>) -> Self {
        let subset = subset.map(|columns| columns.iter().map(|c| c.to_string()).collect());
        let plan = PlanNode::distinct(self.plan.clone(), subset);
        self.wrap(plan)
    }

    /// Truncates the collected result to `n` rows.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(self.limit.map_or(n, |current| current.min(n)));
        self
    }

    /// Runs the plan under the default context.
    pub fn collect(&self) -> Result<QueryOutput> {
        self.collect_with(&ExecContext::default())
    }

    /// Runs the plan under an explicit context (tracker, cancellation,
    /// materialization store).
    pub fn collect_with(&self, ctx: &ExecContext) -> Result<QueryOutput> {
        let mut output = execute(&self.plan, ctx)?;
        if let Some(limit) = self.limit {
            if output.data.num_rows() > limit {
                output.data = output.data.slice(0, limit)?;
            }
        }
        Ok(output)
    }

    /// Renders the optimized plan as an indented tree.
    pub fn explain(&self) -> Result<String> {
        let optimized = optimize(&self.plan)?;
        Ok(explain(&optimized.root))
    }
}
