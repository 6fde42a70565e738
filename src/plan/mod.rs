//! Immutable query plans.
//!
//! A plan is a tree of reference-counted nodes; rewrites share unchanged
//! subtrees. Every node carries a globally-unique monotonic id, assigned at
//! construction and preserved by the optimizer, so executors and caches can
//! memoize per node.

pub mod optimizer;
pub mod stats;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::frame::Value;
use crate::read::ReadOptions;
use crate::schema::Schema;
use crate::types::DType;

/// A unique, monotonically increasing plan-node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "#{}", self.0)
    }
}

fn next_node_id() -> NodeId {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NodeId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Comparison operators of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
    Contains,
}

impl CmpOp {
    /// Whether the operator compares against a single scalar, which makes a
    /// filter eligible for pushdown into the scan.
    pub fn is_scalar_comparison(&self) -> bool {
        matches!(
            self,
            CmpOp::Eq | CmpOp::Neq | CmpOp::Lt | CmpOp::LtEq | CmpOp::Gt | CmpOp::GtEq
        )
    }
}

/// The right-hand side of a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(Value),
    List(Vec<Value>),
}

/// Aggregate functions of a group-by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Sum,
    Count,
    Mean,
    Min,
    Max,
    First,
    Last,
}

impl AggFunc {
    /// The output dtype given the source column's dtype.
    pub fn output_dtype(&self, source: DType) -> DType {
        match self {
            AggFunc::Count => DType::Int32,
            AggFunc::Mean => DType::Float64,
            AggFunc::Sum | AggFunc::Min | AggFunc::Max | AggFunc::First | AggFunc::Last => source,
        }
    }
}

/// One aggregate of a group-by: `func(column) as out_name`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggExpr {
    pub column: String,
    pub func: AggFunc,
    pub out_name: String,
}

impl AggExpr {
    pub fn new(column: &str, func: AggFunc, out_name: &str) -> Self {
        Self {
            column: column.to_string(),
            func,
            out_name: out_name.to_string(),
        }
    }
}

/// One sort key with its direction.
#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub column: String,
    pub descending: bool,
}

/// Unmatched-row handling of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinHow {
    Inner,
    Left,
    Right,
    Outer,
}

/// Default suffixes appended to clashing non-key column names.
pub const DEFAULT_JOIN_SUFFIXES: (&str, &str) = ("_x", "_y");

#[derive(Debug, Clone)]
pub struct ScanNode {
    pub id: NodeId,
    pub path: PathBuf,
    pub schema: Schema,
    pub options: ReadOptions,
}

#[derive(Debug, Clone)]
pub struct FilterNode {
    pub id: NodeId,
    pub input: PlanRef,
    pub column: String,
    pub op: CmpOp,
    pub value: FilterValue,
}

#[derive(Debug, Clone)]
pub struct SelectNode {
    pub id: NodeId,
    pub input: PlanRef,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GroupByNode {
    pub id: NodeId,
    pub input: PlanRef,
    pub keys: Vec<String>,
    pub aggs: Vec<AggExpr>,
}

#[derive(Debug, Clone)]
pub struct SortNode {
    pub id: NodeId,
    pub input: PlanRef,
    pub by: Vec<SortField>,
    /// Bytes buffered before a sort run spills to disk.
    pub run_bytes: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct JoinNode {
    pub id: NodeId,
    pub left: PlanRef,
    pub right: PlanRef,
    pub on: Vec<String>,
    pub how: JoinHow,
    pub suffixes: (String, String),
}

#[derive(Debug, Clone)]
pub struct DistinctNode {
    pub id: NodeId,
    pub input: PlanRef,
    /// Columns the row fingerprint covers; `None` means all columns.
    pub subset: Option<Vec<String>>,
}

/// A node of a query plan.
#[derive(Debug, Clone)]
pub enum PlanNode {
    Scan(ScanNode),
    Filter(FilterNode),
    Select(SelectNode),
    GroupBy(GroupByNode),
    Sort(SortNode),
    Join(JoinNode),
    Distinct(DistinctNode),
}

/// An owning handle to a plan node.
pub type PlanRef = Arc<PlanNode>;

impl PlanNode {
    pub fn scan(path: PathBuf, schema: Schema, options: ReadOptions) -> PlanRef {
        Arc::new(PlanNode::Scan(ScanNode {
            id: next_node_id(),
            path,
            schema,
            options,
        }))
    }

    pub fn filter(input: PlanRef, column: &str, op: CmpOp, value: FilterValue) -> PlanRef {
        Arc::new(PlanNode::Filter(FilterNode {
            id: next_node_id(),
            input,
            column: column.to_string(),
            op,
            value,
        }))
    }

    pub fn select(input: PlanRef, columns: Vec<String>) -> PlanRef {
        Arc::new(PlanNode::Select(SelectNode {
            id: next_node_id(),
            input,
            columns,
        }))
    }

    pub fn groupby(input: PlanRef, keys: Vec<String>, aggs: Vec<AggExpr>) -> PlanRef {
        Arc::new(PlanNode::GroupBy(GroupByNode {
            id: next_node_id(),
            input,
            keys,
            aggs,
        }))
    }

    pub fn sort(input: PlanRef, by: Vec<SortField>, run_bytes: Option<usize>) -> PlanRef {
        Arc::new(PlanNode::Sort(SortNode {
            id: next_node_id(),
            input,
            by,
            run_bytes,
        }))
    }

    pub fn join(
        left: PlanRef,
        right: PlanRef,
        on: Vec<String>,
        how: JoinHow,
        suffixes: Option<(String, String)>,
    ) -> PlanRef {
        let suffixes = suffixes.unwrap_or((
            DEFAULT_JOIN_SUFFIXES.0.to_string(),
            DEFAULT_JOIN_SUFFIXES.1.to_string(),
        ));
        Arc::new(PlanNode::Join(JoinNode {
            id: next_node_id(),
            left,
            right,
            on,
            how,
            suffixes,
        }))
    }

    pub fn distinct(input: PlanRef, subset: Option<Vec<String>>) -> PlanRef {
        Arc::new(PlanNode::Distinct(DistinctNode {
            id: next_node_id(),
            input,
            subset,
        }))
    }

    pub fn id(&self) -> NodeId {
        match self {
            PlanNode::Scan(node) => node.id,
            PlanNode::Filter(node) => node.id,
            PlanNode::Select(node) => node.id,
            PlanNode::GroupBy(node) => node.id,
            PlanNode::Sort(node) => node.id,
            PlanNode::Join(node) => node.id,
            PlanNode::Distinct(node) => node.id,
        }
    }

    /// Child nodes, in execution order.
    pub fn inputs(&self) -> Vec<&PlanRef> {
        match self {
            PlanNode::Scan(_) => vec![],
            PlanNode::Filter(node) => vec![&node.input],
            PlanNode::Select(node) => vec![&node.input],
            PlanNode::GroupBy(node) => vec![&node.input],
            PlanNode::Sort(node) => vec![&node.input],
            PlanNode::Join(node) => vec![&node.left, &node.right],
            PlanNode::Distinct(node) => vec![&node.input],
        }
    }

    /// The deterministic output schema of this node.
    ///
    /// Also validates column references: a missing column or an aggregate on
    /// an incompatible dtype errors here, before execution starts.
    pub fn output_schema(&self) -> Result<Schema> {
        match self {
            PlanNode::Scan(node) => Ok(node.schema.clone()),
            PlanNode::Filter(node) => {
                let schema = node.input.output_schema()?;
                schema.index_of(&node.column)?;
                Ok(schema)
            }
            PlanNode::Select(node) => node.input.output_schema()?.project(&node.columns),
            PlanNode::GroupBy(node) => {
                let input = node.input.output_schema()?;
                let mut fields = Vec::with_capacity(node.keys.len() + node.aggs.len());
                for key in &node.keys {
                    fields.push((key.clone(), input.dtype_of(key)?));
                }
                for agg in &node.aggs {
                    let source = input.dtype_of(&agg.column)?;
                    if agg.func != AggFunc::Count && !source.is_numeric() {
                        return Err(Error::TypeMismatch(format!(
                            "aggregate {:?} on non-numeric column \"{}\" ({})",
                            agg.func, agg.column, source
                        )));
                    }
                    fields.push((agg.out_name.clone(), agg.func.output_dtype(source)));
                }
                Schema::new(fields)
            }
            PlanNode::Sort(node) => {
                let schema = node.input.output_schema()?;
                for field in &node.by {
                    schema.index_of(&field.column)?;
                }
                Ok(schema)
            }
            PlanNode::Join(node) => {
                let left = node.left.output_schema()?;
                let right = node.right.output_schema()?;
                join_output_schema(&left, &right, &node.on, &node.suffixes)
            }
            PlanNode::Distinct(node) => {
                let schema = node.input.output_schema()?;
                if let Some(subset) = &node.subset {
                    for column in subset {
                        schema.index_of(column)?;
                    }
                }
                Ok(schema)
            }
        }
    }
}

/// The schema of a join: all left columns, then right columns minus the
/// keys. A non-key name present on both sides gets the left then right
/// suffix appended.
pub(crate) fn join_output_schema(
    left: &Schema,
    right: &Schema,
    on: &[String],
    suffixes: &(String, String),
) -> Result<Schema> {
    for key in on {
        let left_dtype = left.dtype_of(key)?;
        let right_dtype = right.dtype_of(key)?;
        if left_dtype != right_dtype {
            return Err(Error::TypeMismatch(format!(
                "join key \"{}\" is {} on the left and {} on the right",
                key, left_dtype, right_dtype
            )));
        }
    }
    let clashes = |name: &str| {
        !on.contains(&name.to_string()) && left.contains(name) && right.contains(name)
    };
    let mut fields = vec![];
    for (name, dtype) in left.fields() {
        let out = if clashes(name) {
            format!("{}{}", name, suffixes.0)
        } else {
            name.clone()
        };
        fields.push((out, *dtype));
    }
    for (name, dtype) in right.fields() {
        if on.contains(name) {
            continue;
        }
        let out = if clashes(name) {
            format!("{}{}", name, suffixes.1)
        } else {
            name.clone()
        };
        fields.push((out, *dtype));
    }
    Schema::new(fields)
}

/// Renders a plan as an indented tree, one node per line.
pub fn explain(root: &PlanRef) -> String {
    fn describe(node: &PlanNode) -> String {
        match node {
            PlanNode::Scan(n) => format!("SCAN {} ({} columns)", n.path.display(), n.schema.len()),
            PlanNode::Filter(n) => format!("FILTER {} {:?} {:?}", n.column, n.op, n.value),
            PlanNode::Select(n) => format!("SELECT {}", n.columns.join(", ")),
            PlanNode::GroupBy(n) => format!(
                "GROUPBY [{}] ({} aggregates)",
                n.keys.join(", "),
                n.aggs.len()
            ),
            PlanNode::Sort(n) => format!(
                "SORT [{}]",
                n.by.iter()
                    .map(|f| {
                        format!("{} {}", f.column, if f.descending { "desc" } else { "asc" })
                    })
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            PlanNode::Join(n) => format!("JOIN {:?} on [{}]", n.how, n.on.join(", ")),
            PlanNode::Distinct(_) => "DISTINCT".to_string(),
        }
    }
    fn walk(node: &PlanRef, depth: usize, out: &mut String) {
        out.push_str(&"  ".repeat(depth));
        out.push_str(&format!("{} {}\n", node.id(), describe(node)));
        for input in node.inputs() {
            walk(input, depth + 1, out);
        }
    }
    let mut out = String::new();
    walk(root, 0, &mut out);
    out
}
