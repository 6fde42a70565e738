//! Fixed-heuristic selectivity and cost estimates.

use std::collections::HashMap;

use crate::error::Result;
use crate::plan::{CmpOp, FilterNode, NodeId, PlanNode, PlanRef};
use crate::schema::Schema;
use crate::types::DType;

/// Relative row count assumed for a scan when the file has not been opened.
const BASE_SCAN_ROWS: f64 = 1_000_000.0;

pub(crate) const SEL_EQ_NUMERIC: f64 = 0.10;
pub(crate) const SEL_EQ_STRING: f64 = 0.05;
pub(crate) const SEL_NEQ: f64 = 0.9;
pub(crate) const SEL_RANGE: f64 = 0.5;
// ops the upstream heuristics leave open; decided here
pub(crate) const SEL_IN: f64 = 0.2;
pub(crate) const SEL_NOT_IN: f64 = 0.8;
pub(crate) const SEL_CONTAINS: f64 = 0.3;
pub(crate) const SEL_GROUPBY: f64 = 0.1;
pub(crate) const SEL_DISTINCT: f64 = 0.3;

/// Estimates per node, cumulative from the leaves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeStats {
    /// Fraction of input rows this node keeps (1.0 for non-reducing nodes).
    pub selectivity: f64,
    /// Estimated rows this node emits.
    pub estimated_rows: f64,
    /// Additive cost: rows processed by this node plus its inputs' costs.
    pub cost: f64,
}

/// The estimated fraction of rows a filter keeps.
pub fn filter_selectivity(node: &FilterNode, input_schema: &Schema) -> f64 {
    let is_string = input_schema
        .dtype_of(&node.column)
        .map(|dtype| dtype == DType::Utf8)
        .unwrap_or(false);
    match node.op {
        CmpOp::Eq => {
            if is_string {
                SEL_EQ_STRING
            } else {
                SEL_EQ_NUMERIC
            }
        }
        CmpOp::Neq => SEL_NEQ,
        CmpOp::Lt | CmpOp::LtEq | CmpOp::Gt | CmpOp::GtEq => SEL_RANGE,
        CmpOp::In => SEL_IN,
        CmpOp::NotIn => SEL_NOT_IN,
        CmpOp::Contains => SEL_CONTAINS,
    }
}

/// Computes [`NodeStats`] for every node of the plan, bottom-up.
pub fn compute_stats(root: &PlanRef) -> Result<HashMap<NodeId, NodeStats>> {
    let mut stats = HashMap::new();
    walk(root, &mut stats)?;
    Ok(stats)
}

fn walk(node: &PlanRef, stats: &mut HashMap<NodeId, NodeStats>) -> Result<NodeStats> {
    let computed = match node.as_ref() {
        PlanNode::Scan(_) => NodeStats {
            selectivity: 1.0,
            estimated_rows: BASE_SCAN_ROWS,
            cost: BASE_SCAN_ROWS,
        },
        PlanNode::Filter(filter) => {
            let input = walk(&filter.input, stats)?;
            let input_schema = filter.input.output_schema()?;
            let selectivity = filter_selectivity(filter, &input_schema);
            NodeStats {
                selectivity,
                estimated_rows: input.estimated_rows * selectivity,
                cost: input.cost + input.estimated_rows,
            }
        }
        PlanNode::Select(select) => {
            let input = walk(&select.input, stats)?;
            NodeStats {
                selectivity: 1.0,
                estimated_rows: input.estimated_rows,
                cost: input.cost + input.estimated_rows,
            }
        }
        PlanNode::GroupBy(groupby) => {
            let input = walk(&groupby.input, stats)?;
            NodeStats {
                selectivity: SEL_GROUPBY,
                estimated_rows: input.estimated_rows * SEL_GROUPBY,
                cost: input.cost + input.estimated_rows,
            }
        }
        PlanNode::Sort(sort) => {
            let input = walk(&sort.input, stats)?;
            NodeStats {
                selectivity: 1.0,
                estimated_rows: input.estimated_rows,
                cost: input.cost + input.estimated_rows,
            }
        }
        PlanNode::Join(join) => {
            let left = walk(&join.left, stats)?;
            let right = walk(&join.right, stats)?;
            let estimated_rows = left.estimated_rows.max(right.estimated_rows);
            NodeStats {
                selectivity: 1.0,
                estimated_rows,
                cost: left.cost + right.cost + left.estimated_rows + right.estimated_rows,
            }
        }
        PlanNode::Distinct(distinct) => {
            let input = walk(&distinct.input, stats)?;
            NodeStats {
                selectivity: SEL_DISTINCT,
                estimated_rows: input.estimated_rows * SEL_DISTINCT,
                cost: input.cost + input.estimated_rows,
            }
        }
    };
    stats.insert(node.id(), computed);
    Ok(computed)
}
