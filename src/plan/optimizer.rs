//! Plan rewrites.
//!
//! Five passes, in order: combine contiguous filters (most selective nearest
//! the scan), reorder filter/select runs, detect pushdown eligibility,
//! compute statistics, and drop adjacent duplicate filters. Rewrites build
//! new nodes around shared children; node ids are preserved.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::Result;
use crate::plan::stats::{compute_stats, filter_selectivity, NodeStats};
use crate::plan::{
    DistinctNode, FilterNode, FilterValue, GroupByNode, JoinNode, NodeId, PlanNode, PlanRef,
    SelectNode, SortNode,
};

/// The result of optimization: the rewritten plan plus per-node annotations
/// the executor consumes.
#[derive(Debug)]
pub struct OptimizedPlan {
    pub root: PlanRef,
    /// Filters whose predicate may be evaluated against raw bytes at scan.
    pub pushdown_filters: HashSet<NodeId>,
    /// Selects under which a scan is reachable through only filter/select
    /// nodes, making column pruning at the scan sound.
    pub prunable_selects: HashSet<NodeId>,
    pub stats: HashMap<NodeId, NodeStats>,
}

/// Runs all passes over `root`.
pub fn optimize(root: &PlanRef) -> Result<OptimizedPlan> {
    let root = rewrite(root)?;
    let mut pushdown_filters = HashSet::new();
    let mut prunable_selects = HashSet::new();
    detect_pushdown(&root, &mut pushdown_filters, &mut prunable_selects);
    let stats = compute_stats(&root)?;
    Ok(OptimizedPlan {
        root,
        pushdown_filters,
        prunable_selects,
        stats,
    })
}

/// Rewrites every maximal run of contiguous filter/select nodes into
/// `filters (sorted by selectivity, stable) → selects (original order)`,
/// dropping adjacent duplicate filters.
fn rewrite(node: &PlanRef) -> Result<PlanRef> {
    match node.as_ref() {
        PlanNode::Filter(_) | PlanNode::Select(_) => rewrite_run(node),
        PlanNode::Scan(_) => Ok(node.clone()),
        PlanNode::GroupBy(groupby) => {
            let input = rewrite(&groupby.input)?;
            Ok(if Arc::ptr_eq(&input, &groupby.input) {
                node.clone()
            } else {
                Arc::new(PlanNode::GroupBy(GroupByNode {
                    input,
                    ..groupby.clone()
                }))
            })
        }
        PlanNode::Sort(sort) => {
            let input = rewrite(&sort.input)?;
            Ok(if Arc::ptr_eq(&input, &sort.input) {
                node.clone()
            } else {
                Arc::new(PlanNode::Sort(SortNode {
                    input,
                    ..sort.clone()
                }))
            })
        }
        PlanNode::Join(join) => {
            let left = rewrite(&join.left)?;
            let right = rewrite(&join.right)?;
            Ok(
                if Arc::ptr_eq(&left, &join.left) && Arc::ptr_eq(&right, &join.right) {
                    node.clone()
                } else {
                    Arc::new(PlanNode::Join(JoinNode {
                        left,
                        right,
                        ..join.clone()
                    }))
                },
            )
        }
        PlanNode::Distinct(distinct) => {
            let input = rewrite(&distinct.input)?;
            Ok(if Arc::ptr_eq(&input, &distinct.input) {
                node.clone()
            } else {
                Arc::new(PlanNode::Distinct(DistinctNode {
                    input,
                    ..distinct.clone()
                }))
            })
        }
    }
}

fn rewrite_run(top: &PlanRef) -> Result<PlanRef> {
    // collect the run, top to bottom
    let mut filters: Vec<FilterNode> = vec![];
    let mut selects: Vec<SelectNode> = vec![];
    let mut cursor = top.clone();
    loop {
        match cursor.as_ref() {
            PlanNode::Filter(filter) => {
                filters.push(filter.clone());
                cursor = filter.input.clone();
            }
            PlanNode::Select(select) => {
                selects.push(select.clone());
                cursor = select.input.clone();
            }
            _ => break,
        }
    }
    let below = rewrite(&cursor)?;
    let below_schema = below.output_schema()?;

    // most selective closest to the scan; stable, so equal estimates keep
    // their original relative order
    filters.reverse();
    selects.reverse();
    filters.sort_by(|a, b| {
        filter_selectivity(a, &below_schema)
            .total_cmp(&filter_selectivity(b, &below_schema))
    });
    dedup_adjacent(&mut filters);

    let mut rebuilt = below;
    for filter in filters {
        rebuilt = Arc::new(PlanNode::Filter(FilterNode {
            input: rebuilt,
            ..filter
        }));
    }
    for select in selects {
        rebuilt = Arc::new(PlanNode::Select(SelectNode {
            input: rebuilt,
            ..select
        }));
    }
    Ok(rebuilt)
}

fn dedup_adjacent(filters: &mut Vec<FilterNode>) {
    let mut i = 1;
    while i < filters.len() {
        let duplicate = filters[i].column == filters[i - 1].column
            && filters[i].op == filters[i - 1].op
            && filters[i].value == filters[i - 1].value;
        if duplicate {
            filters.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Marks pushdown-eligible filters and pruning-eligible selects.
///
/// A filter is eligible iff its operator is a scalar comparison and its
/// value is a scalar. A select is eligible iff some scan is reachable from
/// it through only filter/select nodes.
fn detect_pushdown(
    node: &PlanRef,
    pushdown_filters: &mut HashSet<NodeId>,
    prunable_selects: &mut HashSet<NodeId>,
) {
    match node.as_ref() {
        PlanNode::Filter(filter) => {
            if filter.op.is_scalar_comparison()
                && matches!(filter.value, FilterValue::Scalar(_))
            {
                pushdown_filters.insert(filter.id);
            }
            detect_pushdown(&filter.input, pushdown_filters, prunable_selects);
        }
        PlanNode::Select(select) => {
            if scan_reachable_through_projections(&select.input) {
                prunable_selects.insert(select.id);
            }
            detect_pushdown(&select.input, pushdown_filters, prunable_selects);
        }
        other => {
            for input in other.inputs() {
                detect_pushdown(input, pushdown_filters, prunable_selects);
            }
        }
    }
}

fn scan_reachable_through_projections(node: &PlanRef) -> bool {
    match node.as_ref() {
        PlanNode::Scan(_) => true,
        PlanNode::Filter(filter) => scan_reachable_through_projections(&filter.input),
        PlanNode::Select(select) => scan_reachable_through_projections(&select.input),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Value;
    use crate::plan::{AggExpr, AggFunc, CmpOp};
    use crate::read::ReadOptions;
    use crate::schema::Schema;
    use crate::types::DType;
    use std::path::PathBuf;

    fn scan() -> PlanRef {
        let schema = Schema::new(vec![
            ("id".to_string(), DType::Int32),
            ("name".to_string(), DType::Utf8),
            ("value".to_string(), DType::Float64),
        ])
        .unwrap();
        PlanNode::scan(PathBuf::from("data.csv"), schema, ReadOptions::default())
    }

    fn filter(input: PlanRef, column: &str, op: CmpOp, value: Value) -> PlanRef {
        PlanNode::filter(input, column, op, FilterValue::Scalar(value))
    }

    fn chain(root: &PlanRef) -> Vec<String> {
        let mut out = vec![];
        let mut cursor = root.clone();
        loop {
            match cursor.as_ref() {
                PlanNode::Filter(f) => {
                    out.push(format!("filter:{}", f.column));
                    cursor = f.input.clone();
                }
                PlanNode::Select(_) => {
                    out.push("select".to_string());
                    cursor = match cursor.as_ref() {
                        PlanNode::Select(s) => s.input.clone(),
                        _ => unreachable!(),
                    };
                }
                PlanNode::Scan(_) => {
                    out.push("scan".to_string());
                    break;
                }
                other => {
                    out.push(format!("{:?}", other.id()));
                    break;
                }
            }
        }
        out
    }

    #[test]
    fn most_selective_filter_lands_next_to_scan() -> Result<()> {
        // range filter (0.5) applied above an equality on a string (0.05):
        // after optimization the equality must sit closest to the scan
        let plan = filter(
            filter(scan(), "value", CmpOp::Gt, Value::Float64(1.0)),
            "name",
            CmpOp::Eq,
            Value::Utf8("x".to_string()),
        );
        let optimized = optimize(&plan)?;
        assert_eq!(
            chain(&optimized.root),
            vec!["filter:value", "filter:name", "scan"]
        );
        Ok(())
    }

    #[test]
    fn selects_move_above_filters() -> Result<()> {
        let plan = filter(
            PlanNode::select(
                filter(scan(), "id", CmpOp::Gt, Value::Int32(0)),
                vec!["id".to_string(), "name".to_string()],
            ),
            "name",
            CmpOp::Eq,
            Value::Utf8("x".to_string()),
        );
        let optimized = optimize(&plan)?;
        assert_eq!(
            chain(&optimized.root),
            vec!["select", "filter:id", "filter:name", "scan"]
        );
        Ok(())
    }

    #[test]
    fn ids_survive_optimization() -> Result<()> {
        let inner = filter(scan(), "id", CmpOp::Eq, Value::Int32(1));
        let inner_id = inner.id();
        let plan = filter(inner, "value", CmpOp::Lt, Value::Float64(2.0));
        let plan_id = plan.id();
        let optimized = optimize(&plan)?;
        let mut seen = vec![];
        let mut cursor = optimized.root.clone();
        while let PlanNode::Filter(f) = cursor.as_ref() {
            seen.push(f.id);
            cursor = f.input.clone();
        }
        assert!(seen.contains(&inner_id));
        assert!(seen.contains(&plan_id));
        Ok(())
    }

    #[test]
    fn adjacent_duplicates_collapse() -> Result<()> {
        let plan = filter(
            filter(scan(), "id", CmpOp::Eq, Value::Int32(1)),
            "id",
            CmpOp::Eq,
            Value::Int32(1),
        );
        let optimized = optimize(&plan)?;
        assert_eq!(chain(&optimized.root), vec!["filter:id", "scan"]);
        Ok(())
    }

    #[test]
    fn equal_selectivities_keep_input_order() -> Result<()> {
        let plan = filter(
            filter(scan(), "value", CmpOp::Gt, Value::Float64(1.0)),
            "id",
            CmpOp::Lt,
            Value::Int32(10),
        );
        let optimized = optimize(&plan)?;
        // both are range filters (0.5): original bottom-up order preserved
        assert_eq!(
            chain(&optimized.root),
            vec!["filter:id", "filter:value", "scan"]
        );
        Ok(())
    }

    #[test]
    fn pushdown_detection() -> Result<()> {
        let eligible = filter(scan(), "id", CmpOp::LtEq, Value::Int32(5));
        let eligible_id = eligible.id();
        let ineligible = PlanNode::filter(
            eligible,
            "id",
            CmpOp::In,
            FilterValue::List(vec![Value::Int32(1), Value::Int32(2)]),
        );
        let ineligible_id = ineligible.id();
        let select = PlanNode::select(ineligible, vec!["id".to_string()]);
        let select_id = select.id();

        let optimized = optimize(&select)?;
        assert!(optimized.pushdown_filters.contains(&eligible_id));
        assert!(!optimized.pushdown_filters.contains(&ineligible_id));
        assert!(optimized.prunable_selects.contains(&select_id));
        Ok(())
    }

    #[test]
    fn select_above_groupby_cannot_prune() -> Result<()> {
        let groupby = PlanNode::groupby(
            scan(),
            vec!["name".to_string()],
            vec![AggExpr {
                column: "value".to_string(),
                func: AggFunc::Sum,
                out_name: "s".to_string(),
            }],
        );
        let select = PlanNode::select(groupby, vec!["s".to_string()]);
        let select_id = select.id();
        let optimized = optimize(&select)?;
        assert!(!optimized.prunable_selects.contains(&select_id));
        Ok(())
    }
}
