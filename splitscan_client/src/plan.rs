//! Execution plans returned by the database for a query.
//!
//! The database reports a plan as a flat list of index-linked nodes; [`ExecutionPlan`] holds the
//! same plan as a tree of relational [`PlanNode`]s, rooted at the operator that produces the
//! query's final output.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::Display,
};

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no nodes")]
    Empty,

    #[error("plan has no root node (index 0)")]
    MissingRoot,

    #[error("plan contains node index {0} more than once")]
    DuplicateIndex(usize),

    #[error("plan node {parent} links to child {child}, which does not exist")]
    DanglingChild { parent: usize, child: usize },

    #[error("plan node {0} is its own ancestor")]
    Cycle(usize),

    #[error("plan node {parent} links to child {child}, which already has another parent")]
    SharedChild { parent: usize, child: usize },
}

/// Operator kind of a relational plan node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PlanNodeKind {
    /// Fans a subtree out to every partition and unions the results without merging
    DistributedUnion,
    LocalDistributedUnion,
    /// Unions sorted partition results while preserving their order
    DistributedMergeUnion,
    DistributedCrossApply,
    Scan,
    Filter,
    FilterScan,
    Join,
    Aggregate,
    Sort,
    Limit,
    Union,
    SerializeResult,
    Compute,
    Unknown(String),
}

impl PlanNodeKind {
    /// Map the operator name the database displays for a node to its kind
    pub fn from_display_name(name: &str) -> Self {
        match name.trim() {
            "Distributed Union" => Self::DistributedUnion,
            "Local Distributed Union" => Self::LocalDistributedUnion,
            "Distributed Merge Union" => Self::DistributedMergeUnion,
            "Distributed Cross Apply" | "Distributed Outer Apply" => Self::DistributedCrossApply,
            "Scan" | "Table Scan" | "Index Scan" => Self::Scan,
            "Filter" => Self::Filter,
            "Filter Scan" => Self::FilterScan,
            "Hash Join" | "Merge Join" | "Cross Apply" | "Outer Apply" | "Apply Join"
            | "Push Broadcast Hash Join" => Self::Join,
            "Aggregate" | "Stream Aggregate" | "Hash Aggregate" => Self::Aggregate,
            "Sort" | "Sort Limit" | "Minor Sort" => Self::Sort,
            "Limit" | "Global Limit" | "Local Limit" => Self::Limit,
            "Union All" | "Union Input" => Self::Union,
            "Serialize Result" => Self::SerializeResult,
            "Compute" | "Compute Struct" => Self::Compute,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl Display for PlanNodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::DistributedUnion => "Distributed Union",
            Self::LocalDistributedUnion => "Local Distributed Union",
            Self::DistributedMergeUnion => "Distributed Merge Union",
            Self::DistributedCrossApply => "Distributed Cross Apply",
            Self::Scan => "Scan",
            Self::Filter => "Filter",
            Self::FilterScan => "Filter Scan",
            Self::Join => "Join",
            Self::Aggregate => "Aggregate",
            Self::Sort => "Sort",
            Self::Limit => "Limit",
            Self::Union => "Union",
            Self::SerializeResult => "Serialize Result",
            Self::Compute => "Compute",
            Self::Unknown(name) => name,
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
    Semi,
    Anti,
}

impl JoinType {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INNER" => Some(Self::Inner),
            "LEFT" | "LEFT OUTER" => Some(Self::Left),
            "RIGHT" | "RIGHT OUTER" => Some(Self::Right),
            "FULL" | "FULL OUTER" => Some(Self::Full),
            "CROSS" => Some(Self::Cross),
            "SEMI" => Some(Self::Semi),
            "ANTI" | "ANTI SEMI" => Some(Self::Anti),
            _ => None,
        }
    }
}

/// Operator-specific details of a plan node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanNodeMetadata {
    /// Table or index read by a scan
    pub table: Option<String>,
    pub join_type: Option<JoinType>,
    /// Set on joins between interleaved tables, which can be evaluated within a partition
    pub interleaved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanNode {
    kind: PlanNodeKind,
    children: Vec<PlanNode>,
    metadata: PlanNodeMetadata,
}

impl PlanNode {
    pub fn new(kind: PlanNodeKind) -> Self {
        Self {
            kind,
            children: vec![],
            metadata: PlanNodeMetadata::default(),
        }
    }

    /// A scan of the given table
    pub fn scan(table: impl Into<String>) -> Self {
        Self::new(PlanNodeKind::Scan).with_table(table)
    }

    pub fn with_child(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.metadata.table = Some(table.into());
        self
    }

    pub fn with_join(mut self, join_type: JoinType, interleaved: bool) -> Self {
        self.metadata.join_type = Some(join_type);
        self.metadata.interleaved = interleaved;
        self
    }

    pub fn kind(&self) -> &PlanNodeKind {
        &self.kind
    }

    pub fn children(&self) -> &[PlanNode] {
        &self.children
    }

    pub fn metadata(&self) -> &PlanNodeMetadata {
        &self.metadata
    }

    /// Table read by the first scan found in a depth-first, left-to-right walk of this subtree
    pub fn scanned_table(&self) -> Option<&str> {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if matches!(node.kind, PlanNodeKind::Scan | PlanNodeKind::FilterScan) {
                if let Some(table) = node.metadata.table.as_deref() {
                    return Some(table);
                }
            }
            stack.extend(node.children.iter().rev());
        }
        None
    }
}

/// A node of the flat plan representation sent by the database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPlanNode {
    pub index: usize,
    pub display_name: String,
    /// Scalar nodes describe expressions rather than row-producing operators
    pub relational: bool,
    pub child_indices: Vec<usize>,
    /// Known keys: `scan_target`, `join_type` and `interleaved`
    pub metadata: BTreeMap<String, String>,
}

/// The execution plan of a query, built once and read-only thereafter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    root: Option<PlanNode>,
}

impl ExecutionPlan {
    pub fn new(root: PlanNode) -> Self {
        Self { root: Some(root) }
    }

    /// A plan with no operators, which the database should never produce for a valid query
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<&PlanNode> {
        self.root.as_ref()
    }

    /// Build the plan tree from the flat node list, rooted at node index 0
    ///
    /// Scalar nodes and links to them are dropped.
    pub fn try_from_plan_nodes(nodes: Vec<RawPlanNode>) -> Result<Self, PlanError> {
        if nodes.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut by_index = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let index = node.index;
            if by_index.insert(index, node).is_some() {
                return Err(PlanError::DuplicateIndex(index));
            }
        }
        if !by_index.contains_key(&0) {
            return Err(PlanError::MissingRoot);
        }

        let mut visited = HashSet::from([0]);
        let mut ancestors = HashSet::new();
        let root = build_node(&by_index, 0, &mut visited, &mut ancestors)?;
        Ok(Self::new(root))
    }
}

fn build_node(
    nodes: &HashMap<usize, RawPlanNode>,
    index: usize,
    visited: &mut HashSet<usize>,
    ancestors: &mut HashSet<usize>,
) -> Result<PlanNode, PlanError> {
    // presence of `index` is checked by the caller
    let raw = &nodes[&index];
    ancestors.insert(index);

    let mut node = PlanNode::new(PlanNodeKind::from_display_name(&raw.display_name));
    node.metadata.table = raw.metadata.get("scan_target").cloned();
    node.metadata.join_type = raw
        .metadata
        .get("join_type")
        .and_then(|j| JoinType::parse(j));
    node.metadata.interleaved = raw
        .metadata
        .get("interleaved")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    for &child in &raw.child_indices {
        let Some(child_node) = nodes.get(&child) else {
            return Err(PlanError::DanglingChild {
                parent: index,
                child,
            });
        };
        if !child_node.relational {
            continue;
        }
        if ancestors.contains(&child) {
            return Err(PlanError::Cycle(child));
        }
        // each node has at most one parent
        if !visited.insert(child) {
            return Err(PlanError::SharedChild {
                parent: index,
                child,
            });
        }
        node.children.push(build_node(nodes, child, visited, ancestors)?);
    }

    ancestors.remove(&index);
    Ok(node)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn raw(index: usize, name: &str, children: &[usize]) -> RawPlanNode {
        RawPlanNode {
            index,
            display_name: name.to_string(),
            relational: true,
            child_indices: children.to_vec(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn builds_tree_from_flat_nodes() {
        let mut scan = raw(3, "Table Scan", &[]);
        scan.metadata
            .insert("scan_target".to_string(), "Singers".to_string());
        let mut scalar = raw(4, "Reference", &[]);
        scalar.relational = false;

        let plan = ExecutionPlan::try_from_plan_nodes(vec![
            scan,
            raw(0, "Distributed Union", &[1]),
            raw(1, "Serialize Result", &[2, 4]),
            raw(2, "Filter Scan", &[3]),
            scalar,
        ])
        .unwrap();

        let expected = PlanNode::new(PlanNodeKind::DistributedUnion).with_child(
            PlanNode::new(PlanNodeKind::SerializeResult).with_child(
                PlanNode::new(PlanNodeKind::FilterScan).with_child(PlanNode::scan("Singers")),
            ),
        );
        assert_eq!(plan.root(), Some(&expected));
        assert_eq!(expected.scanned_table(), Some("Singers"));
    }

    #[test]
    fn join_metadata() {
        let mut join = raw(0, "Cross Apply", &[]);
        join.metadata
            .insert("join_type".to_string(), "inner".to_string());
        join.metadata
            .insert("interleaved".to_string(), "TRUE".to_string());
        let plan = ExecutionPlan::try_from_plan_nodes(vec![join]).unwrap();
        let root = plan.root().unwrap();
        assert_eq!(root.kind(), &PlanNodeKind::Join);
        assert_eq!(root.metadata().join_type, Some(JoinType::Inner));
        assert!(root.metadata().interleaved);
    }

    #[test]
    fn rejects_malformed_plans() {
        assert_eq!(
            ExecutionPlan::try_from_plan_nodes(vec![]),
            Err(PlanError::Empty)
        );
        assert_eq!(
            ExecutionPlan::try_from_plan_nodes(vec![raw(1, "Scan", &[])]),
            Err(PlanError::MissingRoot)
        );
        assert_eq!(
            ExecutionPlan::try_from_plan_nodes(vec![raw(0, "Scan", &[]), raw(0, "Scan", &[])]),
            Err(PlanError::DuplicateIndex(0))
        );
        assert_eq!(
            ExecutionPlan::try_from_plan_nodes(vec![raw(0, "Distributed Union", &[7])]),
            Err(PlanError::DanglingChild {
                parent: 0,
                child: 7
            })
        );
        assert_eq!(
            ExecutionPlan::try_from_plan_nodes(vec![
                raw(0, "Distributed Union", &[1]),
                raw(1, "Filter", &[0]),
            ]),
            Err(PlanError::Cycle(0))
        );
    }

    #[test]
    fn rejects_nodes_with_several_parents() {
        // each node lists its successor twice, which would double the tree at every level
        let nodes = (0..40)
            .map(|i| raw(i, "Filter", &[i + 1, i + 1]))
            .chain([raw(40, "Scan", &[])])
            .collect();

        assert_eq!(
            ExecutionPlan::try_from_plan_nodes(nodes),
            Err(PlanError::SharedChild {
                parent: 0,
                child: 1
            })
        );

        // a shared scalar node is not part of the tree
        let mut scalar = raw(2, "Constant", &[]);
        scalar.relational = false;
        let plan = ExecutionPlan::try_from_plan_nodes(vec![
            raw(0, "Distributed Union", &[1, 2]),
            raw(1, "Filter", &[3, 2]),
            scalar,
            raw(3, "Scan", &[]),
        ])
        .unwrap();
        assert_eq!(plan.root().unwrap().children().len(), 1);
    }

    #[test]
    fn unknown_display_names_are_kept() {
        assert_eq!(
            PlanNodeKind::from_display_name("Batch Scan"),
            PlanNodeKind::Unknown("Batch Scan".to_string())
        );
        assert_eq!(PlanNodeKind::Unknown("Batch Scan".into()).to_string(), "Batch Scan");
    }
}
