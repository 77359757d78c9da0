//! Forest construction, lookup and in-memory splicing.
//!
//! The flat `LineItem` list is the source of truth; the forest is rebuilt from
//! it on demand through an id -> index map and never persisted.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::ReorderError;
use crate::schema::{LineItem, TreeNode};

// ============================================================================
// Building
// ============================================================================

/// Build a forest from flat line items, ordered by `sort_order`.
///
/// Items whose parent is missing from `items` become roots. Items caught in a
/// parent cycle are never reachable from a root, so the first of them (by
/// `sort_order`) is promoted to a root as well.
pub fn build(items: &[LineItem]) -> Vec<TreeNode> {
    let mut sorted: Vec<&LineItem> = items.iter().collect();
    sorted.sort_by_key(|item| item.sort_order);

    let index: HashMap<&str, usize> = sorted
        .iter()
        .enumerate()
        .map(|(i, item)| (item.id.as_str(), i))
        .collect();

    let mut children_of: Vec<Vec<usize>> = vec![Vec::new(); sorted.len()];
    let mut roots = Vec::new();
    for (i, item) in sorted.iter().enumerate() {
        match item.parent_id.as_deref().and_then(|pid| index.get(pid)) {
            Some(&parent) if parent != i => children_of[parent].push(i),
            Some(_) => roots.push(i),
            None => {
                if let Some(pid) = &item.parent_id {
                    debug!(
                        "Line item {} references missing parent {}, treating as root",
                        item.id, pid
                    );
                }
                roots.push(i);
            }
        }
    }

    fn materialize(
        i: usize,
        level: u32,
        sorted: &[&LineItem],
        children_of: &[Vec<usize>],
        visited: &mut [bool],
    ) -> TreeNode {
        visited[i] = true;
        let mut children = Vec::with_capacity(children_of[i].len());
        for &child in &children_of[i] {
            if !visited[child] {
                children.push(materialize(child, level + 1, sorted, children_of, visited));
            }
        }
        TreeNode {
            item: sorted[i].clone(),
            level,
            children,
        }
    }

    let mut visited = vec![false; sorted.len()];
    let mut forest: Vec<TreeNode> = roots
        .iter()
        .map(|&i| materialize(i, 0, &sorted, &children_of, &mut visited))
        .collect();

    for i in 0..sorted.len() {
        if !visited[i] {
            warn!("Line item {} is part of a parent cycle, promoting to root", sorted[i].id);
            forest.push(materialize(i, 0, &sorted, &children_of, &mut visited));
        }
    }
    if forest.len() > roots.len() {
        forest.sort_by_key(|node| node.item.sort_order);
    }

    forest
}

// ============================================================================
// Lookup
// ============================================================================

/// Depth-first search for a node by id.
pub fn find<'a>(forest: &'a [TreeNode], id: &str) -> Option<&'a TreeNode> {
    for node in forest {
        if node.id() == id {
            return Some(node);
        }
        if let Some(found) = find(&node.children, id) {
            return Some(found);
        }
    }
    None
}

pub fn find_mut<'a>(forest: &'a mut [TreeNode], id: &str) -> Option<&'a mut TreeNode> {
    for node in forest {
        if node.id() == id {
            return Some(node);
        }
        if let Some(found) = find_mut(&mut node.children, id) {
            return Some(found);
        }
    }
    None
}

/// The list `id` currently lives in: its parent's children, or the roots.
pub fn siblings_of<'a>(forest: &'a [TreeNode], id: &str) -> Option<&'a [TreeNode]> {
    if forest.iter().any(|node| node.id() == id) {
        return Some(forest);
    }
    forest.iter().find_map(|node| siblings_of(&node.children, id))
}

/// Structural parent of `id`. `None` for roots and for unknown ids.
///
/// This follows the forest, not `parent_id`, so orphans report no parent.
pub fn parent_of<'a>(forest: &'a [TreeNode], id: &str) -> Option<&'a TreeNode> {
    for node in forest {
        if node.children.iter().any(|child| child.id() == id) {
            return Some(node);
        }
        if let Some(parent) = parent_of(&node.children, id) {
            return Some(parent);
        }
    }
    None
}

/// True when `candidate_id` sits strictly below `ancestor_id`.
pub fn is_descendant(forest: &[TreeNode], ancestor_id: &str, candidate_id: &str) -> bool {
    find(forest, ancestor_id)
        .map(|ancestor| find(&ancestor.children, candidate_id).is_some())
        .unwrap_or(false)
}

/// Total number of nodes in the forest.
pub fn len(forest: &[TreeNode]) -> usize {
    forest.iter().map(TreeNode::subtree_len).sum()
}

// ============================================================================
// Splicing
// ============================================================================

/// Where a relocated subtree lands inside its new sibling list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor<'a> {
    Before(&'a str),
    After(&'a str),
    /// Child index, clamped to the list length.
    ChildIndex(usize),
    /// Before the first sibling whose `sort_order` is at least this value.
    GlobalOrder(u32),
}

/// Detach `moved_id` with its subtree and reinsert it under `new_parent_id`.
///
/// Rejects self-parenting, cycles, and unknown ids before touching the forest,
/// so on error the forest is unchanged. `sort_order` values are left as they
/// were; renumber with the flattener afterwards.
pub fn relocate(
    forest: &mut Vec<TreeNode>,
    moved_id: &str,
    new_parent_id: Option<&str>,
    anchor: Anchor<'_>,
) -> Result<(), ReorderError> {
    if find(forest, moved_id).is_none() {
        return Err(ReorderError::invalid_move(format!(
            "line item {} not found",
            moved_id
        )));
    }
    if let Some(pid) = new_parent_id {
        if pid == moved_id {
            return Err(ReorderError::invalid_move(format!(
                "line item {} cannot become its own parent",
                moved_id
            )));
        }
        if find(forest, pid).is_none() {
            return Err(ReorderError::invalid_move(format!(
                "target parent {} not found",
                pid
            )));
        }
        if is_descendant(forest, moved_id, pid) {
            return Err(ReorderError::invalid_move(format!(
                "moving {} under its descendant {} would create a cycle",
                moved_id, pid
            )));
        }
    }

    // Resolve the insertion index against the list as it will look once the
    // moved subtree is gone, before mutating anything.
    let index = {
        let level: &[TreeNode] = match new_parent_id {
            Some(pid) => find(forest, pid).map(|p| p.children.as_slice()).unwrap_or(&[]),
            None => forest.as_slice(),
        };
        let siblings: Vec<&TreeNode> = level
            .iter()
        .filter(|node| node.id() != moved_id)
        .collect();
        anchor_index(&siblings, anchor)?
    };

    let mut node = detach(forest, moved_id).ok_or_else(|| {
        ReorderError::invalid_move(format!("line item {} not found", moved_id))
    })?;
    node.item.parent_id = new_parent_id.map(str::to_string);

    match new_parent_id {
        Some(pid) => {
            let parent = find_mut(forest, pid).ok_or_else(|| {
                ReorderError::invalid_move(format!("target parent {} not found", pid))
            })?;
            set_levels(std::slice::from_mut(&mut node), parent.level + 1);
            parent.children.insert(index, node);
        }
        None => {
            set_levels(std::slice::from_mut(&mut node), 0);
            forest.insert(index, node);
        }
    }
    Ok(())
}

fn anchor_index(siblings: &[&TreeNode], anchor: Anchor<'_>) -> Result<usize, ReorderError> {
    let position_of = |id: &str| {
        siblings.iter().position(|node| node.id() == id).ok_or_else(|| {
            ReorderError::invalid_move(format!(
                "reference {} is not a sibling at the target level",
                id
            ))
        })
    };
    match anchor {
        Anchor::Before(id) => position_of(id),
        Anchor::After(id) => position_of(id).map(|i| i + 1),
        Anchor::ChildIndex(i) => Ok(i.min(siblings.len())),
        Anchor::GlobalOrder(order) => Ok(siblings
            .iter()
            .position(|node| node.item.sort_order >= order)
            .unwrap_or(siblings.len())),
    }
}

/// Array-move within one sibling list: take `active_id` out and insert it at
/// the index `over_id` occupied.
pub fn move_within_siblings(
    forest: &mut Vec<TreeNode>,
    active_id: &str,
    over_id: &str,
) -> Result<(), ReorderError> {
    let (active_parent, over_parent) = match (find(forest, active_id), find(forest, over_id)) {
        (Some(_), Some(_)) => (
            parent_of(forest, active_id).map(|p| p.id().to_string()),
            parent_of(forest, over_id).map(|p| p.id().to_string()),
        ),
        _ => return Err(ReorderError::invalid_move("Items not found")),
    };
    if active_parent != over_parent {
        return Err(ReorderError::invalid_move(
            "Items can only be reordered within the same parent",
        ));
    }

    let (from, to) = {
        let siblings = siblings_of(forest, active_id)
            .ok_or_else(|| ReorderError::invalid_move("Items not found"))?;
        (
            siblings.iter().position(|n| n.id() == active_id),
            siblings.iter().position(|n| n.id() == over_id),
        )
    };
    let (Some(from), Some(to)) = (from, to) else {
        return Err(ReorderError::invalid_move("Sibling positions not found"));
    };

    let siblings = match &active_parent {
        Some(pid) => match find_mut(forest, pid) {
            Some(parent) => &mut parent.children,
            None => return Err(ReorderError::invalid_move("Parent node not found")),
        },
        None => forest,
    };
    let node = siblings.remove(from);
    siblings.insert(to, node);
    Ok(())
}

fn detach(nodes: &mut Vec<TreeNode>, id: &str) -> Option<TreeNode> {
    if let Some(i) = nodes.iter().position(|node| node.id() == id) {
        return Some(nodes.remove(i));
    }
    nodes.iter_mut().find_map(|node| detach(&mut node.children, id))
}

fn set_levels(nodes: &mut [TreeNode], level: u32) {
    for node in nodes {
        node.level = level;
        set_levels(&mut node.children, level + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(nodes: &[TreeNode]) -> Vec<&str> {
        nodes.iter().map(TreeNode::id).collect()
    }

    /// A(0) [ A1(1) [ A1a(2) ], A2(3) ], B(4) [ B1(5) ], C(6)
    fn sample() -> Vec<LineItem> {
        vec![
            LineItem::new("B1", "B1", Some("B"), 5),
            LineItem::new("A", "A", None, 0),
            LineItem::new("C", "C", None, 6),
            LineItem::new("A2", "A2", Some("A"), 3),
            LineItem::new("A1a", "A1a", Some("A1"), 2),
            LineItem::new("B", "B", None, 4),
            LineItem::new("A1", "A1", Some("A"), 1),
        ]
    }

    #[test]
    fn test_build_orders_by_sort_order() {
        let forest = build(&sample());
        assert_eq!(ids(&forest), vec!["A", "B", "C"]);
        assert_eq!(ids(&forest[0].children), vec!["A1", "A2"]);
        assert_eq!(ids(&forest[0].children[0].children), vec!["A1a"]);
        assert_eq!(forest[0].children[0].children[0].level, 2);
        assert_eq!(len(&forest), 7);
    }

    #[test]
    fn test_orphan_becomes_root() {
        let items = vec![
            LineItem::new("A", "A", None, 0),
            LineItem::new("X", "X", Some("ghost"), 1),
        ];
        let forest = build(&items);
        assert_eq!(ids(&forest), vec!["A", "X"]);
        assert_eq!(forest[1].level, 0);
        assert_eq!(forest[1].item.parent_id.as_deref(), Some("ghost"));
    }

    #[test]
    fn test_parent_cycle_does_not_lose_items() {
        let items = vec![
            LineItem::new("R", "R", None, 0),
            LineItem::new("P", "P", Some("Q"), 1),
            LineItem::new("Q", "Q", Some("P"), 2),
            LineItem::new("S", "S", Some("S"), 3),
        ];
        let forest = build(&items);
        assert_eq!(len(&forest), 4);
        assert_eq!(ids(&forest), vec!["R", "P", "S"]);
        assert_eq!(ids(&forest[1].children), vec!["Q"]);
    }

    #[test]
    fn test_lookup_helpers() {
        let forest = build(&sample());
        assert_eq!(find(&forest, "A1a").map(TreeNode::id), Some("A1a"));
        assert!(find(&forest, "nope").is_none());

        assert_eq!(ids(siblings_of(&forest, "A2").unwrap()), vec!["A1", "A2"]);
        assert_eq!(ids(siblings_of(&forest, "C").unwrap()), vec!["A", "B", "C"]);
        assert!(siblings_of(&forest, "nope").is_none());

        assert_eq!(parent_of(&forest, "A1a").map(TreeNode::id), Some("A1"));
        assert!(parent_of(&forest, "B").is_none());

        assert!(is_descendant(&forest, "A", "A1a"));
        assert!(!is_descendant(&forest, "A1a", "A"));
        assert!(!is_descendant(&forest, "A", "A"));
    }

    #[test]
    fn test_relocate_after_sibling_carries_subtree() {
        let mut forest = build(&sample());
        relocate(&mut forest, "A1", None, Anchor::After("B")).unwrap();

        assert_eq!(ids(&forest), vec!["A", "B", "A1", "C"]);
        assert_eq!(forest[2].item.parent_id, None);
        assert_eq!(forest[2].level, 0);
        assert_eq!(forest[2].children[0].level, 1);
    }

    #[test]
    fn test_relocate_inside_appends() {
        let mut forest = build(&sample());
        relocate(&mut forest, "C", Some("A1"), Anchor::ChildIndex(usize::MAX)).unwrap();

        let a1 = find(&forest, "A1").unwrap();
        assert_eq!(ids(&a1.children), vec!["A1a", "C"]);
        assert_eq!(a1.children[1].level, 2);
        assert_eq!(a1.children[1].item.parent_id.as_deref(), Some("A1"));
    }

    #[test]
    fn test_relocate_rejects_cycle_without_mutation() {
        let mut forest = build(&sample());
        let before = forest.clone();

        let err = relocate(&mut forest, "A", Some("A1a"), Anchor::ChildIndex(0)).unwrap_err();
        assert!(matches!(err, ReorderError::InvalidMove(_)));
        let err = relocate(&mut forest, "A", Some("A"), Anchor::ChildIndex(0)).unwrap_err();
        assert!(matches!(err, ReorderError::InvalidMove(_)));
        assert_eq!(forest, before);
    }

    #[test]
    fn test_relocate_by_global_order_hint() {
        let mut forest = build(&sample());
        relocate(&mut forest, "B1", None, Anchor::GlobalOrder(4)).unwrap();
        assert_eq!(ids(&forest), vec!["A", "B1", "B", "C"]);
    }

    #[test]
    fn test_move_within_siblings() {
        let mut forest = build(&sample());
        move_within_siblings(&mut forest, "A", "C").unwrap();
        assert_eq!(ids(&forest), vec!["B", "C", "A"]);

        let err = move_within_siblings(&mut forest, "A1", "B1").unwrap_err();
        assert_eq!(
            err,
            ReorderError::invalid_move("Items can only be reordered within the same parent")
        );
    }

    #[test]
    fn test_move_within_nested_siblings() {
        let mut forest = build(&sample());
        move_within_siblings(&mut forest, "A2", "A1").unwrap();
        assert_eq!(ids(&forest[0].children), vec!["A2", "A1"]);
        assert_eq!(ids(&forest[0].children[1].children), vec!["A1a"]);

        let err = move_within_siblings(&mut forest, "A1", "nope").unwrap_err();
        assert_eq!(err, ReorderError::invalid_move("Items not found"));
    }
}
