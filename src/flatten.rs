//! Pre-order serialization of the forest back into a flat sequence.
//!
//! The index of each item in the output is the position it should receive.

use crate::schema::{LineItem, TreeNode};

/// Visit each node, then its children, for every root in order.
///
/// With `preserve_array_order` the current in-memory child order is kept (use
/// right after a splice). Without it each level is sorted by `sort_order`
/// first (use on initial load).
pub fn flatten(forest: &[TreeNode], preserve_array_order: bool) -> Vec<&LineItem> {
    fn traverse<'a>(nodes: &'a [TreeNode], preserve: bool, out: &mut Vec<&'a LineItem>) {
        let mut level: Vec<&TreeNode> = nodes.iter().collect();
        if !preserve {
            level.sort_by_key(|node| node.item.sort_order);
        }
        for node in level {
            out.push(&node.item);
            traverse(&node.children, preserve, out);
        }
    }

    let mut flattened = Vec::with_capacity(crate::tree::len(forest));
    traverse(forest, preserve_array_order, &mut flattened);
    flattened
}

/// Flatten and rewrite `sort_order` to each item's index.
pub fn renumber(forest: &[TreeNode], preserve_array_order: bool) -> Vec<LineItem> {
    flatten(forest, preserve_array_order)
        .into_iter()
        .enumerate()
        .map(|(i, item)| LineItem {
            sort_order: i as u32,
            ..item.clone()
        })
        .collect()
}
