//! Turns a drag-and-drop request into a move plan without touching storage.

use tracing::debug;

use crate::error::ReorderError;
use crate::schema::{MovePlan, MoveRequest, Placement, TreeNode};
use crate::tree;

/// Compute the new parent and position hint for `request`.
///
/// - `Inside` appends as the reference's last child.
/// - `Before` / `After` keep the reference's level and pass its global
///   `sort_order` (or `sort_order + 1`) as the position hint.
///
/// Fails with `InvalidMove` when either node is missing, when the node is
/// dropped on itself, or when the move would make it its own ancestor.
pub fn plan(forest: &[TreeNode], request: &MoveRequest) -> Result<MovePlan, ReorderError> {
    let MoveRequest {
        dragged_id,
        reference_id,
        placement,
    } = request;

    if dragged_id == reference_id {
        return Err(ReorderError::invalid_move(format!(
            "line item {} cannot be dropped on itself",
            dragged_id
        )));
    }
    if tree::find(forest, dragged_id).is_none() {
        return Err(ReorderError::invalid_move(format!(
            "dragged line item {} not found",
            dragged_id
        )));
    }
    let reference = tree::find(forest, reference_id).ok_or_else(|| {
        ReorderError::invalid_move(format!("reference line item {} not found", reference_id))
    })?;

    let (new_parent_id, target_position) = match placement {
        Placement::Inside => (
            Some(reference.id().to_string()),
            reference.children.len() as u32,
        ),
        Placement::Before | Placement::After => {
            let parent = tree::parent_of(forest, reference_id).map(|p| p.id().to_string());
            let order = reference.item.sort_order;
            let position = if *placement == Placement::After {
                order.checked_add(1).ok_or_else(|| {
                    ReorderError::invalid_move(format!(
                        "no position after {}: sort_order {} is at the maximum",
                        reference_id, order
                    ))
                })?
            } else {
                order
            };
            (parent, position)
        }
    };

    if let Some(pid) = &new_parent_id {
        if pid == dragged_id {
            return Err(ReorderError::invalid_move(format!(
                "line item {} cannot become its own parent",
                dragged_id
            )));
        }
        if tree::is_descendant(forest, dragged_id, pid) {
            return Err(ReorderError::invalid_move(format!(
                "moving {} under its descendant {} would create a cycle",
                dragged_id, pid
            )));
        }
    }

    debug!(
        "Planned move of {} {} '{}': parent={:?} position={}",
        dragged_id,
        placement.as_str(),
        reference.item.display_name(),
        new_parent_id,
        target_position
    );

    Ok(MovePlan {
        moved_item_id: dragged_id.clone(),
        new_parent_id,
        target_position,
        placement: *placement,
        reference_id: reference_id.clone(),
    })
}
