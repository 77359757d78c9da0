//! Report structure data model.
//!
//! `LineItem` is the stored row; `TreeNode` is the derived, never-persisted
//! view rebuilt on every fetch.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};

/// One row of a report structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Stable opaque id.
    pub id: String,
    /// Human-facing key, unique within a structure.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `None` means root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Global pre-order position; `0..N-1` across the whole structure.
    pub sort_order: u32,
    #[serde(default)]
    pub is_leaf: bool,
    #[serde(default)]
    pub is_calculated: bool,
    #[serde(default = "default_true")]
    pub display: bool,
}

fn default_true() -> bool {
    true
}

impl LineItem {
    pub fn new(
        id: impl Into<String>,
        key: impl Into<String>,
        parent_id: Option<&str>,
        sort_order: u32,
    ) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            description: None,
            parent_id: parent_id.map(str::to_string),
            sort_order,
            is_leaf: false,
            is_calculated: false,
            display: true,
        }
    }

    /// Description if set, otherwise the key.
    pub fn display_name(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.key)
    }
}

/// A line item plus its ordered children.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub item: LineItem,
    /// Depth in the forest, 0 for roots.
    pub level: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn id(&self) -> &str {
        &self.item.id
    }

    /// Number of nodes in this subtree, including this one.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(TreeNode::subtree_len).sum::<usize>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Before,
    After,
    Inside,
}

impl Placement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
            Self::Inside => "inside",
        }
    }
}

/// A drag-and-drop action from the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub dragged_id: String,
    pub reference_id: String,
    pub placement: Placement,
}

impl MoveRequest {
    pub fn new(dragged_id: &str, reference_id: &str, placement: Placement) -> Self {
        Self {
            dragged_id: dragged_id.to_string(),
            reference_id: reference_id.to_string(),
            placement,
        }
    }
}

/// Where the store should put the moved item.
///
/// `target_position` is a child index for `Inside` and a global `sort_order`
/// hint for `Before` / `After`; `placement` and `reference_id` travel along so
/// the store can tell the two apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovePlan {
    pub moved_item_id: String,
    pub new_parent_id: Option<String>,
    pub target_position: u32,
    pub placement: Placement,
    pub reference_id: String,
}
