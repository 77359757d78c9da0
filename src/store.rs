//! External store abstraction.
//!
//! Defines the [`LineItemStore`] trait with the three operations the engine
//! needs, plus [`InMemoryStore`], a transactional in-process implementation
//! used when Supabase is not configured.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::flatten;
use crate::schema::{LineItem, MovePlan, Placement};
use crate::sort_order::{self, PositionUpdate};
use crate::tree::{self, Anchor};

/// Result of the atomic batch position update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchUpdateResult {
    pub success: bool,
    #[serde(default)]
    pub updated_count: Option<usize>,
    #[serde(default)]
    pub total_count: Option<usize>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl BatchUpdateResult {
    pub fn applied(count: usize) -> Self {
        Self {
            success: true,
            updated_count: Some(count),
            total_count: Some(count),
            ..Default::default()
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Arguments of the hierarchical reparent-and-reposition procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReparentRequest {
    pub moved_item_id: String,
    pub new_parent_id: Option<String>,
    pub target_position: u32,
    pub drop_position: Option<Placement>,
    pub target_sibling_id: Option<String>,
}

impl From<&MovePlan> for ReparentRequest {
    fn from(plan: &MovePlan) -> Self {
        let target_sibling_id = match plan.placement {
            Placement::Inside => None,
            Placement::Before | Placement::After => Some(plan.reference_id.clone()),
        };
        Self {
            moved_item_id: plan.moved_item_id.clone(),
            new_parent_id: plan.new_parent_id.clone(),
            target_position: plan.target_position,
            drop_position: Some(plan.placement),
            target_sibling_id,
        }
    }
}

impl ReparentRequest {
    /// Requests built from a `MovePlan` always carry a placement. Without one
    /// (callers passing only a position) `target_position` is read as a raw
    /// global order hint among the new siblings.
    fn anchor(&self) -> Anchor<'_> {
        match (self.drop_position, self.target_sibling_id.as_deref()) {
            (Some(Placement::Before), Some(sibling)) => Anchor::Before(sibling),
            (Some(Placement::After), Some(sibling)) => Anchor::After(sibling),
            (Some(Placement::Inside), _) => Anchor::ChildIndex(self.target_position as usize),
            _ => Anchor::GlobalOrder(self.target_position),
        }
    }
}

/// Result of the reparent procedure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReparentResult {
    pub success: bool,
    #[serde(default)]
    pub affected_count: Option<usize>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ReparentResult {
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// The hosted relational store. Each mutating call either fully commits or
/// fully fails; a `success: false` result means nothing was written.
#[async_trait::async_trait]
pub trait LineItemStore: Send + Sync {
    fn name(&self) -> &str;

    /// All items of a structure. Callers must not assume any ordering.
    async fn fetch_line_items(&self, structure_id: &str) -> Result<Vec<LineItem>>;

    /// Atomically set every item's `sort_order`. Must reject a pair set that
    /// is not a contiguous `0..N-1` assignment for the current item count.
    async fn batch_update_positions(
        &self,
        structure_id: &str,
        updates: &[PositionUpdate],
    ) -> Result<BatchUpdateResult>;

    /// Atomically change the parent pointer and renumber the structure so
    /// that orders stay contiguous and consistent with pre-order.
    async fn reparent_and_reposition(
        &self,
        structure_id: &str,
        request: &ReparentRequest,
    ) -> Result<ReparentResult>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    structures: Arc<RwLock<HashMap<String, Vec<LineItem>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a JSON file shaped `{ "structure_id": [line items] }`.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file: {:?}", path))?;
        let structures: HashMap<String, Vec<LineItem>> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse seed file: {:?}", path))?;
        info!("Seeded {} structures from {:?}", structures.len(), path);
        Ok(Self {
            structures: Arc::new(RwLock::new(structures)),
        })
    }

    pub async fn insert_structure(&self, structure_id: &str, items: Vec<LineItem>) {
        self.structures
            .write()
            .await
            .insert(structure_id.to_string(), items);
    }

    pub async fn snapshot(&self, structure_id: &str) -> Option<Vec<LineItem>> {
        self.structures.read().await.get(structure_id).cloned()
    }
}

#[async_trait::async_trait]
impl LineItemStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_line_items(&self, structure_id: &str) -> Result<Vec<LineItem>> {
        Ok(self
            .structures
            .read()
            .await
            .get(structure_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn batch_update_positions(
        &self,
        structure_id: &str,
        updates: &[PositionUpdate],
    ) -> Result<BatchUpdateResult> {
        let mut structures = self.structures.write().await;
        let Some(items) = structures.get_mut(structure_id) else {
            return Ok(BatchUpdateResult::rejected(format!(
                "structure {} not found",
                structure_id
            )));
        };

        if updates.len() != items.len() {
            return Ok(BatchUpdateResult::rejected(format!(
                "expected {} positions, got {}",
                items.len(),
                updates.len()
            )));
        }
        if let Err(e) = sort_order::validate(updates) {
            return Ok(BatchUpdateResult::rejected(e.to_string()));
        }
        let positions: HashMap<&str, u32> = updates
            .iter()
            .map(|u| (u.item_id.as_str(), u.position))
            .collect();
        if let Some(missing) = items.iter().find(|item| !positions.contains_key(item.id.as_str())) {
            return Ok(BatchUpdateResult::rejected(format!(
                "line item {} has no position",
                missing.id
            )));
        }

        for item in items.iter_mut() {
            item.sort_order = positions[item.id.as_str()];
        }
        debug!("Applied {} positions to structure {}", updates.len(), structure_id);
        Ok(BatchUpdateResult::applied(updates.len()))
    }

    async fn reparent_and_reposition(
        &self,
        structure_id: &str,
        request: &ReparentRequest,
    ) -> Result<ReparentResult> {
        let mut structures = self.structures.write().await;
        let Some(items) = structures.get_mut(structure_id) else {
            return Ok(ReparentResult::rejected(format!(
                "structure {} not found",
                structure_id
            )));
        };

        let mut forest = tree::build(items);
        if let Err(e) = tree::relocate(
            &mut forest,
            &request.moved_item_id,
            request.new_parent_id.as_deref(),
            request.anchor(),
        ) {
            return Ok(ReparentResult::rejected(e.to_string()));
        }

        let renumbered = flatten::renumber(&forest, true);
        let affected = renumbered
            .iter()
            .filter(|new| {
                items
                    .iter()
                    .find(|old| old.id == new.id)
                    .map(|old| old.sort_order != new.sort_order || old.parent_id != new.parent_id)
                    .unwrap_or(true)
            })
            .count();
        *items = renumbered;

        debug!(
            "Moved {} in structure {} ({} rows affected)",
            request.moved_item_id, structure_id, affected
        );
        Ok(ReparentResult {
            success: true,
            affected_count: Some(affected),
            message: Some(format!("Moved line item {}", request.moved_item_id)),
            error: None,
        })
    }
}

// ============================================================================
// Test support
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MoveRequest;
    use crate::{planner, sort_order::is_contiguous};

    const SID: &str = "structure-1";

    /// A(0) [ A1(1), A2(2) ], B(3) [ B1(4) ], C(5)
    fn items() -> Vec<LineItem> {
        vec![
            LineItem::new("A", "A", None, 0),
            LineItem::new("A1", "A1", Some("A"), 1),
            LineItem::new("A2", "A2", Some("A"), 2),
            LineItem::new("B", "B", None, 3),
            LineItem::new("B1", "B1", Some("B"), 4),
            LineItem::new("C", "C", None, 5),
        ]
    }

    async fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.insert_structure(SID, items()).await;
        store
    }

    fn order_of(items: &[LineItem]) -> Vec<&str> {
        let mut sorted: Vec<&LineItem> = items.iter().collect();
        sorted.sort_by_key(|item| item.sort_order);
        sorted.into_iter().map(|item| item.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_batch_update_applies_and_is_idempotent() {
        let store = store().await;
        let updates: Vec<PositionUpdate> = ["C", "A", "A1", "A2", "B", "B1"]
            .iter()
            .enumerate()
            .map(|(i, id)| PositionUpdate::new(*id, i as u32))
            .collect();

        let first = store.batch_update_positions(SID, &updates).await.unwrap();
        assert_eq!(first, BatchUpdateResult::applied(6));
        let after_first = store.snapshot(SID).await.unwrap();

        let second = store.batch_update_positions(SID, &updates).await.unwrap();
        assert!(second.success);
        assert_eq!(store.snapshot(SID).await.unwrap(), after_first);
        assert_eq!(order_of(&after_first), vec!["C", "A", "A1", "A2", "B", "B1"]);
    }

    #[tokio::test]
    async fn test_batch_update_rejects_incomplete_sets_atomically() {
        let store = store().await;
        let short = vec![PositionUpdate::new("A", 0), PositionUpdate::new("B", 1)];
        let result = store.batch_update_positions(SID, &short).await.unwrap();
        assert!(!result.success);

        let mut unknown: Vec<PositionUpdate> = ["A", "A1", "A2", "B", "B1"]
            .iter()
            .enumerate()
            .map(|(i, id)| PositionUpdate::new(*id, i as u32))
            .collect();
        unknown.push(PositionUpdate::new("Z", 5));
        let result = store.batch_update_positions(SID, &unknown).await.unwrap();
        assert!(!result.success);

        assert_eq!(store.snapshot(SID).await.unwrap(), items());
    }

    #[tokio::test]
    async fn test_reparent_keeps_orders_contiguous() {
        let store = store().await;
        let forest = tree::build(&items());
        let plan = planner::plan(&forest, &MoveRequest::new("A", "B1", Placement::After)).unwrap();

        let result = store
            .reparent_and_reposition(SID, &ReparentRequest::from(&plan))
            .await
            .unwrap();
        assert!(result.success, "{:?}", result);

        let stored = store.snapshot(SID).await.unwrap();
        assert!(is_contiguous(&stored));
        assert_eq!(order_of(&stored), vec!["B", "B1", "A", "A1", "A2", "C"]);
        let a = stored.iter().find(|item| item.id == "A").unwrap();
        assert_eq!(a.parent_id.as_deref(), Some("B"));
        assert_eq!(result.affected_count, Some(5));
    }

    #[tokio::test]
    async fn test_reparent_inside_appends_last_child() {
        let store = store().await;
        let request = ReparentRequest {
            moved_item_id: "C".to_string(),
            new_parent_id: Some("A".to_string()),
            target_position: 2,
            drop_position: Some(Placement::Inside),
            target_sibling_id: None,
        };
        let result = store.reparent_and_reposition(SID, &request).await.unwrap();
        assert!(result.success);
        assert_eq!(
            order_of(&store.snapshot(SID).await.unwrap()),
            vec!["A", "A1", "A2", "C", "B", "B1"]
        );
    }

    #[tokio::test]
    async fn test_reparent_without_placement_uses_order_hint() {
        let store = store().await;
        let request = ReparentRequest {
            moved_item_id: "A1".to_string(),
            new_parent_id: None,
            target_position: 3,
            drop_position: None,
            target_sibling_id: None,
        };
        let result = store.reparent_and_reposition(SID, &request).await.unwrap();
        assert!(result.success, "{:?}", result);

        let stored = store.snapshot(SID).await.unwrap();
        assert!(is_contiguous(&stored));
        assert_eq!(order_of(&stored), vec!["A", "A2", "A1", "B", "B1", "C"]);
        let a1 = stored.iter().find(|item| item.id == "A1").unwrap();
        assert_eq!(a1.parent_id, None);
    }

    #[tokio::test]
    async fn test_reparent_refuses_cycle() {
        let store = store().await;
        let request = ReparentRequest {
            moved_item_id: "A".to_string(),
            new_parent_id: Some("A1".to_string()),
            target_position: 0,
            drop_position: Some(Placement::Inside),
            target_sibling_id: None,
        };
        let result = store.reparent_and_reposition(SID, &request).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("cycle"));
        assert_eq!(store.snapshot(SID).await.unwrap(), items());
    }

    #[tokio::test]
    async fn test_unknown_structure() {
        let store = InMemoryStore::new();
        assert!(store.fetch_line_items("nope").await.unwrap().is_empty());
        let result = store
            .batch_update_positions("nope", &[PositionUpdate::new("a", 0)])
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_seed_file_round_trip() {
        let path = std::env::temp_dir().join(format!("seed-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"s1": [{"id": "a", "key": "1000", "sort_order": 0}]}"#,
        )
        .unwrap();
        let store = InMemoryStore::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let items = store.fetch_line_items("s1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, "1000");
    }
}
