//! Move orchestration for one report structure.
//!
//! A session owns the forest built from the last fetch. Each mutation walks
//! `Planning -> Persisting -> Committed | Failed`, or `Planning -> Rejected`
//! when the move is impossible. A commit always discards the local forest in
//! favour of a fresh fetch.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::ReorderError;
use crate::flatten;
use crate::persist::{OrderPersistor, PersistSummary};
use crate::planner;
use crate::schema::{LineItem, MovePlan, MoveRequest, Placement, TreeNode};
use crate::sort_order::{self, PositionAssignment};
use crate::store::{LineItemStore, ReparentRequest};
use crate::tree::{self, Anchor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveState {
    Idle,
    Planning,
    Persisting,
    Committed,
    Failed,
    Rejected,
}

/// A committed hierarchical move and the authoritative forest fetched after it.
#[derive(Debug, Clone, Serialize)]
pub struct MoveCommit {
    pub move_id: Uuid,
    pub state: MoveState,
    pub plan: MovePlan,
    pub affected_count: Option<usize>,
    pub message: Option<String>,
    pub forest: Vec<TreeNode>,
}

/// A committed batch renumbering.
#[derive(Debug, Clone, Serialize)]
pub struct BatchCommit {
    pub move_id: Uuid,
    pub state: MoveState,
    #[serde(flatten)]
    pub summary: PersistSummary,
    pub forest: Vec<TreeNode>,
}

pub struct ReorderSession<S: LineItemStore + ?Sized> {
    store: Arc<S>,
    persistor: OrderPersistor<S>,
    structure_id: String,
    forest: Vec<TreeNode>,
    state: MoveState,
}

impl<S: LineItemStore + ?Sized> ReorderSession<S> {
    /// Fetch the structure and build its forest.
    pub async fn open(
        store: Arc<S>,
        config: &EngineConfig,
        structure_id: &str,
    ) -> Result<Self, ReorderError> {
        let mut session = Self {
            persistor: OrderPersistor::new(store.clone(), config),
            store,
            structure_id: structure_id.to_string(),
            forest: Vec::new(),
            state: MoveState::Idle,
        };
        session.refresh().await?;
        Ok(session)
    }

    pub fn state(&self) -> MoveState {
        self.state
    }

    #[cfg(test)]
    pub fn forest(&self) -> &[TreeNode] {
        &self.forest
    }

    pub fn into_forest(self) -> Vec<TreeNode> {
        self.forest
    }

    /// Replace the forest with the store's current state.
    pub async fn refresh(&mut self) -> Result<(), ReorderError> {
        let items = self
            .store
            .fetch_line_items(&self.structure_id)
            .await
            .map_err(|e| {
                error!("Failed to fetch line items for {}: {:#}", self.structure_id, e);
                ReorderError::store(e)
            })?;
        if !sort_order::is_contiguous(&items) {
            warn!(
                "Structure {} has gapped or duplicate sort orders; normalize to repair",
                self.structure_id
            );
        }
        debug!("Rebuilding forest for {} from {} items", self.structure_id, items.len());
        self.forest = tree::build(&items);
        Ok(())
    }

    /// Apply `request` to a copy of the forest and return the resulting
    /// sequence with positions `0..N-1`. Nothing is persisted.
    pub fn preview(&self, request: &MoveRequest) -> Result<Vec<LineItem>, ReorderError> {
        let plan = planner::plan(&self.forest, request)?;
        let mut forest = self.forest.clone();
        let anchor = match plan.placement {
            Placement::Before => Anchor::Before(&plan.reference_id),
            Placement::After => Anchor::After(&plan.reference_id),
            Placement::Inside => Anchor::ChildIndex(plan.target_position as usize),
        };
        tree::relocate(
            &mut forest,
            &plan.moved_item_id,
            plan.new_parent_id.as_deref(),
            anchor,
        )?;
        Ok(flatten::renumber(&forest, true))
    }

    /// Plan a drag-and-drop move and hand it to the store's reparent
    /// procedure. No retry at this layer.
    pub async fn submit_move(&mut self, request: &MoveRequest) -> Result<MoveCommit, ReorderError> {
        let move_id = Uuid::new_v4();
        self.transition(move_id, MoveState::Planning);

        let plan = match planner::plan(&self.forest, request) {
            Ok(plan) => plan,
            Err(e) => {
                info!("Move {} rejected: {}", move_id, e);
                self.transition(move_id, MoveState::Rejected);
                return Err(e);
            }
        };

        self.transition(move_id, MoveState::Persisting);
        let result = self
            .store
            .reparent_and_reposition(&self.structure_id, &ReparentRequest::from(&plan))
            .await;

        let result = match result {
            Ok(result) if result.success => result,
            Ok(result) => {
                let err = ReorderError::PersistenceFailure {
                    error: result
                        .error
                        .or_else(|| result.message.clone())
                        .unwrap_or_else(|| "reparent procedure reported failure".to_string()),
                    message: result.message,
                    attempts: 1,
                };
                warn!("Move {} failed: {}", move_id, err);
                self.transition(move_id, MoveState::Failed);
                return Err(err);
            }
            Err(e) => {
                let err = ReorderError::store(e);
                warn!("Move {} failed: {}", move_id, err);
                self.transition(move_id, MoveState::Failed);
                return Err(err);
            }
        };

        self.transition(move_id, MoveState::Committed);
        self.refresh().await?;

        Ok(MoveCommit {
            move_id,
            state: self.state,
            plan,
            affected_count: result.affected_count,
            message: result.message,
            forest: self.forest.clone(),
        })
    }

    /// Swap `active_id` into `over_id`'s slot among their shared siblings and
    /// persist the whole structure's order through the batch path.
    pub async fn reorder_within_parent(
        &mut self,
        active_id: &str,
        over_id: &str,
    ) -> Result<BatchCommit, ReorderError> {
        let move_id = Uuid::new_v4();
        self.transition(move_id, MoveState::Planning);

        let mut forest = self.forest.clone();
        if let Err(e) = tree::move_within_siblings(&mut forest, active_id, over_id) {
            info!("Move {} rejected: {}", move_id, e);
            self.transition(move_id, MoveState::Rejected);
            return Err(e);
        }

        let ordered = flatten::flatten(&forest, true);
        self.persist_batch(move_id, &ordered).await
    }

    /// Rewrite stored orders as a contiguous pre-order of the current forest.
    /// Skips the store when the orders are already correct.
    pub async fn normalize(&mut self) -> Result<BatchCommit, ReorderError> {
        let move_id = Uuid::new_v4();
        self.transition(move_id, MoveState::Planning);

        let forest = self.forest.clone();
        let ordered = flatten::flatten(&forest, false);
        let assignment = PositionAssignment::from_sequence(ordered.iter().copied())?;
        let current: Vec<LineItem> = ordered.iter().map(|item| (*item).clone()).collect();
        if assignment.matches(&current) {
            debug!("Structure {} already has contiguous order", self.structure_id);
            self.transition(move_id, MoveState::Idle);
            return Ok(BatchCommit {
                move_id,
                state: self.state,
                summary: PersistSummary {
                    updated_count: 0,
                    attempts: 0,
                },
                forest,
            });
        }

        self.persist_batch(move_id, &ordered).await
    }

    async fn persist_batch(
        &mut self,
        move_id: Uuid,
        ordered: &[&LineItem],
    ) -> Result<BatchCommit, ReorderError> {
        self.transition(move_id, MoveState::Persisting);
        match self
            .persistor
            .persist_with_timeout(&self.structure_id, ordered)
            .await
        {
            Ok(summary) => {
                self.transition(move_id, MoveState::Committed);
                self.refresh().await?;
                Ok(BatchCommit {
                    move_id,
                    state: self.state,
                    summary,
                    forest: self.forest.clone(),
                })
            }
            Err(e) => {
                warn!("Move {} failed: {}", move_id, e);
                self.transition(move_id, MoveState::Failed);
                Err(e)
            }
        }
    }

    fn transition(&mut self, move_id: Uuid, next: MoveState) {
        debug!(
            "Move {} on structure {}: {:?} -> {:?}",
            move_id, self.structure_id, self.state, next
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort_order::is_contiguous;
    use crate::store::testing::{Failure, RecordingStore};

    const SID: &str = "structure-1";

    /// A(0) [ A1(1) [ A1a(2) ], A2(3) ], B(4) [ B1(5) ], C(6)
    fn items() -> Vec<LineItem> {
        vec![
            LineItem::new("A", "A", None, 0),
            LineItem::new("A1", "A1", Some("A"), 1),
            LineItem::new("A1a", "A1a", Some("A1"), 2),
            LineItem::new("A2", "A2", Some("A"), 3),
            LineItem::new("B", "B", None, 4),
            LineItem::new("B1", "B1", Some("B"), 5),
            LineItem::new("C", "C", None, 6),
        ]
    }

    async fn session(store: &Arc<RecordingStore>) -> ReorderSession<RecordingStore> {
        ReorderSession::open(store.clone(), &EngineConfig::default(), SID)
            .await
            .unwrap()
    }

    fn preorder_ids(forest: &[TreeNode]) -> Vec<String> {
        flatten::flatten(forest, true)
            .into_iter()
            .map(|item| item.id.clone())
            .collect()
    }

    /// Stored orders are `0..N-1` and rise strictly along the rebuilt pre-order.
    async fn assert_consistent(store: &RecordingStore) {
        let stored = store.inner.snapshot(SID).await.unwrap();
        assert!(is_contiguous(&stored), "gapped or duplicate orders: {:?}", stored);
        let forest = tree::build(&stored);
        let orders: Vec<u32> = flatten::flatten(&forest, true)
            .iter()
            .map(|item| item.sort_order)
            .collect();
        assert!(orders.windows(2).all(|w| w[0] < w[1]), "{:?}", orders);
    }

    #[tokio::test]
    async fn test_sequence_of_moves_keeps_invariants() {
        let store = RecordingStore::with_items(SID, items()).await;
        let mut session = session(&store).await;

        let moves = [
            MoveRequest::new("C", "A1", Placement::Inside),
            MoveRequest::new("A", "B1", Placement::After),
            MoveRequest::new("A1a", "B", Placement::Before),
            MoveRequest::new("B1", "A2", Placement::Inside),
            MoveRequest::new("A2", "A1a", Placement::After),
        ];
        for request in &moves {
            let commit = session.submit_move(request).await.unwrap();
            assert_eq!(session.state(), MoveState::Committed);
            assert_eq!(commit.state, MoveState::Committed);
            assert_eq!(commit.forest, session.forest());
            assert_eq!(tree::len(session.forest()), 7);
            assert_consistent(&store).await;
        }

        assert_eq!(
            preorder_ids(session.forest()),
            vec!["A1a", "A2", "B1", "B", "A", "A1", "C"]
        );
        assert_eq!(store.reparent_count(), moves.len());
        assert_eq!(store.fetch_count(), moves.len() + 1);
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_without_store_call() {
        let store = RecordingStore::with_items(SID, items()).await;
        let mut session = session(&store).await;

        for request in [
            MoveRequest::new("A", "A1a", Placement::Inside),
            MoveRequest::new("A", "A1a", Placement::After),
            MoveRequest::new("A1", "A1a", Placement::Before),
        ] {
            let err = session.submit_move(&request).await.unwrap_err();
            assert!(matches!(err, ReorderError::InvalidMove(_)), "{:?}", err);
            assert_eq!(session.state(), MoveState::Rejected);
        }
        assert_eq!(store.reparent_count(), 0);
        assert_eq!(store.fetch_count(), 1);
        assert_eq!(store.inner.snapshot(SID).await.unwrap(), items());
    }

    #[tokio::test]
    async fn test_procedure_failure_surfaces_its_fields() {
        let store = RecordingStore::with_items(SID, items()).await;
        store.fail_reparent(Failure::Rejected("lock timeout".to_string()));
        let mut session = session(&store).await;
        let before = session.forest().to_vec();

        let err = session
            .submit_move(&MoveRequest::new("C", "A", Placement::Before))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ReorderError::PersistenceFailure {
                error: "lock timeout".to_string(),
                message: Some("procedure rolled back".to_string()),
                attempts: 1,
            }
        );
        assert_eq!(session.state(), MoveState::Failed);
        assert_eq!(store.reparent_count(), 1);
        assert_eq!(session.forest(), before.as_slice());
    }

    #[tokio::test]
    async fn test_transport_error_fails_move() {
        let store = RecordingStore::with_items(SID, items()).await;
        store.fail_reparent(Failure::Network("connection refused".to_string()));
        let mut session = session(&store).await;

        let err = session
            .submit_move(&MoveRequest::new("C", "A", Placement::Before))
            .await
            .unwrap_err();
        assert!(matches!(err, ReorderError::PersistenceFailure { .. }));
        assert_eq!(session.state(), MoveState::Failed);
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_preview_matches_committed_order() {
        let store = RecordingStore::with_items(SID, items()).await;
        let mut session = session(&store).await;
        let request = MoveRequest::new("A1", "C", Placement::After);

        let preview = session.preview(&request).unwrap();
        let preview_ids: Vec<&str> = preview.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(preview_ids, vec!["A", "A2", "B", "B1", "C", "A1", "A1a"]);
        assert!(is_contiguous(&preview));
        assert_eq!(store.reparent_count(), 0);

        let commit = session.submit_move(&request).await.unwrap();
        assert_eq!(preorder_ids(&commit.forest), preview_ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reorder_within_parent_uses_batch_path() {
        let store = RecordingStore::with_items(SID, items()).await;
        store.fail_batch(Failure::Network("transient".to_string()));
        let mut session = session(&store).await;

        let commit = session.reorder_within_parent("A", "C").await.unwrap();
        assert_eq!(commit.summary.attempts, 2);
        assert_eq!(commit.summary.updated_count, 7);
        assert_eq!(session.state(), MoveState::Committed);
        assert_eq!(
            preorder_ids(session.forest()),
            vec!["B", "B1", "C", "A", "A1", "A1a", "A2"]
        );
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn test_reorder_within_parent_rejects_cousins() {
        let store = RecordingStore::with_items(SID, items()).await;
        let mut session = session(&store).await;

        let err = session.reorder_within_parent("A1", "B1").await.unwrap_err();
        assert!(matches!(err, ReorderError::InvalidMove(_)));
        assert_eq!(session.state(), MoveState::Rejected);
        assert_eq!(store.batch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_is_outcome_unknown() {
        let store = RecordingStore::with_items(SID, items()).await;
        store.delay_batch(std::time::Duration::from_secs(60));
        let mut session = session(&store).await;

        let err = session.reorder_within_parent("B", "A").await.unwrap_err();
        assert!(matches!(err, ReorderError::Timeout(_)));
        assert_eq!(session.state(), MoveState::Failed);
    }

    #[tokio::test]
    async fn test_normalize_repairs_gaps() {
        let gapped = vec![
            LineItem::new("A", "A", None, 10),
            LineItem::new("A1", "A1", Some("A"), 15),
            LineItem::new("B", "B", None, 3),
            LineItem::new("B1", "B1", Some("B"), 30),
        ];
        let store = RecordingStore::with_items(SID, gapped).await;
        let mut session = session(&store).await;

        let commit = session.normalize().await.unwrap();
        assert_eq!(commit.state, MoveState::Committed);
        assert_eq!(commit.summary.attempts, 1);
        assert_eq!(preorder_ids(&commit.forest), vec!["B", "B1", "A", "A1"]);
        assert_consistent(&store).await;

        let again = session.normalize().await.unwrap();
        assert_eq!(again.summary.attempts, 0);
        assert_eq!(again.state, MoveState::Idle);
        assert_eq!(store.batch_count(), 1);
    }
}
