//! Durable write of a full `sort_order` assignment.
//!
//! One atomic batch call per attempt, one retry after a short fixed delay, and
//! an optional deadline around the whole thing.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::ReorderError;
use crate::schema::LineItem;
use crate::sort_order::{PositionAssignment, PositionUpdate};
use crate::store::LineItemStore;

const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistSummary {
    pub updated_count: usize,
    /// Store calls made, 0 when there was nothing to write.
    pub attempts: u32,
}

/// A failed attempt: the error text and the store's own message, if any.
type AttemptError = (String, Option<String>);

pub struct OrderPersistor<S: LineItemStore + ?Sized> {
    store: Arc<S>,
    retry_delay: Duration,
    deadline: Duration,
}

impl<S: LineItemStore + ?Sized> OrderPersistor<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        Self {
            store,
            retry_delay: config.retry_delay(),
            deadline: config.persist_timeout(),
        }
    }

    /// Persist `ordered` so that each item's position is its index.
    pub async fn persist(
        &self,
        structure_id: &str,
        ordered: &[&LineItem],
    ) -> Result<PersistSummary, ReorderError> {
        let assignment = PositionAssignment::from_sequence(ordered.iter().copied())
            .map_err(|e| reject_payload(structure_id, e))?;
        self.persist_assignment(structure_id, &assignment).await
    }

    /// Persist caller-built pairs. The pairs are validated before any call.
    pub async fn persist_updates(
        &self,
        structure_id: &str,
        updates: Vec<PositionUpdate>,
    ) -> Result<PersistSummary, ReorderError> {
        let assignment = PositionAssignment::from_updates(updates)
            .map_err(|e| reject_payload(structure_id, e))?;
        self.persist_assignment(structure_id, &assignment).await
    }

    /// [`persist`](Self::persist) raced against the configured deadline.
    ///
    /// On `Timeout` the batch may still commit server-side; re-fetch to learn
    /// the real state.
    pub async fn persist_with_timeout(
        &self,
        structure_id: &str,
        ordered: &[&LineItem],
    ) -> Result<PersistSummary, ReorderError> {
        match tokio::time::timeout(self.deadline, self.persist(structure_id, ordered)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Sort order update for structure {} exceeded {:?}; outcome unknown",
                    structure_id, self.deadline
                );
                Err(ReorderError::Timeout(self.deadline))
            }
        }
    }

    async fn persist_assignment(
        &self,
        structure_id: &str,
        assignment: &PositionAssignment,
    ) -> Result<PersistSummary, ReorderError> {
        if assignment.is_empty() {
            debug!("Structure {} has no line items, nothing to persist", structure_id);
            return Ok(PersistSummary {
                updated_count: 0,
                attempts: 0,
            });
        }

        info!(
            "Updating sort order for {} items in structure {} via {}",
            assignment.len(),
            structure_id,
            self.store.name()
        );

        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.attempt(structure_id, assignment).await {
                Ok(updated_count) => {
                    info!(
                        "Sort order update committed for structure {} ({} items, attempt {})",
                        structure_id, updated_count, attempt
                    );
                    return Ok(PersistSummary {
                        updated_count,
                        attempts: attempt,
                    });
                }
                Err((err, message)) => {
                    if attempt < MAX_ATTEMPTS {
                        warn!("Atomic sort order update failed, retrying once: {}", err);
                    }
                    last_error = Some((err, message));
                }
            }
        }

        let (err, message) = last_error.unwrap_or_else(|| {
            ("Unknown error from update_sort_orders_transaction".to_string(), None)
        });
        error!(
            "Atomic sort order update failed definitively for structure {}: {}",
            structure_id, err
        );
        Err(ReorderError::PersistenceFailure {
            error: err,
            message,
            attempts: MAX_ATTEMPTS,
        })
    }

    async fn attempt(
        &self,
        structure_id: &str,
        assignment: &PositionAssignment,
    ) -> Result<usize, AttemptError> {
        let expected = assignment.len();
        match self
            .store
            .batch_update_positions(structure_id, assignment.updates())
            .await
        {
            Ok(result) if result.success => {
                let updated = result.updated_count.unwrap_or(expected);
                if updated < expected {
                    Err((
                        format!("store applied {} of {} positions", updated, expected),
                        result.message,
                    ))
                } else {
                    Ok(updated)
                }
            }
            Ok(result) => Err((
                result
                    .error
                    .or_else(|| result.message.clone())
                    .unwrap_or_else(|| "store reported failure without detail".to_string()),
                result.message,
            )),
            Err(e) => Err((format!("{:#}", e), None)),
        }
    }
}

fn reject_payload(structure_id: &str, err: ReorderError) -> ReorderError {
    error!("Invalid sort order payload for structure {}: {}", structure_id, err);
    err
}
