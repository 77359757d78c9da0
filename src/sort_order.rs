//! The global `sort_order` set as a checked value.
//!
//! A `PositionAssignment` always maps each item to exactly one position in
//! `0..N-1` with no repeats; anything else is refused at construction.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ReorderError;
use crate::schema::LineItem;

/// One `(item id -> position)` pair of a batch update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub item_id: String,
    pub position: u32,
}

impl PositionUpdate {
    pub fn new(item_id: impl Into<String>, position: u32) -> Self {
        Self {
            item_id: item_id.into(),
            position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionAssignment {
    updates: Vec<PositionUpdate>,
}

impl PositionAssignment {
    /// Number each item by its index in `items`.
    pub fn from_sequence<'a>(
        items: impl IntoIterator<Item = &'a LineItem>,
    ) -> Result<Self, ReorderError> {
        let updates = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| PositionUpdate::new(item.id.clone(), i as u32))
            .collect();
        Self::from_updates(updates)
    }

    /// Accept caller-built pairs after checking contiguity.
    pub fn from_updates(updates: Vec<PositionUpdate>) -> Result<Self, ReorderError> {
        validate(&updates)?;
        Ok(Self { updates })
    }

    pub fn updates(&self) -> &[PositionUpdate] {
        &self.updates
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// True when every item already sits at its assigned position.
    pub fn matches(&self, items: &[LineItem]) -> bool {
        items.len() == self.updates.len()
            && self.updates.iter().all(|u| {
                items
                    .iter()
                    .any(|item| item.id == u.item_id && item.sort_order == u.position)
            })
    }
}

/// Positions must be exactly `{0, .., len-1}` and item ids must not repeat.
pub fn validate(updates: &[PositionUpdate]) -> Result<(), ReorderError> {
    let n = updates.len();
    let mut seen = vec![false; n];
    let mut ids = HashSet::with_capacity(n);

    for update in updates {
        let pos = update.position as usize;
        if pos >= n {
            return Err(ReorderError::InvalidPayload(format!(
                "position {} for {} is outside 0..{}",
                update.position, update.item_id, n
            )));
        }
        if std::mem::replace(&mut seen[pos], true) {
            return Err(ReorderError::InvalidPayload(format!(
                "duplicate position {}",
                update.position
            )));
        }
        if !ids.insert(update.item_id.as_str()) {
            return Err(ReorderError::InvalidPayload(format!(
                "item {} assigned more than once",
                update.item_id
            )));
        }
    }
    Ok(())
}

/// True when the stored orders of `items` are exactly `0..N-1`.
pub fn is_contiguous(items: &[LineItem]) -> bool {
    let mut seen = vec![false; items.len()];
    items.iter().all(|item| {
        let pos = item.sort_order as usize;
        pos < seen.len() && !std::mem::replace(&mut seen[pos], true)
    })
}
