//! Supabase (PostgREST) implementation of the line item store.

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, RequestBuilder};
use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::schema::LineItem;
use crate::sort_order::PositionUpdate;
use crate::store::{BatchUpdateResult, LineItemStore, ReparentRequest, ReparentResult};

const BATCH_UPDATE_FN: &str = "update_sort_orders_transaction";
const REPARENT_FN: &str = "reorder_line_item_with_hierarchy";

/// Supabase client configuration.
#[derive(Clone)]
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    service_role_key: String,
    schema: String,
    table: String,
}

impl SupabaseStore {
    /// Returns `None` unless both `SUPABASE_URL` and
    /// `SUPABASE_SERVICE_ROLE_KEY` are set.
    pub fn from_env(config: &EngineConfig) -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_role_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY").ok()?;
        Some(Self::new(base_url, service_role_key, config))
    }

    pub fn new(base_url: String, service_role_key: String, config: &EngineConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key,
            schema: config.supabase_schema.clone(),
            table: config.line_items_table.clone(),
        }
    }

    /// Helper: GET request against a table. Query values go through
    /// `RequestBuilder::query`, so ids are percent-encoded.
    fn select_request(&self, table: &str, query: &[(&str, String)]) -> RequestBuilder {
        self.client
            .get(format!("{}/rest/v1/{}", self.base_url, table))
            .query(query)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Accept-Profile", &self.schema)
    }

    fn structure_query(&self, structure_id: &str, select: &str) -> RequestBuilder {
        self.select_request(
            &self.table,
            &[
                ("report_structure_uuid", format!("eq.{}", structure_id)),
                ("select", select.to_string()),
                ("order", "sort_order.asc".to_string()),
            ],
        )
    }

    /// Helper: send a GET and decode the JSON body.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("Supabase GET {} failed to send", what))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Supabase GET {} failed: {} - {}", what, status, text));
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to decode Supabase GET {}", what))
    }

    /// uuid -> integer primary key, which the batch procedure keys on.
    async fn row_ids(&self, structure_id: &str) -> Result<HashMap<String, i64>> {
        let rows: Vec<RowIdRow> = self
            .get_json(
                self.structure_query(structure_id, "report_line_item_uuid,report_line_item_id"),
                &self.table,
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.report_line_item_uuid, row.report_line_item_id))
            .collect())
    }

    /// Helper: call a stored procedure through `/rest/v1/rpc/{name}`.
    async fn rpc<T: serde::de::DeserializeOwned>(
        &self,
        function: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, function);
        debug!("Calling Supabase RPC {}", function);

        let resp = self
            .client
            .post(&url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .header("Content-Profile", &self.schema)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Supabase RPC {} failed to send", function))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Supabase RPC {} failed: {} - {}", function, status, text));
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to decode Supabase RPC {} result", function))
    }
}

#[async_trait::async_trait]
impl LineItemStore for SupabaseStore {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn fetch_line_items(&self, structure_id: &str) -> Result<Vec<LineItem>> {
        let rows: Vec<LineItemRow> = self
            .get_json(self.structure_query(structure_id, "*"), &self.table)
            .await?;

        info!(
            "Fetched {} line items for structure {} from Supabase",
            rows.len(),
            structure_id
        );
        Ok(rows.into_iter().map(LineItem::from).collect())
    }

    async fn batch_update_positions(
        &self,
        structure_id: &str,
        updates: &[PositionUpdate],
    ) -> Result<BatchUpdateResult> {
        let row_ids = self.row_ids(structure_id).await?;
        let body = batch_update_body(structure_id, updates, &row_ids)?;
        self.rpc(BATCH_UPDATE_FN, body).await
    }

    async fn reparent_and_reposition(
        &self,
        structure_id: &str,
        request: &ReparentRequest,
    ) -> Result<ReparentResult> {
        self.rpc(REPARENT_FN, reparent_body(structure_id, request))
            .await
    }
}

fn batch_update_body(
    structure_id: &str,
    updates: &[PositionUpdate],
    row_ids: &HashMap<String, i64>,
) -> Result<serde_json::Value> {
    let p_updates = updates
        .iter()
        .map(|u| {
            let report_line_item_id = *row_ids.get(&u.item_id).ok_or_else(|| {
                anyhow!(
                    "line item {} not found in structure {}",
                    u.item_id,
                    structure_id
                )
            })?;
            Ok(SortOrderRow {
                report_line_item_id,
                sort_order: u.position,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(json!({
        "p_structure_uuid": structure_id,
        "p_updates": p_updates,
    }))
}

fn reparent_body(structure_id: &str, request: &ReparentRequest) -> serde_json::Value {
    json!({
        "p_structure_uuid": structure_id,
        "p_moved_item_uuid": request.moved_item_id,
        "p_new_parent_uuid": request.new_parent_id,
        "p_target_position": request.target_position,
        "p_drop_position": request.drop_position.map(|p| p.as_str()),
        "p_target_sibling_uuid": request.target_sibling_id,
    })
}

// ============================================================================
// Supabase row types
// ============================================================================

#[derive(Debug, Deserialize)]
struct LineItemRow {
    report_line_item_uuid: String,
    report_line_item_key: String,
    report_line_item_description: Option<String>,
    parent_report_line_item_uuid: Option<String>,
    sort_order: u32,
    #[serde(default)]
    is_leaf: bool,
    #[serde(default)]
    is_calculated: bool,
    #[serde(default = "default_display")]
    display: bool,
}

fn default_display() -> bool {
    true
}

impl From<LineItemRow> for LineItem {
    fn from(row: LineItemRow) -> Self {
        Self {
            id: row.report_line_item_uuid,
            key: row.report_line_item_key,
            description: row.report_line_item_description,
            parent_id: row.parent_report_line_item_uuid,
            sort_order: row.sort_order,
            is_leaf: row.is_leaf,
            is_calculated: row.is_calculated,
            display: row.display,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RowIdRow {
    report_line_item_uuid: String,
    report_line_item_id: i64,
}

#[derive(Debug, Serialize)]
struct SortOrderRow {
    report_line_item_id: i64,
    sort_order: u32,
}
