//! Batch coalescing and the four batched finders the reconciler uses.
//!
//! # Contract
//!
//! - At most [`BATCH_LIMIT`] sub-requests per HTTP call; longer inputs are
//!   chunked and the chunks sent serially.
//! - The returned map has exactly the requested keys; a key the CRM knows
//!   nothing about maps to `None`.
//! - **Empty input returns an empty map without issuing any HTTP call.**

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use dent_model::ExternalId;

use crate::types::{field_i64, Deal, Lead};
use crate::{CrmClient, CrmError};

/// The CRM accepts at most this many sub-requests per batch call.
pub const BATCH_LIMIT: usize = 50;

/// One labelled sub-request.
#[derive(Debug, Clone)]
pub struct BatchCommand {
    pub label: String,
    pub method: String,
    pub params: Value,
}

impl CrmClient {
    /// Send labelled sub-requests, chunked by [`BATCH_LIMIT`], and return
    /// each label's result (`None` when the CRM returned nothing for it).
    pub async fn batch(
        &self,
        commands: Vec<BatchCommand>,
    ) -> Result<HashMap<String, Option<Value>>, CrmError> {
        let mut out = HashMap::with_capacity(commands.len());
        if commands.is_empty() {
            return Ok(out);
        }

        for chunk in commands.chunks(BATCH_LIMIT) {
            let cmd: Map<String, Value> = chunk
                .iter()
                .map(|c| {
                    (
                        c.label.clone(),
                        json!({"method": c.method, "params": c.params}),
                    )
                })
                .collect();
            let result = self.call("batch", json!({ "cmd": cmd })).await?;
            for c in chunk {
                let sub = result.get(&c.label).filter(|v| !v.is_null()).cloned();
                out.insert(c.label.clone(), sub);
            }
        }
        Ok(out)
    }

    /// Contact ids keyed by (normalized) phone. Exact match on the phone.
    pub async fn batch_find_contacts_by_phones(
        &self,
        phones: &[String],
    ) -> Result<HashMap<String, Option<i64>>, CrmError> {
        let keys = dedup(phones);
        let commands = keys
            .iter()
            .enumerate()
            .map(|(i, phone)| BatchCommand {
                label: format!("c{i}"),
                method: "crm.contact.list".to_string(),
                params: json!({
                    "filter": {"PHONE": phone},
                    "select": ["ID"]
                }),
            })
            .collect();
        let results = self.batch(commands).await?;

        let mut out = HashMap::with_capacity(keys.len());
        for (i, phone) in keys.into_iter().enumerate() {
            let id = results
                .get(&format!("c{i}"))
                .and_then(|v| v.as_ref())
                .and_then(first_row)
                .and_then(|row| field_i64(row, "ID"));
            out.insert(phone, id);
        }
        Ok(out)
    }

    /// Deals (with current stage) keyed by external id.
    pub async fn batch_find_deals_by_external_ids(
        &self,
        ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, Option<Deal>>, CrmError> {
        let keys: Vec<ExternalId> = {
            let mut seen = std::collections::HashSet::new();
            ids.iter()
                .filter(|id| seen.insert((*id).clone()))
                .cloned()
                .collect()
        };
        let commands = keys
            .iter()
            .enumerate()
            .map(|(i, id)| BatchCommand {
                label: format!("d{i}"),
                method: "crm.deal.list".to_string(),
                params: json!({
                    "filter": { (self.external_id_field.as_str()): id.as_str() },
                    "select": ["ID", "STAGE_ID", "CONTACT_ID", &self.external_id_field]
                }),
            })
            .collect();
        let results = self.batch(commands).await?;

        let mut out = HashMap::with_capacity(keys.len());
        for (i, id) in keys.into_iter().enumerate() {
            let deal = match results.get(&format!("d{i}")).and_then(|v| v.as_ref()).and_then(first_row) {
                Some(row) => Some(Deal::from_value(row, &self.external_id_field)?),
                None => None,
            };
            out.insert(id, deal);
        }
        Ok(out)
    }

    /// Lead ids keyed by the contact they are attached to.
    pub async fn batch_find_leads_by_contact_ids(
        &self,
        contact_ids: &[i64],
    ) -> Result<HashMap<i64, Option<i64>>, CrmError> {
        let keys: Vec<i64> = {
            let mut seen = std::collections::HashSet::new();
            contact_ids.iter().filter(|id| seen.insert(**id)).copied().collect()
        };
        let commands = keys
            .iter()
            .enumerate()
            .map(|(i, contact_id)| BatchCommand {
                label: format!("lc{i}"),
                method: "crm.lead.list".to_string(),
                params: json!({
                    "filter": {"CONTACT_ID": contact_id},
                    "select": ["ID"]
                }),
            })
            .collect();
        let results = self.batch(commands).await?;

        let mut out = HashMap::with_capacity(keys.len());
        for (i, contact_id) in keys.into_iter().enumerate() {
            let id = results
                .get(&format!("lc{i}"))
                .and_then(|v| v.as_ref())
                .and_then(first_row)
                .and_then(|row| field_i64(row, "ID"));
            out.insert(contact_id, id);
        }
        Ok(out)
    }

    /// Leads (with status, for the convertibility check) keyed by phone.
    pub async fn batch_find_leads_by_phones(
        &self,
        phones: &[String],
    ) -> Result<HashMap<String, Option<Lead>>, CrmError> {
        let keys = dedup(phones);
        let commands = keys
            .iter()
            .enumerate()
            .map(|(i, phone)| BatchCommand {
                label: format!("lp{i}"),
                method: "crm.lead.list".to_string(),
                params: json!({
                    "filter": {"PHONE": phone},
                    "select": ["ID", "STATUS_ID", "CONTACT_ID"]
                }),
            })
            .collect();
        let results = self.batch(commands).await?;

        let mut out = HashMap::with_capacity(keys.len());
        for (i, phone) in keys.into_iter().enumerate() {
            let lead = match results.get(&format!("lp{i}")).and_then(|v| v.as_ref()).and_then(first_row) {
                Some(row) => Some(Lead::from_value(row)?),
                None => None,
            };
            out.insert(phone, lead);
        }
        Ok(out)
    }
}

fn dedup(keys: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    keys.iter()
        .filter(|k| seen.insert((*k).clone()))
        .cloned()
        .collect()
}

/// List-method sub-results are arrays; the finders take the first row.
fn first_row(v: &Value) -> Option<&Value> {
    v.as_array().and_then(|rows| rows.first())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
