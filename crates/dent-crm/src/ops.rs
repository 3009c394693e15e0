//! Point operations. Each is a single `call` (which already carries the
//! retry policy — no extra decoration here).

use serde_json::{json, Value};

use crate::types::{field_i64, ConvertedLead, Deal, Fields};
use crate::{CrmClient, CrmError};

impl CrmClient {
    /// Harmless liveness call used at daemon startup.
    pub async fn ping(&self) -> Result<(), CrmError> {
        self.call("profile", json!({})).await.map(|_| ())
    }

    pub async fn get_deal(&self, id: i64) -> Result<Deal, CrmError> {
        let result = self.call("crm.deal.get", json!({ "id": id })).await?;
        Deal::from_value(&result, &self.external_id_field)
    }

    /// Create a contact, returning its new id.
    pub async fn create_contact(&self, fields: Fields) -> Result<i64, CrmError> {
        let result = self
            .call("crm.contact.add", json!({ "fields": fields }))
            .await?;
        added_id(&result, "crm.contact.add")
    }

    /// Create a deal, returning its new id.
    pub async fn create_deal(&self, fields: Fields) -> Result<i64, CrmError> {
        let result = self.call("crm.deal.add", json!({ "fields": fields })).await?;
        added_id(&result, "crm.deal.add")
    }

    pub async fn update_deal(&self, id: i64, fields: Fields) -> Result<(), CrmError> {
        self.call("crm.deal.update", json!({ "id": id, "fields": fields }))
            .await
            .map(|_| ())
    }

    /// All deals attached to a contact, oldest first (ascending id).
    pub async fn list_deals_by_contact(&self, contact_id: i64) -> Result<Vec<Deal>, CrmError> {
        let result = self
            .call(
                "crm.deal.list",
                json!({
                    "filter": {"CONTACT_ID": contact_id},
                    "select": ["ID", "STAGE_ID", "CONTACT_ID", &self.external_id_field],
                    "order": {"ID": "ASC"}
                }),
            )
            .await?;
        let rows = result
            .as_array()
            .ok_or_else(|| CrmError::Decode("crm.deal.list: result is not an array".to_string()))?;
        rows.iter()
            .map(|row| Deal::from_value(row, &self.external_id_field))
            .collect()
    }

    /// Convert a lead into a deal (and possibly a new contact) in one call.
    pub async fn convert_lead_to_deal(&self, lead_id: i64) -> Result<ConvertedLead, CrmError> {
        let result = self
            .call("crm.lead.convert", json!({ "id": lead_id }))
            .await?;
        let deal_id = field_i64(&result, "DEAL_ID").ok_or_else(|| {
            CrmError::Decode(format!("crm.lead.convert: no DEAL_ID in {result}"))
        })?;
        Ok(ConvertedLead {
            deal_id,
            contact_id: field_i64(&result, "CONTACT_ID").filter(|id| *id != 0),
        })
    }

    /// Write a note onto a deal. A direct field update, deliberately a
    /// single round trip (not a separate timeline entry).
    pub async fn append_note(&self, deal_id: i64, text: &str) -> Result<(), CrmError> {
        let mut fields = Fields::new();
        fields.insert("COMMENTS".to_string(), Value::String(text.to_string()));
        self.update_deal(deal_id, fields).await
    }

    /// Replace the treatment-plan projection field on a deal.
    pub async fn set_plan_text(&self, deal_id: i64, text: &str) -> Result<(), CrmError> {
        let mut fields = Fields::new();
        fields.insert(self.plan_field.clone(), Value::String(text.to_string()));
        self.update_deal(deal_id, fields).await
    }
}

fn added_id(result: &Value, method: &str) -> Result<i64, CrmError> {
    match result {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| CrmError::Decode(format!("{method}: result is not an id: {result}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
