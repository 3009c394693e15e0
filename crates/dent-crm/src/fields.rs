//! Composition of CRM field payloads from canonical records.
//!
//! The deal/contact field vocabulary lives in this one module so the rest
//! of the workspace never spells CRM field codes. Two codes are
//! configurable (the external-id and plan custom fields); the rest are the
//! CRM's standard ones.

use serde_json::{json, Value};

use dent_model::CanonicalRecord;

use crate::types::Fields;

/// Deal custom field for the treating doctor's name. Part of the CRM
/// contract alongside the external-id and plan fields.
pub const DOCTOR_FIELD: &str = "UF_CRM_DOCTOR";

/// Full deal payload for a canonical record.
///
/// `stage_id` is `None` when the stage must not be touched (protected
/// stages, and the freshly-converted path where the policy already chose).
pub fn deal_fields(
    record: &CanonicalRecord,
    external_id_field: &str,
    stage_id: Option<&str>,
    contact_id: Option<i64>,
) -> Fields {
    let mut fields = Fields::new();
    fields.insert(
        "TITLE".to_string(),
        Value::String(record.patient_full_name.clone()),
    );
    fields.insert(
        external_id_field.to_string(),
        Value::String(record.external_id.to_string()),
    );
    fields.insert(
        DOCTOR_FIELD.to_string(),
        Value::String(record.doctor_name.clone()),
    );
    if !record.services_summary.is_empty() {
        fields.insert(
            "COMMENTS".to_string(),
            Value::String(record.services_summary.clone()),
        );
    }
    if let Some(amount) = record.total_amount {
        fields.insert("OPPORTUNITY".to_string(), json!(amount));
    }
    if let Some(start) = record.planned_start {
        fields.insert(
            "BEGINDATE".to_string(),
            Value::String(start.to_rfc3339()),
        );
    }
    if let Some(stage) = stage_id {
        fields.insert("STAGE_ID".to_string(), Value::String(stage.to_string()));
    }
    if let Some(contact) = contact_id {
        fields.insert("CONTACT_ID".to_string(), json!(contact));
    }
    fields
}

/// Payload that only backfills the external-id custom field. Used on deals
/// in a final stage, where nothing else may be modified.
pub fn external_id_only(record: &CanonicalRecord, external_id_field: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert(
        external_id_field.to_string(),
        Value::String(record.external_id.to_string()),
    );
    fields
}

/// Contact payload for a record whose phone matched nothing.
///
/// Clinic names are written surname-first; the first token becomes the
/// CRM last name and the remainder the first name.
pub fn contact_fields(record: &CanonicalRecord) -> Fields {
    let (last, first) = split_full_name(&record.patient_full_name);
    let mut fields = Fields::new();
    fields.insert("NAME".to_string(), Value::String(first));
    fields.insert("LAST_NAME".to_string(), Value::String(last));
    if !record.patient_phone.is_empty() {
        fields.insert(
            "PHONE".to_string(),
            json!([{"VALUE": record.patient_phone, "VALUE_TYPE": "WORK"}]),
        );
    }
    fields
}

fn split_full_name(full: &str) -> (String, String) {
    match full.split_once(char::is_whitespace) {
        Some((last, rest)) => (last.to_string(), rest.trim().to_string()),
        None => (full.to_string(), String::new()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
