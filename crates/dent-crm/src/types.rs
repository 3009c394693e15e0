//! CRM entity shapes as the sync core sees them.
//!
//! The CRM serializes numbers inconsistently (`"ID": "123"` and
//! `"ID": 123` both occur), so all field extraction goes through the
//! lenient helpers here.

use serde_json::Value;

use crate::CrmError;

/// Field payload for create/update calls. Keys are the CRM's field codes.
pub type Fields = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

// Contacts surface only as ids: the phone finder yields the contact id and
// creation goes through `fields::contact_fields`. No entity struct needed.

#[derive(Debug, Clone, PartialEq)]
pub struct Lead {
    pub id: i64,
    pub status_id: String,
    pub contact_id: Option<i64>,
}

impl Lead {
    /// A lead already converted or junked cannot be converted again.
    pub fn is_convertible(&self) -> bool {
        !matches!(self.status_id.as_str(), "CONVERTED" | "JUNK")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Deal {
    pub id: i64,
    pub stage_id: String,
    /// Value of the external-id custom field, when stamped.
    pub external_id: Option<String>,
    pub contact_id: Option<i64>,
}

/// Result of converting a lead: always a new deal, sometimes a new contact.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedLead {
    pub deal_id: i64,
    pub contact_id: Option<i64>,
}

// ---------------------------------------------------------------------------
// Lenient JSON extraction
// ---------------------------------------------------------------------------

pub(crate) fn field_i64(v: &Value, key: &str) -> Option<i64> {
    match v.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(crate) fn field_str(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Non-empty string field; treats `""`, `null`, and `"0"`-as-absent ids
/// uniformly where the CRM blanks unset custom fields.
pub(crate) fn field_str_nonempty(v: &Value, key: &str) -> Option<String> {
    field_str(v, key).filter(|s| !s.is_empty())
}

impl Deal {
    pub(crate) fn from_value(v: &Value, external_id_field: &str) -> Result<Self, CrmError> {
        Ok(Self {
            id: field_i64(v, "ID")
                .ok_or_else(|| CrmError::Decode(format!("deal without ID: {v}")))?,
            stage_id: field_str(v, "STAGE_ID").unwrap_or_default(),
            external_id: field_str_nonempty(v, external_id_field),
            contact_id: field_i64(v, "CONTACT_ID").filter(|id| *id != 0),
        })
    }
}

impl Lead {
    pub(crate) fn from_value(v: &Value) -> Result<Self, CrmError> {
        Ok(Self {
            id: field_i64(v, "ID")
                .ok_or_else(|| CrmError::Decode(format!("lead without ID: {v}")))?,
            status_id: field_str(v, "STATUS_ID").unwrap_or_default(),
            contact_id: field_i64(v, "CONTACT_ID").filter(|id| *id != 0),
        })
    }
}
