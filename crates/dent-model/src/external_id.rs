//! The `F{filial_id}_{row_id}` join key between source and CRM.
//!
//! This string is the **sole** link between an appointment row and its CRM
//! deal, and it is stable forever: once stamped onto a deal it is never
//! rewritten. All reconciliation lookups key on it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// External identifier of an appointment as presented to the CRM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    /// Render the key for a `(filial_id, row_id)` pair.
    pub fn new(filial_id: u8, row_id: i64) -> Self {
        Self(format!("F{filial_id}_{row_id}"))
    }

    /// Parse a key previously rendered by [`ExternalId::new`].
    ///
    /// Returns `None` for anything that does not match `F<digit+>_<digit+>`.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix('F')?;
        let (filial, row) = rest.split_once('_')?;
        let filial: u8 = filial.parse().ok()?;
        let row: i64 = row.parse().ok()?;
        Some(Self::new(filial, row))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `(filial_id, row_id)` pair this key was rendered from.
    pub fn parts(&self) -> Option<(u8, i64)> {
        let rest = self.0.strip_prefix('F')?;
        let (filial, row) = rest.split_once('_')?;
        Some((filial.parse().ok()?, row.parse().ok()?))
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
