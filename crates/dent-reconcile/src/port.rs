//! The CRM operations the reconciler needs, as an object-safe trait.
//!
//! Tests implement this with an in-memory fake; production forwards to
//! [`CrmClient`]. The forwarding impl adds no retry and no batching of its
//! own — both already live inside the client.

use std::collections::HashMap;

use async_trait::async_trait;

use dent_crm::{ConvertedLead, CrmClient, CrmError, Deal, Fields, Lead};
use dent_model::ExternalId;

#[async_trait]
pub trait CrmPort: Send + Sync {
    // Coalesced lookups (one batch HTTP call per ≤50 keys).
    async fn find_deals_by_external_ids(
        &self,
        ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, Option<Deal>>, CrmError>;
    async fn find_contacts_by_phones(
        &self,
        phones: &[String],
    ) -> Result<HashMap<String, Option<i64>>, CrmError>;
    async fn find_leads_by_phones(
        &self,
        phones: &[String],
    ) -> Result<HashMap<String, Option<Lead>>, CrmError>;
    async fn find_leads_by_contact_ids(
        &self,
        contact_ids: &[i64],
    ) -> Result<HashMap<i64, Option<i64>>, CrmError>;

    // Point operations.
    async fn get_deal(&self, id: i64) -> Result<Deal, CrmError>;
    async fn list_deals_by_contact(&self, contact_id: i64) -> Result<Vec<Deal>, CrmError>;
    async fn create_contact(&self, fields: Fields) -> Result<i64, CrmError>;
    async fn create_deal(&self, fields: Fields) -> Result<i64, CrmError>;
    async fn update_deal(&self, id: i64, fields: Fields) -> Result<(), CrmError>;
    async fn convert_lead_to_deal(&self, lead_id: i64) -> Result<ConvertedLead, CrmError>;

    /// Harmless liveness probe for daemon startup. Fakes are always live.
    async fn ping(&self) -> bool {
        true
    }
}

#[async_trait]
impl CrmPort for CrmClient {
    async fn find_deals_by_external_ids(
        &self,
        ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, Option<Deal>>, CrmError> {
        self.batch_find_deals_by_external_ids(ids).await
    }

    async fn find_contacts_by_phones(
        &self,
        phones: &[String],
    ) -> Result<HashMap<String, Option<i64>>, CrmError> {
        self.batch_find_contacts_by_phones(phones).await
    }

    async fn find_leads_by_phones(
        &self,
        phones: &[String],
    ) -> Result<HashMap<String, Option<Lead>>, CrmError> {
        self.batch_find_leads_by_phones(phones).await
    }

    async fn find_leads_by_contact_ids(
        &self,
        contact_ids: &[i64],
    ) -> Result<HashMap<i64, Option<i64>>, CrmError> {
        self.batch_find_leads_by_contact_ids(contact_ids).await
    }

    async fn get_deal(&self, id: i64) -> Result<Deal, CrmError> {
        CrmClient::get_deal(self, id).await
    }

    async fn list_deals_by_contact(&self, contact_id: i64) -> Result<Vec<Deal>, CrmError> {
        CrmClient::list_deals_by_contact(self, contact_id).await
    }

    async fn create_contact(&self, fields: Fields) -> Result<i64, CrmError> {
        CrmClient::create_contact(self, fields).await
    }

    async fn create_deal(&self, fields: Fields) -> Result<i64, CrmError> {
        CrmClient::create_deal(self, fields).await
    }

    async fn update_deal(&self, id: i64, fields: Fields) -> Result<(), CrmError> {
        CrmClient::update_deal(self, id, fields).await
    }

    async fn convert_lead_to_deal(&self, lead_id: i64) -> Result<ConvertedLead, CrmError> {
        CrmClient::convert_lead_to_deal(self, lead_id).await
    }

    async fn ping(&self) -> bool {
        CrmClient::ping(self).await.is_ok()
    }
}
