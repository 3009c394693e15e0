//! The reconciliation engine.
//!
//! # Lookup order per record
//!
//! 1. Deal already stamped with the external id → update it.
//! 2. Contact by phone, then that contact's deals lacking an external id:
//!    exactly one → adopt it (auto-binding); several → skip with a warning
//!    (never guess); none → keep looking.
//! 3. Open lead by phone (or attached to the matched contact) → convert it
//!    and update the fresh deal without stage protection.
//! 4. Nothing matched → create contact (when there is a phone to match by)
//!    and deal.
//!
//! An empty phone skips paths 2 and 3 entirely.
//!
//! # Update rules
//!
//! - Final stage: only backfill the external-id field if missing. Nothing
//!   else is touched.
//! - Protected non-final stage: update every field except the stage.
//! - Otherwise: update everything, stage per [`crate::policy::decide`].
//!
//! # Auto-binding safety
//!
//! A deal discovered via path 2 is re-read (`get_deal`) immediately before
//! the update. If that read fails the record is deferred and the deal left
//! untouched — proceeding on a stale stage could overwrite a protected one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use dent_crm::fields::{contact_fields, deal_fields, external_id_only};
use dent_crm::{CrmError, Deal, Lead};
use dent_model::{CanonicalRecord, ExternalId, StageMap};

use crate::policy::{decide, StageDecision};
use crate::CrmPort;

// ---------------------------------------------------------------------------
// Outcome / error
// ---------------------------------------------------------------------------

/// How a record was reflected in the CRM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A new deal (and possibly contact) was created.
    Created {
        deal_id: i64,
        contact_id: Option<i64>,
    },
    /// An existing deal, found by external id, was updated.
    Updated {
        deal_id: i64,
        stage_written: Option<String>,
    },
    /// An unbound deal was adopted via the contact's phone and stamped.
    Adopted {
        deal_id: i64,
        stage_written: Option<String>,
    },
    /// A lead was converted; the fresh deal carries the record.
    Converted { lead_id: i64, deal_id: i64 },
    /// Several unbound deals matched; nothing was touched.
    SkippedAmbiguous {
        contact_id: i64,
        unbound_deals: usize,
    },
}

impl ReconcileOutcome {
    /// The deal now carrying this record, when one exists.
    pub fn deal_id(&self) -> Option<i64> {
        match self {
            Self::Created { deal_id, .. }
            | Self::Updated { deal_id, .. }
            | Self::Adopted { deal_id, .. }
            | Self::Converted { deal_id, .. } => Some(*deal_id),
            Self::SkippedAmbiguous { .. } => None,
        }
    }
}

/// A failure that defers the record to the retry queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A CRM call failed (after the client's own retry policy).
    Crm(CrmError),
    /// The pre-update stage read on the auto-binding path failed; the deal
    /// was left untouched.
    StageReadFailed { deal_id: i64, source: CrmError },
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Crm(err) => write!(f, "{err}"),
            ReconcileError::StageReadFailed { deal_id, source } => {
                write!(f, "stage read failed for deal {deal_id}: {source}")
            }
        }
    }
}

impl std::error::Error for ReconcileError {}

// ---------------------------------------------------------------------------
// Prefetched lookups
// ---------------------------------------------------------------------------

/// One chunk's worth of coalesced lookups.
struct LookupIndex {
    deals: HashMap<ExternalId, Option<Deal>>,
    contacts: HashMap<String, Option<i64>>,
    leads_by_phone: HashMap<String, Option<Lead>>,
    leads_by_contact: HashMap<i64, Option<i64>>,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    crm: Arc<dyn CrmPort>,
    stages: StageMap,
    external_id_field: String,
}

impl Reconciler {
    pub fn new(crm: Arc<dyn CrmPort>, stages: StageMap, external_id_field: String) -> Self {
        Self {
            crm,
            stages,
            external_id_field,
        }
    }

    /// Reconcile a chunk of records against one prefetched lookup index.
    ///
    /// A failed prefetch fails every record of the chunk the same way (all
    /// end up enqueued); per-record failures are isolated.
    pub async fn reconcile_batch(
        &self,
        records: &[CanonicalRecord],
    ) -> Vec<(ExternalId, Result<ReconcileOutcome, ReconcileError>)> {
        let index = match self.prefetch(records).await {
            Ok(index) => index,
            Err(err) => {
                warn!(%err, records = records.len(), "batched lookup failed for whole chunk");
                return records
                    .iter()
                    .map(|r| (r.external_id.clone(), Err(ReconcileError::Crm(err.clone()))))
                    .collect();
            }
        };

        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let result = self.reconcile_one(record, &index).await;
            out.push((record.external_id.clone(), result));
        }
        out
    }

    /// Reconcile a single record (retry-queue drain path).
    pub async fn reconcile_record(
        &self,
        record: &CanonicalRecord,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let index = self
            .prefetch(std::slice::from_ref(record))
            .await
            .map_err(ReconcileError::Crm)?;
        self.reconcile_one(record, &index).await
    }

    async fn prefetch(&self, records: &[CanonicalRecord]) -> Result<LookupIndex, CrmError> {
        let ids: Vec<ExternalId> = records.iter().map(|r| r.external_id.clone()).collect();
        let phones: Vec<String> = records
            .iter()
            .map(|r| r.patient_phone.clone())
            .filter(|p| !p.is_empty())
            .collect();

        let deals = self.crm.find_deals_by_external_ids(&ids).await?;
        let contacts = self.crm.find_contacts_by_phones(&phones).await?;
        let leads_by_phone = self.crm.find_leads_by_phones(&phones).await?;
        let contact_ids: Vec<i64> = contacts.values().flatten().copied().collect();
        let leads_by_contact = self.crm.find_leads_by_contact_ids(&contact_ids).await?;

        Ok(LookupIndex {
            deals,
            contacts,
            leads_by_phone,
            leads_by_contact,
        })
    }

    async fn reconcile_one(
        &self,
        record: &CanonicalRecord,
        index: &LookupIndex,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        // Path 1: the external id already points at a deal.
        if let Some(deal) = index.deals.get(&record.external_id).and_then(|d| d.as_ref()) {
            return self.apply_update(record, deal.clone(), false).await;
        }

        let phone = (!record.patient_phone.is_empty()).then(|| record.patient_phone.as_str());
        let mut matched_contact: Option<i64> = None;

        if let Some(phone) = phone {
            matched_contact = index.contacts.get(phone).copied().flatten();

            // Path 2: adopt the contact's single unbound deal.
            if let Some(contact_id) = matched_contact {
                let deals = self
                    .crm
                    .list_deals_by_contact(contact_id)
                    .await
                    .map_err(ReconcileError::Crm)?;
                let unbound: Vec<&Deal> =
                    deals.iter().filter(|d| d.external_id.is_none()).collect();
                match unbound.len() {
                    0 => {}
                    1 => {
                        let deal_id = unbound[0].id;
                        // Safety read: never adopt on a possibly stale stage.
                        let fresh = self.crm.get_deal(deal_id).await.map_err(|source| {
                            ReconcileError::StageReadFailed { deal_id, source }
                        })?;
                        info!(external_id = %record.external_id, deal_id, contact_id,
                              "auto-binding unbound deal");
                        return self.apply_update(record, fresh, true).await;
                    }
                    n => {
                        warn!(external_id = %record.external_id, contact_id, unbound_deals = n,
                              "auto-bind ambiguous, record skipped");
                        return Ok(ReconcileOutcome::SkippedAmbiguous {
                            contact_id,
                            unbound_deals: n,
                        });
                    }
                }
            }

            // Path 3: convert an open lead.
            let lead_id = match index.leads_by_phone.get(phone).and_then(|l| l.as_ref()) {
                Some(lead) if lead.is_convertible() => Some(lead.id),
                // A closed lead is not a conversion candidate.
                Some(_) => None,
                None => matched_contact
                    .and_then(|cid| index.leads_by_contact.get(&cid).copied().flatten()),
            };
            if let Some(lead_id) = lead_id {
                return self.convert_and_update(record, lead_id, matched_contact).await;
            }
        }

        // Path 4: nothing matched, create.
        self.create_new(record, matched_contact, phone.is_some()).await
    }

    /// Update a located deal under the stage-protection rules.
    async fn apply_update(
        &self,
        record: &CanonicalRecord,
        deal: Deal,
        adopted: bool,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if self.stages.is_final(&deal.stage_id) {
            // Final is immutable: at most the external-id backfill.
            if deal.external_id.is_none() {
                self.crm
                    .update_deal(deal.id, external_id_only(record, &self.external_id_field))
                    .await
                    .map_err(ReconcileError::Crm)?;
                info!(external_id = %record.external_id, deal_id = deal.id,
                      stage = %deal.stage_id, "final deal: backfilled external id only");
            }
            return Ok(self.updated_outcome(adopted, deal.id, None));
        }

        let stage_written = if self.stages.is_protected(&deal.stage_id) {
            None
        } else {
            let current = (!deal.stage_id.is_empty()).then(|| deal.stage_id.as_str());
            match decide(&self.stages, current, record.target_status) {
                StageDecision::Set(stage) => Some(stage),
                StageDecision::Preserve => None,
            }
        };

        let fields = deal_fields(
            record,
            &self.external_id_field,
            stage_written.as_deref(),
            None,
        );
        self.crm
            .update_deal(deal.id, fields)
            .await
            .map_err(ReconcileError::Crm)?;
        Ok(self.updated_outcome(adopted, deal.id, stage_written))
    }

    fn updated_outcome(
        &self,
        adopted: bool,
        deal_id: i64,
        stage_written: Option<String>,
    ) -> ReconcileOutcome {
        if adopted {
            ReconcileOutcome::Adopted {
                deal_id,
                stage_written,
            }
        } else {
            ReconcileOutcome::Updated {
                deal_id,
                stage_written,
            }
        }
    }

    async fn convert_and_update(
        &self,
        record: &CanonicalRecord,
        lead_id: i64,
        matched_contact: Option<i64>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let converted = self
            .crm
            .convert_lead_to_deal(lead_id)
            .await
            .map_err(ReconcileError::Crm)?;
        info!(external_id = %record.external_id, lead_id, deal_id = converted.deal_id,
              "lead converted, updating fresh deal without stage protection");

        // The new deal may not be readable yet (CRM-side indexing race).
        // This deal was created by us within this cycle, so the update
        // proceeds either way.
        let current_stage = match self.crm.get_deal(converted.deal_id).await {
            Ok(deal) if !deal.stage_id.is_empty() => Some(deal.stage_id),
            Ok(_) => None,
            Err(err) => {
                warn!(deal_id = converted.deal_id, %err,
                      "post-conversion read failed, proceeding unprotected");
                None
            }
        };
        let stage_written = match decide(&self.stages, current_stage.as_deref(), record.target_status)
        {
            StageDecision::Set(stage) => Some(stage),
            StageDecision::Preserve => None,
        };

        let contact_id = converted.contact_id.or(matched_contact);
        let fields = deal_fields(
            record,
            &self.external_id_field,
            stage_written.as_deref(),
            contact_id,
        );
        self.crm
            .update_deal(converted.deal_id, fields)
            .await
            .map_err(ReconcileError::Crm)?;
        Ok(ReconcileOutcome::Converted {
            lead_id,
            deal_id: converted.deal_id,
        })
    }

    async fn create_new(
        &self,
        record: &CanonicalRecord,
        matched_contact: Option<i64>,
        has_phone: bool,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let contact_id = match matched_contact {
            Some(id) => Some(id),
            None if has_phone => Some(
                self.crm
                    .create_contact(contact_fields(record))
                    .await
                    .map_err(ReconcileError::Crm)?,
            ),
            // No phone means nothing to match a future contact by; the
            // deal stands alone rather than minting duplicate contacts.
            None => None,
        };

        let stage = match decide(&self.stages, None, record.target_status) {
            StageDecision::Set(stage) => stage,
            // Unreachable with current unknown; keep the safe fallback.
            StageDecision::Preserve => self.stages.treatment.clone(),
        };
        let fields = deal_fields(
            record,
            &self.external_id_field,
            Some(&stage),
            contact_id,
        );
        let deal_id = self
            .crm
            .create_deal(fields)
            .await
            .map_err(ReconcileError::Crm)?;
        info!(external_id = %record.external_id, deal_id, ?contact_id, "created deal");
        Ok(ReconcileOutcome::Created {
            deal_id,
            contact_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use dent_crm::{ConvertedLead, Fields};
    use dent_model::AppointmentStatus;
    use serde_json::Value;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;

    const EXT_FIELD: &str = "UF_EXT";

    // -----------------------------------------------------------------------
    // In-memory CRM fake
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct FakeState {
        next_id: i64,
        contacts_by_phone: HashMap<String, i64>,
        deals: BTreeMap<i64, Deal>,
        leads: BTreeMap<i64, Lead>,
        lead_phones: HashMap<String, i64>,
        fail_get_deal: HashSet<i64>,
        fail_deal_lookup: bool,
        update_log: Vec<(i64, Fields)>,
        created_contacts: usize,
    }

    #[derive(Default)]
    struct FakeCrm {
        state: Mutex<FakeState>,
    }

    impl FakeCrm {
        fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
            self.state.lock().unwrap()
        }

        fn with_contact(&self, phone: &str) -> i64 {
            let mut s = self.lock();
            s.next_id += 1;
            let id = s.next_id;
            s.contacts_by_phone.insert(phone.to_string(), id);
            id
        }

        fn with_deal(&self, stage: &str, external_id: Option<&str>, contact_id: Option<i64>) -> i64 {
            let mut s = self.lock();
            s.next_id += 1;
            let id = s.next_id;
            s.deals.insert(
                id,
                Deal {
                    id,
                    stage_id: stage.to_string(),
                    external_id: external_id.map(str::to_string),
                    contact_id,
                },
            );
            id
        }

        fn with_lead(&self, phone: Option<&str>, status: &str, contact_id: Option<i64>) -> i64 {
            let mut s = self.lock();
            s.next_id += 1;
            let id = s.next_id;
            s.leads.insert(
                id,
                Lead {
                    id,
                    status_id: status.to_string(),
                    contact_id,
                },
            );
            if let Some(phone) = phone {
                s.lead_phones.insert(phone.to_string(), id);
            }
            id
        }

        fn deal(&self, id: i64) -> Deal {
            self.lock().deals[&id].clone()
        }

        fn updates_for(&self, deal_id: i64) -> Vec<Fields> {
            self.lock()
                .update_log
                .iter()
                .filter(|(id, _)| *id == deal_id)
                .map(|(_, f)| f.clone())
                .collect()
        }
    }

    fn apply_fields(deal: &mut Deal, fields: &Fields) {
        if let Some(Value::String(stage)) = fields.get("STAGE_ID") {
            deal.stage_id = stage.clone();
        }
        if let Some(Value::String(ext)) = fields.get(EXT_FIELD) {
            deal.external_id = Some(ext.clone());
        }
        if let Some(contact) = fields.get("CONTACT_ID").and_then(Value::as_i64) {
            deal.contact_id = Some(contact);
        }
    }

    #[async_trait]
    impl CrmPort for FakeCrm {
        async fn find_deals_by_external_ids(
            &self,
            ids: &[ExternalId],
        ) -> Result<HashMap<ExternalId, Option<Deal>>, CrmError> {
            let s = self.lock();
            if s.fail_deal_lookup {
                return Err(CrmError::Server { status: 503 });
            }
            Ok(ids
                .iter()
                .map(|id| {
                    let hit = s
                        .deals
                        .values()
                        .find(|d| d.external_id.as_deref() == Some(id.as_str()))
                        .cloned();
                    (id.clone(), hit)
                })
                .collect())
        }

        async fn find_contacts_by_phones(
            &self,
            phones: &[String],
        ) -> Result<HashMap<String, Option<i64>>, CrmError> {
            let s = self.lock();
            Ok(phones
                .iter()
                .map(|p| (p.clone(), s.contacts_by_phone.get(p).copied()))
                .collect())
        }

        async fn find_leads_by_phones(
            &self,
            phones: &[String],
        ) -> Result<HashMap<String, Option<Lead>>, CrmError> {
            let s = self.lock();
            Ok(phones
                .iter()
                .map(|p| {
                    let lead = s.lead_phones.get(p).and_then(|id| s.leads.get(id)).cloned();
                    (p.clone(), lead)
                })
                .collect())
        }

        async fn find_leads_by_contact_ids(
            &self,
            contact_ids: &[i64],
        ) -> Result<HashMap<i64, Option<i64>>, CrmError> {
            let s = self.lock();
            Ok(contact_ids
                .iter()
                .map(|cid| {
                    let lead = s
                        .leads
                        .values()
                        .find(|l| l.contact_id == Some(*cid) && l.is_convertible())
                        .map(|l| l.id);
                    (*cid, lead)
                })
                .collect())
        }

        async fn get_deal(&self, id: i64) -> Result<Deal, CrmError> {
            let s = self.lock();
            if s.fail_get_deal.contains(&id) {
                return Err(CrmError::Server { status: 500 });
            }
            s.deals
                .get(&id)
                .cloned()
                .ok_or_else(|| CrmError::Validation {
                    code: "NOT_FOUND".to_string(),
                    description: format!("deal {id}"),
                })
        }

        async fn list_deals_by_contact(&self, contact_id: i64) -> Result<Vec<Deal>, CrmError> {
            let s = self.lock();
            Ok(s.deals
                .values()
                .filter(|d| d.contact_id == Some(contact_id))
                .cloned()
                .collect())
        }

        async fn create_contact(&self, fields: Fields) -> Result<i64, CrmError> {
            let mut s = self.lock();
            s.next_id += 1;
            let id = s.next_id;
            s.created_contacts += 1;
            if let Some(phone) = fields
                .get("PHONE")
                .and_then(|v| v.get(0))
                .and_then(|v| v.get("VALUE"))
                .and_then(Value::as_str)
            {
                s.contacts_by_phone.insert(phone.to_string(), id);
            }
            Ok(id)
        }

        async fn create_deal(&self, fields: Fields) -> Result<i64, CrmError> {
            let mut s = self.lock();
            s.next_id += 1;
            let id = s.next_id;
            let mut deal = Deal {
                id,
                stage_id: String::new(),
                external_id: None,
                contact_id: None,
            };
            apply_fields(&mut deal, &fields);
            s.deals.insert(id, deal);
            Ok(id)
        }

        async fn update_deal(&self, id: i64, fields: Fields) -> Result<(), CrmError> {
            let mut s = self.lock();
            let mut deal = s
                .deals
                .get(&id)
                .cloned()
                .ok_or_else(|| CrmError::Validation {
                    code: "NOT_FOUND".to_string(),
                    description: format!("deal {id}"),
                })?;
            apply_fields(&mut deal, &fields);
            s.deals.insert(id, deal);
            s.update_log.push((id, fields));
            Ok(())
        }

        async fn convert_lead_to_deal(&self, lead_id: i64) -> Result<ConvertedLead, CrmError> {
            let mut s = self.lock();
            let lead = s.leads.get_mut(&lead_id).ok_or_else(|| CrmError::Validation {
                code: "NOT_FOUND".to_string(),
                description: format!("lead {lead_id}"),
            })?;
            lead.status_id = "CONVERTED".to_string();
            let contact_id = lead.contact_id;
            s.next_id += 1;
            let deal_id = s.next_id;
            s.deals.insert(
                deal_id,
                Deal {
                    id: deal_id,
                    stage_id: "NEW".to_string(),
                    external_id: None,
                    contact_id,
                },
            );
            Ok(ConvertedLead {
                deal_id,
                contact_id,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn record(filial: u8, row: i64, phone: &str, status: AppointmentStatus) -> CanonicalRecord {
        CanonicalRecord {
            external_id: ExternalId::new(filial, row),
            patient_full_name: "Иванов И. И.".to_string(),
            patient_phone: phone.to_string(),
            doctor_name: "Петрова А. В.".to_string(),
            planned_start: None,
            services_summary: "Консультация".to_string(),
            total_amount: Some(1500.0),
            target_status: status,
            source_timestamps_max: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn reconciler(crm: Arc<FakeCrm>) -> Reconciler {
        Reconciler::new(crm, StageMap::default(), EXT_FIELD.to_string())
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn new_appointment_creates_contact_and_deal() {
        let crm = Arc::new(FakeCrm::default());
        let rec = record(1, 42, "+79991234567", AppointmentStatus::Planned);

        let outcome = reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap();

        let ReconcileOutcome::Created { deal_id, contact_id } = outcome else {
            panic!("expected Created, got {outcome:?}");
        };
        let deal = crm.deal(deal_id);
        assert_eq!(deal.external_id.as_deref(), Some("F1_42"));
        assert_eq!(deal.stage_id, "NEW");
        assert_eq!(deal.contact_id, contact_id);
        assert_eq!(crm.lock().created_contacts, 1);
        assert_eq!(
            crm.lock().contacts_by_phone.get("+79991234567").copied(),
            contact_id
        );
    }

    #[tokio::test]
    async fn completed_preserves_manually_advanced_stage() {
        let crm = Arc::new(FakeCrm::default());
        let deal_id = crm.with_deal("PREPAYMENT_INVOICE", Some("F2_7"), None);
        let rec = record(2, 7, "+79991234567", AppointmentStatus::Completed);

        let outcome = reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                deal_id,
                stage_written: None
            }
        );
        assert_eq!(crm.deal(deal_id).stage_id, "PREPAYMENT_INVOICE");
        // Other fields were refreshed, the stage was not in the payload.
        let updates = crm.updates_for(deal_id);
        assert_eq!(updates.len(), 1);
        assert!(updates[0].contains_key("TITLE"));
        assert!(!updates[0].contains_key("STAGE_ID"));
    }

    #[tokio::test]
    async fn cancellation_moves_deal_to_lose() {
        let crm = Arc::new(FakeCrm::default());
        let deal_id = crm.with_deal("TREATMENT", Some("F3_11"), None);
        let rec = record(3, 11, "", AppointmentStatus::Cancelled);

        let outcome = reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                deal_id,
                stage_written: Some("LOSE".to_string())
            }
        );
        assert_eq!(crm.deal(deal_id).stage_id, "LOSE");
    }

    #[tokio::test]
    async fn open_lead_is_converted_and_stamped() {
        let crm = Arc::new(FakeCrm::default());
        let lead_id = crm.with_lead(Some("+79990001122"), "IN_PROCESS", None);
        let rec = record(4, 5, "+79990001122", AppointmentStatus::Planned);

        let outcome = reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap();

        let ReconcileOutcome::Converted { lead_id: converted, deal_id } = outcome else {
            panic!("expected Converted, got {outcome:?}");
        };
        assert_eq!(converted, lead_id);
        let deal = crm.deal(deal_id);
        assert_eq!(deal.external_id.as_deref(), Some("F4_5"));
        // Fresh deal: no protection, stage written per policy.
        assert_eq!(deal.stage_id, "NEW");
        assert_eq!(crm.lock().leads[&lead_id].status_id, "CONVERTED");
    }

    #[tokio::test]
    async fn ambiguous_unbound_deals_skip_without_touching_anything() {
        let crm = Arc::new(FakeCrm::default());
        let contact_id = crm.with_contact("+79991234567");
        crm.with_deal("NEW", None, Some(contact_id));
        crm.with_deal("TREATMENT", None, Some(contact_id));
        let rec = record(1, 99, "+79991234567", AppointmentStatus::Planned);

        let outcome = reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::SkippedAmbiguous {
                contact_id,
                unbound_deals: 2
            }
        );
        assert!(crm.lock().update_log.is_empty());
        // No deal was created either.
        assert_eq!(crm.lock().deals.len(), 2);
    }

    #[tokio::test]
    async fn single_unbound_deal_is_adopted_and_stamped() {
        let crm = Arc::new(FakeCrm::default());
        let contact_id = crm.with_contact("+79991234567");
        let deal_id = crm.with_deal("NEW", None, Some(contact_id));
        let rec = record(1, 50, "+79991234567", AppointmentStatus::PatientArrived);

        let outcome = reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Adopted {
                deal_id,
                stage_written: Some("CONTACT_MADE".to_string())
            }
        );
        let deal = crm.deal(deal_id);
        assert_eq!(deal.external_id.as_deref(), Some("F1_50"));
        assert_eq!(deal.stage_id, "CONTACT_MADE");
    }

    #[tokio::test]
    async fn failed_stage_read_defers_and_leaves_deal_untouched() {
        let crm = Arc::new(FakeCrm::default());
        let contact_id = crm.with_contact("+79991234567");
        let deal_id = crm.with_deal("EXECUTING", None, Some(contact_id));
        crm.lock().fail_get_deal.insert(deal_id);
        let rec = record(1, 51, "+79991234567", AppointmentStatus::Planned);

        let err = reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::StageReadFailed { deal_id: id, .. } if id == deal_id
        ));
        assert!(crm.lock().update_log.is_empty());
        assert_eq!(crm.deal(deal_id).stage_id, "EXECUTING");
    }

    #[tokio::test]
    async fn protected_stage_updates_fields_but_not_stage() {
        let crm = Arc::new(FakeCrm::default());
        let deal_id = crm.with_deal("FINAL_INVOICE", Some("F1_60"), None);
        let rec = record(1, 60, "", AppointmentStatus::InProgress);

        let outcome = reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                deal_id,
                stage_written: None
            }
        );
        assert_eq!(crm.deal(deal_id).stage_id, "FINAL_INVOICE");
        assert!(crm.updates_for(deal_id)[0].contains_key("TITLE"));
    }

    #[tokio::test]
    async fn final_stage_backfills_external_id_and_nothing_else() {
        let crm = Arc::new(FakeCrm::default());
        let contact_id = crm.with_contact("+79991234567");
        let deal_id = crm.with_deal("WON", None, Some(contact_id));
        let rec = record(1, 70, "+79991234567", AppointmentStatus::Cancelled);

        let outcome = reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Adopted {
                deal_id,
                stage_written: None
            }
        );
        let deal = crm.deal(deal_id);
        assert_eq!(deal.stage_id, "WON");
        assert_eq!(deal.external_id.as_deref(), Some("F1_70"));
        let updates = crm.updates_for(deal_id);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].len(), 1, "only the external id field");
    }

    #[tokio::test]
    async fn final_stage_with_external_id_already_set_is_not_touched() {
        let crm = Arc::new(FakeCrm::default());
        let deal_id = crm.with_deal("LOSE", Some("F1_80"), None);
        let rec = record(1, 80, "", AppointmentStatus::Planned);

        reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap();

        assert!(crm.lock().update_log.is_empty());
    }

    #[tokio::test]
    async fn empty_phone_skips_straight_to_create_without_contact() {
        let crm = Arc::new(FakeCrm::default());
        // Entities that would match by phone if the paths ran.
        let contact_id = crm.with_contact("+79991234567");
        crm.with_deal("NEW", None, Some(contact_id));
        crm.with_lead(Some("+79991234567"), "NEW", None);
        let rec = record(1, 90, "", AppointmentStatus::Planned);

        let outcome = reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap();

        let ReconcileOutcome::Created { deal_id, contact_id } = outcome else {
            panic!("expected Created, got {outcome:?}");
        };
        assert_eq!(contact_id, None);
        assert_eq!(crm.lock().created_contacts, 0);
        assert_eq!(crm.deal(deal_id).external_id.as_deref(), Some("F1_90"));
    }

    #[tokio::test]
    async fn closed_lead_falls_through_to_create() {
        let crm = Arc::new(FakeCrm::default());
        crm.with_lead(Some("+79990001122"), "JUNK", None);
        let rec = record(4, 6, "+79990001122", AppointmentStatus::Planned);

        let outcome = reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Created { .. }));
    }

    #[tokio::test]
    async fn lead_found_via_contact_when_phone_lookup_misses() {
        let crm = Arc::new(FakeCrm::default());
        let contact_id = crm.with_contact("+79991234567");
        // Lead carries no phone of its own but is attached to the contact.
        let lead_id = crm.with_lead(None, "NEW", Some(contact_id));
        let rec = record(1, 95, "+79991234567", AppointmentStatus::Planned);

        let outcome = reconciler(Arc::clone(&crm))
            .reconcile_record(&rec)
            .await
            .unwrap();

        let ReconcileOutcome::Converted { lead_id: converted, .. } = outcome else {
            panic!("expected Converted, got {outcome:?}");
        };
        assert_eq!(converted, lead_id);
    }

    #[tokio::test]
    async fn failed_prefetch_fails_every_record_of_the_chunk() {
        let crm = Arc::new(FakeCrm::default());
        crm.lock().fail_deal_lookup = true;
        let records = vec![
            record(1, 1, "+79991110001", AppointmentStatus::Planned),
            record(1, 2, "+79991110002", AppointmentStatus::Planned),
        ];

        let results = reconciler(Arc::clone(&crm)).reconcile_batch(&records).await;

        assert_eq!(results.len(), 2);
        for (_, result) in results {
            assert!(matches!(
                result,
                Err(ReconcileError::Crm(CrmError::Server { status: 503 }))
            ));
        }
    }

    #[tokio::test]
    async fn repeated_cycle_is_idempotent() {
        let crm = Arc::new(FakeCrm::default());
        let rec = record(1, 42, "+79991234567", AppointmentStatus::Planned);
        let r = reconciler(Arc::clone(&crm));

        let first = r.reconcile_record(&rec).await.unwrap();
        let deal_id = first.deal_id().unwrap();
        let deals_after_first = crm.lock().deals.len();
        let state_after_first = crm.deal(deal_id);

        let second = r.reconcile_record(&rec).await.unwrap();

        // Second pass finds the deal by external id and rewrites the same
        // state; no new entities appear.
        assert_eq!(second.deal_id(), Some(deal_id));
        assert_eq!(crm.lock().deals.len(), deals_after_first);
        assert_eq!(crm.deal(deal_id), state_after_first);
    }
}
