//! Delete-then-recreate reconciliation of one report against the CRM and the
//! relational store.
//!
//! Neither remote system offers an upsert for a deal plus its report rows, so
//! each record walks `LOOKUP -> PURGE (if found) -> CREATE -> PERSIST`. A
//! process interrupted between PURGE and PERSIST leaves the deal archived with
//! no replacement; the next run heals it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use depmig_core::{Division, NormalizedAsset, NormalizedDeal, NormalizedReport};
use depmig_storage::CrmError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Crm(#[from] CrmError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

impl StoreError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Whether a later rerun could plausibly succeed without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Crm(err) => err.is_transient(),
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            StoreError::Message(_) => false,
        }
    }
}

/// CRM deal collaborator.
#[async_trait]
pub trait DealStore: Send + Sync {
    /// Id of the first deal whose name contains `name_token`.
    async fn search_by_name_token(&self, name_token: &str) -> Result<Option<String>, StoreError>;

    async fn create(&self, properties: &BTreeMap<String, String>) -> Result<String, StoreError>;

    async fn archive(&self, deal_id: &str) -> Result<(), StoreError>;
}

/// Relational report collaborator.
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn find_report_by_reference(&self, reference: &str) -> Result<Option<i64>, StoreError>;

    /// Delete a report row together with its asset rows.
    async fn delete_report(&self, report_id: i64) -> Result<(), StoreError>;

    async fn insert_report(
        &self,
        report: &NormalizedReport,
        crm_deal_id: &str,
    ) -> Result<i64, StoreError>;

    /// Insert every row or none.
    async fn bulk_insert_assets(
        &self,
        division: Division,
        report_id: i64,
        assets: &[NormalizedAsset],
    ) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcileStage {
    Lookup,
    Purge,
    Create,
    Persist,
}

impl fmt::Display for ReconcileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReconcileStage::Lookup => "lookup",
            ReconcileStage::Purge => "purge",
            ReconcileStage::Create => "create",
            ReconcileStage::Persist => "persist",
        })
    }
}

#[derive(Debug, Error)]
#[error("{stage} failed for {reference}: {source}")]
pub struct ReconcileError {
    pub stage: ReconcileStage,
    pub reference: String,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub reference: String,
    pub crm_deal_id: String,
    pub report_id: i64,
    pub replaced_deal_id: Option<String>,
    pub replaced_report_id: Option<i64>,
    pub division_40_rows: u64,
    pub division_43_rows: u64,
}

/// Static properties stamped onto every created deal (pipeline, stage, owner...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DealDefaults {
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// CRM property map for a deal; record fields override configured defaults.
pub fn deal_properties(deal: &NormalizedDeal, defaults: &DealDefaults) -> BTreeMap<String, String> {
    let mut properties = defaults.properties.clone();
    let date = |d: chrono::NaiveDate| d.format("%Y-%m-%d").to_string();

    properties.insert(depmig_storage::DEAL_NAME_PROPERTY.to_string(), deal.deal_name.clone());
    properties.insert("ccd".to_string(), date(deal.ccd));
    properties.insert("settlement_date".to_string(), date(deal.settlement_date));
    properties.insert("first_use_date".to_string(), date(deal.first_use_date));
    properties.insert("common_entitlement".to_string(), deal.common_entitlement.to_string());

    let optional = [
        ("purchase_price", &deal.purchase_price),
        ("land_value", &deal.land_value),
        ("number_of_levels", &deal.number_of_levels),
        ("number_of_units", &deal.number_of_units),
        ("strata_plan_provider", &deal.strata_plan_provider),
        ("verbal_information_provided_by", &deal.verbal_information_provided_by),
        ("written_information_provided_by", &deal.written_information_provided_by),
        ("council_name", &deal.council_name),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            properties.insert(name.to_string(), value.clone());
        }
    }
    properties
}

pub struct Reconciler {
    deals: Arc<dyn DealStore>,
    reports: Arc<dyn ReportStore>,
    deal_defaults: DealDefaults,
}

impl Reconciler {
    pub fn new(deals: Arc<dyn DealStore>, reports: Arc<dyn ReportStore>) -> Self {
        Self {
            deals,
            reports,
            deal_defaults: DealDefaults::default(),
        }
    }

    pub fn with_deal_defaults(mut self, deal_defaults: DealDefaults) -> Self {
        self.deal_defaults = deal_defaults;
        self
    }

    pub async fn reconcile(
        &self,
        deal: &NormalizedDeal,
        report: &NormalizedReport,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let reference = report.reference.as_str();
        let fail = |stage: ReconcileStage| {
            move |source: StoreError| ReconcileError {
                stage,
                reference: reference.to_string(),
                source,
            }
        };

        // Only the first match is acted on; duplicate deal names are not resolved.
        let existing = self
            .deals
            .search_by_name_token(&deal.deal_name)
            .await
            .map_err(fail(ReconcileStage::Lookup))?;

        if let Some(deal_id) = &existing {
            info!(reference, deal_id = %deal_id, "archiving existing deal");
            self.deals
                .archive(deal_id)
                .await
                .map_err(fail(ReconcileStage::Purge))?;
        }

        let properties = deal_properties(deal, &self.deal_defaults);
        let crm_deal_id = self
            .deals
            .create(&properties)
            .await
            .map_err(fail(ReconcileStage::Create))?;
        debug!(reference, crm_deal_id = %crm_deal_id, "deal created");

        let replaced_report_id = self
            .reports
            .find_report_by_reference(reference)
            .await
            .map_err(fail(ReconcileStage::Persist))?;
        if let Some(old_id) = replaced_report_id {
            info!(reference, report_id = old_id, "deleting existing report rows");
            self.reports
                .delete_report(old_id)
                .await
                .map_err(fail(ReconcileStage::Persist))?;
        }

        let report_id = self
            .reports
            .insert_report(report, &crm_deal_id)
            .await
            .map_err(fail(ReconcileStage::Persist))?;

        let division_40_rows = self
            .reports
            .bulk_insert_assets(Division::Div40, report_id, report.assets(Division::Div40))
            .await
            .map_err(fail(ReconcileStage::Persist))?;
        let division_43_rows = self
            .reports
            .bulk_insert_assets(Division::Div43, report_id, report.assets(Division::Div43))
            .await
            .map_err(fail(ReconcileStage::Persist))?;

        Ok(ReconcileOutcome {
            reference: reference.to_string(),
            crm_deal_id,
            report_id,
            replaced_deal_id: existing,
            replaced_report_id,
            division_40_rows,
            division_43_rows,
        })
    }
}
