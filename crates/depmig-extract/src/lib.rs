//! Extract loading, per-report asset partitioning and record transformation.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use depmig_core::{
    classify_area, classify_cell, depreciation_method, parse_date_cell, parse_flag, parse_number,
    resolve_date_or_formula, resolve_first_use, Cell, Division, NormalizedAsset, NormalizedDeal,
    NormalizedReport, PlantElections, RawAsset, RawReport,
};
use depmig_storage::{ArtifactStore, PartitionManifest, PartitionManifestEntry};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "depmig-extract";

pub const REPORTS_FILE: &str = "reports.json";

/// `div-40-all.json` / `div-43-all.json`.
pub fn all_assets_file(division: Division) -> String {
    format!("{}-all.json", division.artifact_prefix())
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_reports(extract_dir: impl AsRef<Path>) -> Result<Vec<RawReport>> {
    read_json_file(extract_dir.as_ref().join(REPORTS_FILE))
}

pub fn load_assets(extract_dir: impl AsRef<Path>, division: Division) -> Result<Vec<RawAsset>> {
    read_json_file(extract_dir.as_ref().join(all_assets_file(division)))
}

pub fn report_ids(reports: &[RawReport]) -> HashSet<String> {
    reports
        .iter()
        .filter_map(|r| r.id.text())
        .map(ToString::to_string)
        .collect()
}

/// Group assets by `ReportID`, keeping extract order within each group and
/// dropping assets whose report is not in `known_reports`.
pub fn partition_assets(
    assets: Vec<RawAsset>,
    known_reports: &HashSet<String>,
) -> BTreeMap<String, Vec<RawAsset>> {
    let mut by_report: BTreeMap<String, Vec<RawAsset>> = BTreeMap::new();
    for asset in assets {
        let Some(report_id) = asset.report_id.text() else {
            continue;
        };
        if !known_reports.contains(report_id) {
            continue;
        }
        by_report.entry(report_id.to_string()).or_default().push(asset);
    }
    by_report
}

/// Persist one artifact per report that has at least one asset in `division`.
pub async fn write_partitions(
    store: &ArtifactStore,
    division: Division,
    partitions: &BTreeMap<String, Vec<RawAsset>>,
) -> Result<Vec<PartitionManifestEntry>> {
    let mut entries = Vec::with_capacity(partitions.len());
    for (report_id, assets) in partitions {
        if assets.is_empty() {
            continue;
        }
        let file_name = ArtifactStore::partition_file_name(division, report_id);
        let stored = store.store_json(&file_name, assets).await?;
        info!("Wrote {} assets to {}", assets.len(), stored.file_name);
        entries.push(PartitionManifestEntry {
            division,
            report_id: report_id.clone(),
            path: stored.file_name,
            assets: assets.len(),
            bytes: stored.byte_size,
            sha256: stored.content_hash,
        });
    }
    Ok(entries)
}

/// Delete partition artifacts left by an earlier extract that this run did not
/// rewrite, so a report that lost its assets reads back as empty.
pub async fn prune_stale_partitions(
    store: &ArtifactStore,
    written: &HashSet<String>,
) -> Result<usize> {
    let mut removed = 0usize;
    for file_name in store.file_names().await? {
        if written.contains(&file_name) {
            continue;
        }
        let stale = Division::ALL.into_iter().any(|division| {
            ArtifactStore::is_partition_file_name(division, &file_name)
                && file_name != all_assets_file(division)
        });
        if stale {
            store.remove(&file_name).await?;
            info!("Removed stale artifact {file_name}");
            removed += 1;
        }
    }
    Ok(removed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSummary {
    pub reports: usize,
    pub artifacts: usize,
    pub assets_written: usize,
    pub assets_dropped: usize,
    pub stale_removed: usize,
}

/// Split both asset extracts into per-report artifacts plus a manifest.
pub async fn partition_extract(
    extract_dir: impl AsRef<Path>,
    store: &ArtifactStore,
) -> Result<PartitionSummary> {
    let extract_dir = extract_dir.as_ref();
    let reports = load_reports(extract_dir)?;
    let known = report_ids(&reports);

    let mut files = Vec::new();
    let mut assets_dropped = 0usize;
    for division in Division::ALL {
        let assets = load_assets(extract_dir, division)?;
        let total = assets.len();
        let partitions = partition_assets(assets, &known);
        let kept: usize = partitions.values().map(Vec::len).sum();
        assets_dropped += total - kept;
        files.extend(write_partitions(store, division, &partitions).await?);
    }

    let written: HashSet<String> = files.iter().map(|f| f.path.clone()).collect();
    let stale_removed = prune_stale_partitions(store, &written).await?;

    store
        .write_manifest(&PartitionManifest {
            generated_at: Utc::now(),
            files: files.clone(),
        })
        .await?;

    Ok(PartitionSummary {
        reports: reports.len(),
        artifacts: files.len(),
        assets_written: files.iter().map(|f| f.assets).sum(),
        assets_dropped,
        stale_removed,
    })
}

/// Assets of one report and division as written by [`write_partitions`];
/// no artifact means no assets.
pub async fn load_partition(
    store: &ArtifactStore,
    division: Division,
    report_id: &str,
) -> Result<Vec<RawAsset>> {
    let file_name = ArtifactStore::partition_file_name(division, report_id);
    Ok(store.load_json(&file_name).await?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("report has no Reference")]
    MissingReference,
    #[error("{field} is not a valid date: {value:?}")]
    InvalidDate { field: &'static str, value: String },
    #[error("{field} is not numeric: {value:?}")]
    NotNumeric { field: &'static str, value: String },
}

fn invalid_date(field: &'static str, cell: &Cell) -> ValidationError {
    ValidationError::InvalidDate {
        field,
        value: cell.raw().unwrap_or_default().to_string(),
    }
}

fn reference_of(raw: &RawReport) -> Result<String, ValidationError> {
    raw.reference
        .text()
        .map(ToString::to_string)
        .ok_or(ValidationError::MissingReference)
}

fn passthrough(cell: &Cell) -> Option<String> {
    cell.text().map(ToString::to_string)
}

/// CRM projection of a report; every required date and the common
/// entitlement must resolve or the record is rejected.
pub fn build_deal(raw: &RawReport) -> Result<NormalizedDeal, ValidationError> {
    let deal_name = reference_of(raw)?;

    let ccd = parse_date_cell(&raw.construction_completion)
        .ok_or_else(|| invalid_date("ConstructionCompletion", &raw.construction_completion))?;
    let settlement_date =
        parse_date_cell(&raw.settlement).ok_or_else(|| invalid_date("Settlement", &raw.settlement))?;
    let first_use_date = resolve_first_use(&raw.available_first_use_formula, Some(settlement_date))
        .ok_or_else(|| invalid_date("AvailableFirstUseFormula", &raw.available_first_use_formula))?;
    let common_entitlement = raw
        .common_entitlement_formula
        .text()
        .and_then(parse_number)
        .ok_or_else(|| ValidationError::NotNumeric {
            field: "CommonEntitlementFormula",
            value: raw.common_entitlement_formula.raw().unwrap_or_default().to_string(),
        })?;

    Ok(NormalizedDeal {
        deal_name,
        ccd,
        settlement_date,
        first_use_date,
        common_entitlement,
        purchase_price: passthrough(&raw.purchase_price),
        land_value: passthrough(&raw.land_value),
        number_of_levels: passthrough(&raw.number_of_levels),
        number_of_units: passthrough(&raw.number_of_units),
        strata_plan_provider: passthrough(&raw.strata_plan_provider),
        verbal_information_provided_by: passthrough(&raw.verbal_information_provided_by),
        written_information_provided_by: passthrough(&raw.written_information_provided_by),
        council_name: passthrough(&raw.council_name),
    })
}

pub fn build_report(
    raw: &RawReport,
    division_40: &[RawAsset],
    division_43: &[RawAsset],
) -> Result<NormalizedReport, ValidationError> {
    let reference = reference_of(raw)?;
    let report_date =
        parse_date_cell(&raw.report_date).ok_or_else(|| invalid_date("ReportDate", &raw.report_date))?;

    Ok(NormalizedReport {
        reference,
        report_date,
        years_in_schedule: classify_cell(&raw.years_in_schedule),
        pre_notional_write_down_years: classify_cell(&raw.pre_notional_write_down_years),
        notional_write_down_rate: classify_cell(&raw.notional_write_down_rate),
        notional_write_down_governor: classify_cell(&raw.notional_write_down_governor),
        preliminary_fees: classify_cell(&raw.preliminary_fees),
        expenditure_governor: classify_cell(&raw.expenditure_governor),
        consultancy_fees: classify_cell(&raw.consultancy_fees),
        number_of_years_to_back_claim: classify_cell(&raw.number_of_years_to_back_claim),
        division_40_assets: division_40.iter().map(|a| map_asset(Division::Div40, a)).collect(),
        division_43_assets: division_43.iter().map(|a| map_asset(Division::Div43, a)).collect(),
    })
}

/// Total mapping of one asset row; values that do not parse are carried as formulas.
pub fn map_asset(division: Division, raw: &RawAsset) -> NormalizedAsset {
    let plant = match division {
        Division::Div40 => Some(PlantElections {
            depreciation_method: depreciation_method(&raw.hundred_percent_option),
            is_division_43_deduction: parse_flag(&raw.is_division43_deduction),
            number_of_items: classify_cell(&raw.number_of_items),
            exclude_fees: parse_flag(&raw.exclude_fees),
            exclude_expenditure: parse_flag(&raw.exclude_expenditure),
        }),
        Division::Div43 => None,
    };

    NormalizedAsset {
        division,
        name: passthrough(&raw.name),
        area: classify_area(&raw.area),
        installation_date_formula: resolve_date_or_formula(&raw.installation_date_formula),
        rate_formula: classify_cell(&raw.rate_formula),
        quantity_formula: classify_cell(&raw.quantity_formula),
        scrapped_date_formula: resolve_date_or_formula(&raw.scrapped_date_formula),
        is_given_cost: parse_flag(&raw.is_given_cost),
        plant,
    }
}
