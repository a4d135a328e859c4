//! Core domain model and field normalization for the depreciation report migrator.

use std::fmt;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "depmig-core";

/// Prefix tagging a value as an unevaluated expression for a downstream evaluator.
pub const FORMULA_MARKER: char = '=';

/// Installation-date sentinel meaning "installed at construction completion".
pub const INSTALLED_AT_COMPLETION: &str = "cc";

/// First-use sentinel meaning "first available on the settlement date".
pub const FIRST_USE_AT_SETTLEMENT: &str = "settlement";

/// Expression name the downstream evaluator resolves to the construction-completion date.
pub const CONSTRUCTION_COMPLETION_REF: &str = "ccd";

/// One loosely-typed value from the extract.
///
/// Extract rows mix JSON strings, numbers, booleans and nulls for the same
/// column, so every column is read as optional text and interpreted later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Cell(Option<String>);

impl Cell {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Some(value.into()))
    }

    pub fn empty() -> Self {
        Self(None)
    }

    pub fn raw(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Trimmed text, or `None` when absent or blank.
    pub fn text(&self) -> Option<&str> {
        self.0.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for Cell {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(Self(match value {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(s)) => Some(s),
            Some(JsonValue::Bool(b)) => Some(if b { "1" } else { "0" }.to_string()),
            Some(other) => Some(other.to_string()),
        }))
    }
}

/// One row of the report extract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RawReport {
    #[serde(rename = "ID")]
    pub id: Cell,
    pub reference: Cell,
    pub construction_completion: Cell,
    pub settlement: Cell,
    pub available_first_use_formula: Cell,
    pub common_entitlement_formula: Cell,
    pub purchase_price: Cell,
    pub land_value: Cell,
    pub number_of_levels: Cell,
    pub number_of_units: Cell,
    pub strata_plan_provider: Cell,
    pub verbal_information_provided_by: Cell,
    pub written_information_provided_by: Cell,
    pub council_name: Cell,
    pub report_date: Cell,
    pub years_in_schedule: Cell,
    pub pre_notional_write_down_years: Cell,
    pub notional_write_down_rate: Cell,
    pub notional_write_down_governor: Cell,
    pub preliminary_fees: Cell,
    pub expenditure_governor: Cell,
    pub consultancy_fees: Cell,
    pub number_of_years_to_back_claim: Cell,
}

/// One row of a Division 40 or Division 43 asset extract.
///
/// Division 43 rows simply leave the Division 40 election columns empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RawAsset {
    #[serde(rename = "ReportID")]
    pub report_id: Cell,
    pub name: Cell,
    pub area: Cell,
    pub installation_date_formula: Cell,
    pub rate_formula: Cell,
    pub quantity_formula: Cell,
    pub scrapped_date_formula: Cell,
    pub is_given_cost: Cell,
    pub is_division43_deduction: Cell,
    pub hundred_percent_option: Cell,
    pub number_of_items: Cell,
    pub exclude_fees: Cell,
    pub exclude_expenditure: Cell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Division {
    /// Plant and equipment.
    #[serde(rename = "division_40")]
    Div40,
    /// Capital works.
    #[serde(rename = "division_43")]
    Div43,
}

impl Division {
    pub const ALL: [Division; 2] = [Division::Div40, Division::Div43];

    /// File-name prefix shared by the full extract and the per-report artifacts.
    pub fn artifact_prefix(self) -> &'static str {
        match self {
            Division::Div40 => "div-40",
            Division::Div43 => "div-43",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Division::Div40 => "Division 40",
            Division::Div43 => "Division 43",
        }
    }
}

impl fmt::Display for Division {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A numeric literal or an unevaluated formula.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar {
    Literal(String),
    Formula(String),
}

impl Scalar {
    pub fn is_formula(&self) -> bool {
        matches!(self, Scalar::Formula(_))
    }

    /// Wire form: literals unchanged, formulas behind the formula marker.
    pub fn encoded(&self) -> String {
        match self {
            Scalar::Literal(value) => value.clone(),
            Scalar::Formula(expr) => format!("{FORMULA_MARKER}{expr}"),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded())
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded())
    }
}

/// A resolved calendar date or a formula standing in for one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateOrFormula {
    Date(NaiveDate),
    Formula(String),
}

impl DateOrFormula {
    pub fn encoded(&self) -> String {
        match self {
            DateOrFormula::Date(date) => date.format("%Y-%m-%d").to_string(),
            DateOrFormula::Formula(expr) => format!("{FORMULA_MARKER}{expr}"),
        }
    }
}

impl fmt::Display for DateOrFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded())
    }
}

impl Serialize for DateOrFormula {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AreaClass {
    #[serde(rename = "Unit Specific")]
    UnitSpecific,
    #[serde(rename = "Common Property")]
    CommonProperty,
}

impl AreaClass {
    pub fn as_str(self) -> &'static str {
        match self {
            AreaClass::UnitSpecific => "Unit Specific",
            AreaClass::CommonProperty => "Common Property",
        }
    }
}

/// Division 40 "hundred percent option" election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DepreciationMethod {
    Yes,
    No,
    Force,
}

impl DepreciationMethod {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => DepreciationMethod::Yes,
            1 => DepreciationMethod::No,
            _ => DepreciationMethod::Force,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DepreciationMethod::Yes => "Yes",
            DepreciationMethod::No => "No",
            DepreciationMethod::Force => "Force",
        }
    }
}

/// CRM projection of one report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedDeal {
    pub deal_name: String,
    pub ccd: NaiveDate,
    pub settlement_date: NaiveDate,
    pub first_use_date: NaiveDate,
    pub common_entitlement: f64,
    pub purchase_price: Option<String>,
    pub land_value: Option<String>,
    pub number_of_levels: Option<String>,
    pub number_of_units: Option<String>,
    pub strata_plan_provider: Option<String>,
    pub verbal_information_provided_by: Option<String>,
    pub written_information_provided_by: Option<String>,
    pub council_name: Option<String>,
}

/// Relational projection of one report with its line items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedReport {
    pub reference: String,
    pub report_date: NaiveDate,
    pub years_in_schedule: Option<Scalar>,
    pub pre_notional_write_down_years: Option<Scalar>,
    pub notional_write_down_rate: Option<Scalar>,
    pub notional_write_down_governor: Option<Scalar>,
    pub preliminary_fees: Option<Scalar>,
    pub expenditure_governor: Option<Scalar>,
    pub consultancy_fees: Option<Scalar>,
    pub number_of_years_to_back_claim: Option<Scalar>,
    pub division_40_assets: Vec<NormalizedAsset>,
    pub division_43_assets: Vec<NormalizedAsset>,
}

impl NormalizedReport {
    pub fn assets(&self, division: Division) -> &[NormalizedAsset] {
        match division {
            Division::Div40 => &self.division_40_assets,
            Division::Div43 => &self.division_43_assets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedAsset {
    pub division: Division,
    pub name: Option<String>,
    pub area: AreaClass,
    pub installation_date_formula: Option<DateOrFormula>,
    pub rate_formula: Option<Scalar>,
    pub quantity_formula: Option<Scalar>,
    pub scrapped_date_formula: Option<DateOrFormula>,
    pub is_given_cost: bool,
    #[serde(flatten)]
    pub plant: Option<PlantElections>,
}

/// Election fields carried only by Division 40 line items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlantElections {
    pub depreciation_method: DepreciationMethod,
    pub is_division_43_deduction: bool,
    pub number_of_items: Option<Scalar>,
    pub exclude_fees: bool,
    pub exclude_expenditure: bool,
}

fn numeric_literal_re() -> &'static Regex {
    static NUMERIC_LITERAL_RE: OnceLock<Regex> = OnceLock::new();
    NUMERIC_LITERAL_RE
        .get_or_init(|| Regex::new(r"^-?\d+(\.\d+)?$").expect("valid numeric literal regex"))
}

pub fn is_numeric_literal(input: &str) -> bool {
    numeric_literal_re().is_match(input.trim())
}

/// Classify a value as a numeric literal or a formula; blank input has no value.
pub fn classify_scalar(input: &str) -> Option<Scalar> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else if is_numeric_literal(trimmed) {
        Some(Scalar::Literal(trimmed.to_string()))
    } else {
        Some(Scalar::Formula(trimmed.to_string()))
    }
}

pub fn classify_cell(cell: &Cell) -> Option<Scalar> {
    cell.text().and_then(classify_scalar)
}

/// Parse a finite number from a numeric-literal value.
pub fn parse_number(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if !is_numeric_literal(trimmed) {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn parse_component(part: &str, min_len: usize, max_len: usize) -> Option<u32> {
    if part.len() < min_len || part.len() > max_len || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

/// Parse `day/month/year` with a one or two digit day and month and a two or
/// four digit year. Two-digit years below 50 land in 2000, the rest in 1900.
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = input.trim().split('/').map(str::trim).collect();
    let [day, month, year] = parts.as_slice() else {
        return None;
    };

    let day = parse_component(day, 1, 2)?;
    let month = parse_component(month, 1, 2)?;
    let year = match year.len() {
        2 => {
            let short = parse_component(year, 2, 2)? as i32;
            if short < 50 {
                2000 + short
            } else {
                1900 + short
            }
        }
        4 => parse_component(year, 4, 4)? as i32,
        _ => return None,
    };

    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn parse_date_cell(cell: &Cell) -> Option<NaiveDate> {
    cell.text().and_then(parse_date)
}

/// Resolve an installation or scrapped date field.
///
/// The completion sentinel becomes a reference to the completion date and any
/// value that is not a date passes through as a formula.
pub fn resolve_date_or_formula(cell: &Cell) -> Option<DateOrFormula> {
    let text = cell.text()?;
    if text.eq_ignore_ascii_case(INSTALLED_AT_COMPLETION) {
        return Some(DateOrFormula::Formula(CONSTRUCTION_COMPLETION_REF.to_string()));
    }
    Some(match parse_date(text) {
        Some(date) => DateOrFormula::Date(date),
        None => DateOrFormula::Formula(text.to_string()),
    })
}

pub fn resolve_first_use(cell: &Cell, settlement: Option<NaiveDate>) -> Option<NaiveDate> {
    let text = cell.text()?;
    if text.eq_ignore_ascii_case(FIRST_USE_AT_SETTLEMENT) {
        settlement
    } else {
        parse_date(text)
    }
}

pub fn classify_area(cell: &Cell) -> AreaClass {
    match cell.text().and_then(parse_number) {
        Some(area) if area == 0.0 => AreaClass::UnitSpecific,
        _ => AreaClass::CommonProperty,
    }
}

pub fn depreciation_method(cell: &Cell) -> DepreciationMethod {
    cell.text()
        .and_then(|code| code.parse::<i64>().ok())
        .map(DepreciationMethod::from_code)
        .unwrap_or(DepreciationMethod::Force)
}

/// `"1"`/`"true"` flags; anything else is false.
pub fn parse_flag(cell: &Cell) -> bool {
    matches!(cell.text(), Some(v) if v == "1" || v.eq_ignore_ascii_case("true"))
}
