//! Structural facts handed over by the extraction engine.
//!
//! These are inputs: raw observations about one table. The builder turns them
//! into [`TableSummary`](super::TableSummary) nodes.

use serde::{Deserialize, Serialize};

use super::mapping::Candidate;
use super::model::{Region, RowSpan, Severity};

/// Everything the engine knows about one finished table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableFacts {
    pub workbook: String,
    pub sheet: String,
    #[serde(default)]
    pub sheet_index: u32,
    #[serde(default)]
    pub table_index: u32,
    pub region: Region,
    #[serde(default)]
    pub header: Option<RowSpan>,
    #[serde(default)]
    pub data: Option<RowSpan>,
    #[serde(default)]
    pub columns: Vec<ColumnFacts>,
    #[serde(default)]
    pub issues: Vec<IssueFacts>,
}

/// One physical column with the engine's mapping evidence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnFacts {
    pub index: u32,
    #[serde(default)]
    pub header_raw: Option<String>,
    #[serde(default)]
    pub header_normalized: Option<String>,
    #[serde(default)]
    pub non_empty_cells: u64,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    /// Field the engine assigned, if any.
    #[serde(default)]
    pub chosen: Option<String>,
    /// Score of the assignment; falls back to the chosen candidate's score.
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub method: Option<String>,
    /// Column is kept verbatim by configuration.
    #[serde(default)]
    pub passthrough: bool,
}

/// Validation issues of one kind within a table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssueFacts {
    pub code: String,
    pub severity: Severity,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default = "one")]
    pub count: u64,
}

fn one() -> u64 {
    1
}
