//! # Completion report data model.
//!
//! The report is a tree `run → workbooks[] → sheets[] → tables[]`. Every node
//! carries [`Counts`] and a [`ValidationSummary`]; tables additionally carry a
//! [`TableStructure`]; only the run node carries [`Execution`] and
//! [`Evaluation`].
//!
//! Every type rejects unknown fields: the report travels inside the
//! `run.completed` payload and is validated like any other payload.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::RunId;
use crate::orchestrator::{Failure, RunStatus};

use super::mapping::MappingDecision;

/// Version of the report layout carried in `RunReport::report_version`.
pub const REPORT_VERSION: u32 = 1;

/// Root of the completion report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunReport {
    pub report_version: u32,
    pub run_id: RunId,
    pub counts: Counts,
    pub validation: ValidationSummary,
    pub workbook_count: u64,
    pub sheet_count: u64,
    pub table_count: u64,
    /// Field-centric rollup, one entry per expected or mapped field, sorted by name.
    pub fields: Vec<FieldSummary>,
    pub workbooks: Vec<WorkbookSummary>,
    pub execution: Execution,
    pub evaluation: Evaluation,
}

impl RunReport {
    /// Iterates over every table in document order.
    pub fn tables(&self) -> impl Iterator<Item = &TableSummary> {
        self.workbooks
            .iter()
            .flat_map(|w| w.sheets.iter())
            .flat_map(|s| s.tables.iter())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkbookSummary {
    pub name: String,
    /// The engine reported the workbook as fully processed.
    pub completed: bool,
    pub counts: Counts,
    pub validation: ValidationSummary,
    pub sheet_count: u64,
    pub table_count: u64,
    pub sheets: Vec<SheetSummary>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SheetSummary {
    pub name: String,
    pub index: u32,
    /// The engine reported the sheet as fully processed.
    pub completed: bool,
    pub counts: Counts,
    pub validation: ValidationSummary,
    pub table_count: u64,
    pub tables: Vec<TableSummary>,
}

/// Leaf of the report: one detected table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableSummary {
    pub index: u32,
    pub counts: Counts,
    pub validation: ValidationSummary,
    pub structure: TableStructure,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableStructure {
    pub region: Region,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<RowSpan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RowSpan>,
    /// Physical columns in sheet order.
    pub columns: Vec<ColumnSummary>,
}

/// Rectangular sheet region, 1-based and inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Region {
    pub first_row: u32,
    pub last_row: u32,
    pub first_column: u32,
    pub last_column: u32,
}

impl Region {
    /// Number of rows covered (0 for an inverted region).
    pub fn row_count(&self) -> u64 {
        span_len(self.first_row, self.last_row)
    }

    /// Number of columns covered (0 for an inverted region).
    pub fn column_count(&self) -> u64 {
        span_len(self.first_column, self.last_column)
    }
}

/// Inclusive row range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowSpan {
    pub start: u32,
    pub end: u32,
}

impl RowSpan {
    pub fn len(&self) -> u64 {
        span_len(self.start, self.end)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn span_len(first: u32, last: u32) -> u64 {
    if last < first {
        0
    } else {
        u64::from(last - first) + 1
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnSummary {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_normalized: Option<String>,
    pub non_empty_cells: u64,
    pub mapping: MappingDecision,
}

/// Counters shared by every scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Counts {
    pub rows: RowCounts,
    pub columns: ColumnCounts,
    pub cells: CellCounts,
    pub fields: FieldCounts,
}

impl Counts {
    /// Adds the summable counters of `child`. Field counts are not summed;
    /// they are deduplicated by the builder.
    pub fn absorb(&mut self, child: &Counts) {
        self.rows.total += child.rows.total;
        self.rows.header += child.rows.header;
        self.rows.data += child.rows.data;
        self.columns.total += child.columns.total;
        self.columns.mapped += child.columns.mapped;
        self.columns.ambiguous += child.columns.ambiguous;
        self.columns.unmapped += child.columns.unmapped;
        self.columns.passthrough += child.columns.passthrough;
        self.cells.total += child.cells.total;
        self.cells.non_empty += child.cells.non_empty;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowCounts {
    pub total: u64,
    pub header: u64,
    pub data: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnCounts {
    pub total: u64,
    pub mapped: u64,
    pub ambiguous: u64,
    pub unmapped: u64,
    pub passthrough: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CellCounts {
    pub total: u64,
    pub non_empty: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldCounts {
    pub expected: u64,
    pub mapped: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeverityCounts {
    pub error: u64,
    pub warning: u64,
    pub info: u64,
}

impl SeverityCounts {
    pub fn total(&self) -> u64 {
        self.error + self.warning + self.info
    }

    fn add(&mut self, severity: Severity, n: u64) {
        match severity {
            Severity::Error => self.error += n,
            Severity::Warning => self.warning += n,
            Severity::Info => self.info += n,
        }
    }
}

/// One line of the validation breakdown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssueCount {
    pub code: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub count: u64,
}

/// Validation totals for one scope.
///
/// `total == by_severity.total() == sum(issues[].count)` always holds; the
/// only way to build one is [`ValidationSummary::from_issues`] or
/// [`ValidationSummary::merge`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationSummary {
    pub total: u64,
    pub by_severity: SeverityCounts,
    pub issues: Vec<IssueCount>,
}

type IssueKey = (String, Severity, Option<String>);

impl ValidationSummary {
    /// Builds a summary from raw issues, merging duplicates by `(code, severity, field)`.
    pub fn from_issues<I>(issues: I) -> Self
    where
        I: IntoIterator<Item = IssueCount>,
    {
        let mut merged: BTreeMap<IssueKey, u64> = BTreeMap::new();
        for issue in issues {
            if issue.count == 0 {
                continue;
            }
            *merged
                .entry((issue.code, issue.severity, issue.field))
                .or_default() += issue.count;
        }
        Self::from_merged(merged)
    }

    /// Sums child summaries.
    pub fn merge<'a, I>(children: I) -> Self
    where
        I: IntoIterator<Item = &'a ValidationSummary>,
    {
        Self::from_issues(children.into_iter().flat_map(|c| c.issues.iter().cloned()))
    }

    fn from_merged(merged: BTreeMap<IssueKey, u64>) -> Self {
        let mut by_severity = SeverityCounts::default();
        let issues: Vec<IssueCount> = merged
            .into_iter()
            .map(|((code, severity, field), count)| {
                by_severity.add(severity, count);
                IssueCount {
                    code,
                    severity,
                    field,
                    count,
                }
            })
            .collect();
        Self {
            total: by_severity.total(),
            by_severity,
            issues,
        }
    }
}

/// Run-level execution facts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Execution {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failure,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCode {
    ExecutionFailed,
    ExecutionCancelled,
    NoTablesDetected,
    NoFieldsMapped,
    FieldsUnmapped,
    ValidationErrors,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Finding {
    pub code: FindingCode,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Evaluation {
    pub outcome: Outcome,
    pub findings: Vec<Finding>,
}

/// Field-centric rollup entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSummary {
    pub field: String,
    pub expected: bool,
    pub mapped: bool,
    /// Number of physical columns mapped to this field across all tables.
    pub occurrences: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_score: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(code: &str, severity: Severity, count: u64) -> IssueCount {
        IssueCount {
            code: code.into(),
            severity,
            field: None,
            count,
        }
    }

    #[test]
    fn validation_totals_match_breakdown() {
        let v = ValidationSummary::from_issues(vec![
            issue("required_missing", Severity::Error, 2),
            issue("required_missing", Severity::Error, 1),
            issue("format", Severity::Warning, 4),
            issue("noop", Severity::Info, 0),
        ]);
        assert_eq!(v.total, 7);
        assert_eq!(v.by_severity.error, 3);
        assert_eq!(v.by_severity.warning, 4);
        assert_eq!(v.issues.len(), 2);
        assert_eq!(v.issues.iter().map(|i| i.count).sum::<u64>(), v.total);
    }

    #[test]
    fn merge_sums_children() {
        let a = ValidationSummary::from_issues(vec![issue("x", Severity::Error, 1)]);
        let b = ValidationSummary::from_issues(vec![
            issue("x", Severity::Error, 2),
            issue("y", Severity::Info, 1),
        ]);
        let m = ValidationSummary::merge([&a, &b]);
        assert_eq!(m.total, 4);
        assert_eq!(m.by_severity.error, 3);
        assert_eq!(m.by_severity.info, 1);
    }

    #[test]
    fn inverted_spans_are_empty() {
        let r = Region {
            first_row: 5,
            last_row: 4,
            first_column: 1,
            last_column: 3,
        };
        assert_eq!(r.row_count(), 0);
        assert_eq!(r.column_count(), 3);
        assert!(RowSpan { start: 3, end: 2 }.is_empty());
    }

    #[test]
    fn report_rejects_unknown_fields() {
        let json = r#"{"rows":{"total":1,"header":0,"data":1},"columns":{"total":0,"mapped":0,"ambiguous":0,"unmapped":0,"passthrough":0},"cells":{"total":0,"non_empty":0},"fields":{"expected":0,"mapped":0},"extra":1}"#;
        assert!(serde_json::from_str::<Counts>(json).is_err());
    }
}
