//! # Incremental completion-report builder.
//!
//! [`RunReportBuilder`] is created when a run starts and fed as the engine
//! finishes each table, sheet and workbook. [`RunReportBuilder::finalize`]
//! consumes the builder, so a report can be produced at most once per builder.
//!
//! ## Rollup rules
//! - Table counts are computed from the table's own facts.
//! - Sheet/workbook/run counts and validation are sums of their children,
//!   never re-derived from raw facts.
//! - Field counts are deduplicated per field at every scope: a field mapped in
//!   three tables counts once.
//!
//! ## Example
//! ```rust
//! use runvisor::config::MappingConfig;
//! use runvisor::report::{RunReportBuilder, ExecutionFacts};
//! use runvisor::{RunId, RunStatus};
//!
//! let builder = RunReportBuilder::new(RunId::generate(), MappingConfig::default());
//! let report = builder.finalize(ExecutionFacts::now(RunStatus::Failed, None, None));
//! assert_eq!(report.table_count, 0);
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::config::MappingConfig;
use crate::ids::RunId;
use crate::orchestrator::{Failure, RunStatus};

use super::facts::TableFacts;
use super::grading::{GradeInput, grade};
use super::mapping::{MappingDecision, classify};
use super::model::{
    CellCounts, ColumnCounts, ColumnSummary, Counts, Execution, FieldCounts, FieldSummary,
    IssueCount, REPORT_VERSION, RowCounts, RunReport, SheetSummary, TableStructure,
    TableSummary, ValidationSummary, WorkbookSummary,
};

/// Terminal execution facts supplied at finalization.
#[derive(Clone, Debug)]
pub struct ExecutionFacts {
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub failure: Option<Failure>,
}

impl ExecutionFacts {
    /// Facts for a run terminating right now.
    pub fn now(
        status: RunStatus,
        started_at: Option<DateTime<Utc>>,
        failure: Option<Failure>,
    ) -> Self {
        Self {
            status,
            started_at,
            completed_at: Utc::now(),
            failure,
        }
    }

    fn into_execution(self) -> Execution {
        let duration_ms = self
            .started_at
            .map(|s| (self.completed_at - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        Execution {
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms,
            failure: self.failure,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct FieldHit {
    occurrences: u64,
    best: f64,
}

type FieldHits = BTreeMap<String, FieldHit>;

struct TableNode {
    summary: TableSummary,
    fields: FieldHits,
}

struct SheetNode {
    name: String,
    index: u32,
    completed: bool,
    tables: Vec<TableNode>,
}

struct WorkbookNode {
    name: String,
    completed: bool,
    sheets: Vec<SheetNode>,
}

/// Accumulates table facts into a hierarchical [`RunReport`].
pub struct RunReportBuilder {
    run_id: RunId,
    mapping: MappingConfig,
    declared: BTreeSet<String>,
    workbooks: Vec<WorkbookNode>,
}

impl RunReportBuilder {
    pub fn new(run_id: RunId, mapping: MappingConfig) -> Self {
        Self {
            run_id,
            mapping,
            declared: BTreeSet::new(),
            workbooks: Vec::new(),
        }
    }

    /// Declares the configuration's canonical fields. Repeated calls accumulate.
    pub fn declare_fields<I, S>(&mut self, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared.extend(
            fields
                .into_iter()
                .map(Into::into)
                .filter(|f: &String| !f.trim().is_empty()),
        );
    }

    /// Summarizes one table and attaches it to its sheet.
    ///
    /// Returns the table node as it stands now (field counts use the fields
    /// declared so far); the final report recomputes field counts.
    /// A table reported twice at the same position replaces the earlier one.
    pub fn add_table(&mut self, facts: TableFacts) -> TableSummary {
        let TableFacts {
            workbook,
            sheet,
            sheet_index,
            table_index,
            region,
            header,
            data,
            columns,
            issues,
        } = facts;

        let columns: Vec<ColumnSummary> = columns
            .iter()
            .map(|c| ColumnSummary {
                index: c.index,
                header_raw: c.header_raw.clone(),
                header_normalized: c.header_normalized.clone(),
                non_empty_cells: c.non_empty_cells,
                mapping: classify(c, &self.mapping),
            })
            .collect();

        let mut fields = FieldHits::new();
        let mut column_counts = ColumnCounts {
            total: columns.len() as u64,
            ..ColumnCounts::default()
        };
        for col in &columns {
            match &col.mapping {
                MappingDecision::Mapped { field, score, .. } => {
                    column_counts.mapped += 1;
                    let hit = fields.entry(field.clone()).or_insert(FieldHit {
                        occurrences: 0,
                        best: *score,
                    });
                    hit.occurrences += 1;
                    hit.best = hit.best.max(*score);
                }
                MappingDecision::Ambiguous { .. } => column_counts.ambiguous += 1,
                MappingDecision::Unmapped { .. } => column_counts.unmapped += 1,
                MappingDecision::Passthrough { .. } => column_counts.passthrough += 1,
            }
        }

        let rows_total = region.row_count();
        let rows = RowCounts {
            total: rows_total,
            header: header.map(|h| h.len()).unwrap_or(0).min(rows_total),
            data: data.map(|d| d.len()).unwrap_or(0).min(rows_total),
        };
        let cells_total = rows_total * column_counts.total;
        let cells = CellCounts {
            total: cells_total,
            non_empty: columns
                .iter()
                .map(|c| c.non_empty_cells)
                .sum::<u64>()
                .min(cells_total),
        };

        let validation = ValidationSummary::from_issues(issues.into_iter().map(|i| IssueCount {
            code: i.code,
            severity: i.severity,
            field: i.field,
            count: i.count,
        }));

        let summary = TableSummary {
            index: table_index,
            counts: Counts {
                rows,
                columns: column_counts,
                cells,
                fields: field_counts(&fields, &self.expected_so_far(&fields)),
            },
            validation,
            structure: TableStructure {
                region,
                header,
                data,
                columns,
            },
        };

        let sheet_node = self.sheet_mut(&workbook, &sheet, sheet_index);
        let node = TableNode {
            summary: summary.clone(),
            fields,
        };
        match sheet_node
            .tables
            .iter_mut()
            .find(|t| t.summary.index == table_index)
        {
            Some(existing) => {
                tracing::warn!(
                    workbook = %workbook,
                    sheet = %sheet,
                    table_index,
                    "table reported twice; keeping the latest summary"
                );
                *existing = node;
            }
            None => sheet_node.tables.push(node),
        }
        summary
    }

    /// Marks a sheet as fully processed (creates it if it had no tables).
    pub fn complete_sheet(&mut self, workbook: &str, sheet: &str, sheet_index: u32) {
        self.sheet_mut(workbook, sheet, sheet_index).completed = true;
    }

    /// Marks a workbook as fully processed (creates it if it had no sheets).
    pub fn complete_workbook(&mut self, workbook: &str) {
        self.workbook_mut(workbook).completed = true;
    }

    /// Number of tables summarized so far.
    pub fn table_count(&self) -> u64 {
        self.workbooks
            .iter()
            .flat_map(|w| &w.sheets)
            .map(|s| s.tables.len() as u64)
            .sum()
    }

    /// Computes rollups, grades the run and produces the report.
    pub fn finalize(self, execution: ExecutionFacts) -> RunReport {
        let all_hits = self.all_field_hits();
        let expected: BTreeSet<String> = if self.declared.is_empty() {
            all_hits.keys().cloned().collect()
        } else {
            self.declared.clone()
        };

        let mut run_counts = Counts::default();
        let mut run_fields = FieldHits::new();
        let mut run_sheet_count = 0u64;
        let mut run_table_count = 0u64;
        let mut workbooks = Vec::with_capacity(self.workbooks.len());

        for wb in self.workbooks {
            let mut wb_counts = Counts::default();
            let mut wb_fields = FieldHits::new();
            let mut wb_table_count = 0u64;
            let mut sheets = Vec::with_capacity(wb.sheets.len());

            for sh in wb.sheets {
                let mut sh_counts = Counts::default();
                let mut sh_fields = FieldHits::new();
                let mut tables = Vec::with_capacity(sh.tables.len());

                for mut t in sh.tables {
                    t.summary.counts.fields = field_counts(&t.fields, &expected);
                    sh_counts.absorb(&t.summary.counts);
                    union_into(&mut sh_fields, &t.fields);
                    tables.push(t.summary);
                }

                sh_counts.fields = field_counts(&sh_fields, &expected);
                let sheet = SheetSummary {
                    name: sh.name,
                    index: sh.index,
                    completed: sh.completed,
                    counts: sh_counts,
                    validation: ValidationSummary::merge(tables.iter().map(|t| &t.validation)),
                    table_count: tables.len() as u64,
                    tables,
                };

                wb_counts.absorb(&sheet.counts);
                wb_table_count += sheet.table_count;
                union_into(&mut wb_fields, &sh_fields);
                sheets.push(sheet);
            }

            wb_counts.fields = field_counts(&wb_fields, &expected);
            let workbook = WorkbookSummary {
                name: wb.name,
                completed: wb.completed,
                counts: wb_counts,
                validation: ValidationSummary::merge(sheets.iter().map(|s| &s.validation)),
                sheet_count: sheets.len() as u64,
                table_count: wb_table_count,
                sheets,
            };

            run_counts.absorb(&workbook.counts);
            run_sheet_count += workbook.sheet_count;
            run_table_count += workbook.table_count;
            union_into(&mut run_fields, &wb_fields);
            workbooks.push(workbook);
        }

        run_counts.fields = field_counts(&run_fields, &expected);
        let validation = ValidationSummary::merge(workbooks.iter().map(|w| &w.validation));

        let fields = field_rollup(&expected, &run_fields);
        let execution = execution.into_execution();
        let evaluation = grade(GradeInput {
            status: execution.status,
            tables: run_table_count,
            expected_fields: run_counts.fields.expected,
            mapped_fields: run_counts.fields.mapped,
            validation_errors: validation.by_severity.error,
        });

        RunReport {
            report_version: REPORT_VERSION,
            run_id: self.run_id,
            counts: run_counts,
            validation,
            workbook_count: workbooks.len() as u64,
            sheet_count: run_sheet_count,
            table_count: run_table_count,
            fields,
            workbooks,
            execution,
            evaluation,
        }
    }

    fn expected_so_far(&self, extra: &FieldHits) -> BTreeSet<String> {
        if self.declared.is_empty() {
            let mut all: BTreeSet<String> = self.all_field_hits().into_keys().collect();
            all.extend(extra.keys().cloned());
            all
        } else {
            self.declared.clone()
        }
    }

    fn all_field_hits(&self) -> FieldHits {
        let mut all = FieldHits::new();
        for t in self
            .workbooks
            .iter()
            .flat_map(|w| &w.sheets)
            .flat_map(|s| &s.tables)
        {
            union_into(&mut all, &t.fields);
        }
        all
    }

    fn workbook_mut(&mut self, name: &str) -> &mut WorkbookNode {
        let pos = match self.workbooks.iter().position(|w| w.name == name) {
            Some(pos) => pos,
            None => {
                self.workbooks.push(WorkbookNode {
                    name: name.to_owned(),
                    completed: false,
                    sheets: Vec::new(),
                });
                self.workbooks.len() - 1
            }
        };
        &mut self.workbooks[pos]
    }

    fn sheet_mut(&mut self, workbook: &str, sheet: &str, index: u32) -> &mut SheetNode {
        let wb = self.workbook_mut(workbook);
        let pos = match wb.sheets.iter().position(|s| s.name == sheet) {
            Some(pos) => pos,
            None => {
                wb.sheets.push(SheetNode {
                    name: sheet.to_owned(),
                    index,
                    completed: false,
                    tables: Vec::new(),
                });
                wb.sheets.len() - 1
            }
        };
        &mut wb.sheets[pos]
    }
}

fn union_into(into: &mut FieldHits, from: &FieldHits) {
    for (field, hit) in from {
        into.entry(field.clone())
            .and_modify(|h| {
                h.occurrences += hit.occurrences;
                h.best = h.best.max(hit.best);
            })
            .or_insert(*hit);
    }
}

fn field_counts(mapped: &FieldHits, expected: &BTreeSet<String>) -> FieldCounts {
    FieldCounts {
        expected: expected.len() as u64,
        mapped: mapped.keys().filter(|f| expected.contains(*f)).count() as u64,
    }
}

fn field_rollup(expected: &BTreeSet<String>, mapped: &FieldHits) -> Vec<FieldSummary> {
    let names: BTreeSet<&String> = expected.iter().chain(mapped.keys()).collect();
    names
        .into_iter()
        .map(|name| {
            let hit = mapped.get(name);
            FieldSummary {
                field: name.clone(),
                expected: expected.contains(name),
                mapped: hit.is_some(),
                occurrences: hit.map(|h| h.occurrences).unwrap_or(0),
                best_score: hit.map(|h| h.best),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::FailureStage;
    use crate::report::facts::{ColumnFacts, IssueFacts};
    use crate::report::model::{Outcome, Region, RowSpan, Severity};

    fn col(index: u32, header: &str, chosen: Option<&str>) -> ColumnFacts {
        ColumnFacts {
            index,
            header_raw: Some(header.into()),
            header_normalized: Some(header.to_lowercase()),
            non_empty_cells: 3,
            candidates: vec![],
            chosen: chosen.map(str::to_owned),
            score: chosen.map(|_| 0.9),
            method: None,
            passthrough: false,
        }
    }

    fn table(wb: &str, sheet: &str, idx: u32, rows: u32, cols: Vec<ColumnFacts>) -> TableFacts {
        TableFacts {
            workbook: wb.into(),
            sheet: sheet.into(),
            sheet_index: 0,
            table_index: idx,
            region: Region {
                first_row: 1,
                last_row: rows,
                first_column: 1,
                last_column: cols.len() as u32,
            },
            header: Some(RowSpan { start: 1, end: 1 }),
            data: Some(RowSpan { start: 2, end: rows }),
            columns: cols,
            issues: vec![],
        }
    }

    fn succeeded() -> ExecutionFacts {
        ExecutionFacts::now(RunStatus::Succeeded, Some(Utc::now()), None)
    }

    #[test]
    fn single_mapped_table_is_success() {
        let mut b = RunReportBuilder::new(RunId::from("r"), MappingConfig::default());
        b.add_table(table("book.xlsx", "Sheet1", 0, 4, vec![col(1, "Email", Some("email"))]));
        let r = b.finalize(succeeded());

        assert_eq!(r.table_count, 1);
        assert_eq!(r.counts.rows.total, 4);
        assert_eq!(r.counts.rows.header, 1);
        assert_eq!(r.counts.rows.data, 3);
        assert_eq!(r.counts.fields.expected, 1);
        assert_eq!(r.counts.fields.mapped, 1);
        assert_eq!(r.evaluation.outcome, Outcome::Success);
    }

    #[test]
    fn rollups_sum_children_and_dedupe_fields() {
        let mut b = RunReportBuilder::new(RunId::from("r"), MappingConfig::default());
        b.declare_fields(["email", "name", "phone"]);
        b.add_table(table("a.xlsx", "S1", 0, 5, vec![col(1, "Email", Some("email")), col(2, "X", None)]));
        b.add_table(table("a.xlsx", "S1", 1, 3, vec![col(1, "E-mail", Some("email"))]));
        b.add_table(table("a.xlsx", "S2", 0, 10, vec![col(1, "Name", Some("name"))]));
        b.add_table(table("b.xlsx", "S1", 0, 2, vec![col(1, "Mail", Some("email"))]));
        let r = b.finalize(succeeded());

        for wb in &r.workbooks {
            for sh in &wb.sheets {
                let sum: u64 = sh.tables.iter().map(|t| t.counts.rows.total).sum();
                assert_eq!(sum, sh.counts.rows.total);
            }
            let sum: u64 = wb.sheets.iter().map(|s| s.counts.rows.total).sum();
            assert_eq!(sum, wb.counts.rows.total);
        }
        let sum: u64 = r.workbooks.iter().map(|w| w.counts.rows.total).sum();
        assert_eq!(sum, r.counts.rows.total);
        assert_eq!(r.counts.rows.total, 20);

        assert_eq!(r.counts.columns.mapped, 4);
        assert_eq!(r.counts.fields.expected, 3);
        assert_eq!(r.counts.fields.mapped, 2);
        assert_eq!(r.workbooks[0].counts.fields.mapped, 2);
        assert_eq!(r.workbooks[1].counts.fields.mapped, 1);

        let email = r.fields.iter().find(|f| f.field == "email").unwrap();
        assert_eq!(email.occurrences, 3);
        let phone = r.fields.iter().find(|f| f.field == "phone").unwrap();
        assert!(!phone.mapped);

        assert_eq!(r.evaluation.outcome, Outcome::Partial);
        assert_eq!(r.sheet_count, 3);
        assert_eq!(r.workbook_count, 2);
    }

    #[test]
    fn validation_rolls_up_and_errors_downgrade() {
        let mut b = RunReportBuilder::new(RunId::from("r"), MappingConfig::default());
        let mut t = table("a", "s", 0, 3, vec![col(1, "Email", Some("email"))]);
        t.issues = vec![
            IssueFacts {
                code: "invalid_email".into(),
                severity: Severity::Error,
                field: Some("email".into()),
                count: 2,
            },
            IssueFacts {
                code: "trailing_space".into(),
                severity: Severity::Warning,
                field: None,
                count: 5,
            },
        ];
        b.add_table(t);
        let r = b.finalize(succeeded());
        assert_eq!(r.validation.total, 7);
        assert_eq!(r.validation.by_severity.error, 2);
        assert_eq!(r.workbooks[0].sheets[0].validation, r.validation);
        assert_eq!(r.evaluation.outcome, Outcome::Partial);
    }

    #[test]
    fn failure_before_tables_is_unknown() {
        let b = RunReportBuilder::new(RunId::from("r"), MappingConfig::default());
        let failure = Failure {
            stage: FailureStage::Build,
            code: "build_phase_failed".into(),
            message: "pip exploded".into(),
        };
        let r = b.finalize(ExecutionFacts::now(RunStatus::Failed, None, Some(failure)));
        assert_eq!(r.evaluation.outcome, Outcome::Unknown);
        assert_eq!(r.execution.duration_ms, 0);
        assert!(r.execution.failure.is_some());
    }

    #[test]
    fn interrupted_scopes_are_reported_incomplete() {
        let mut b = RunReportBuilder::new(RunId::from("r"), MappingConfig::default());
        b.add_table(table("a", "done", 0, 3, vec![col(1, "Email", Some("email"))]));
        b.complete_sheet("a", "done", 0);
        b.add_table(table("a", "cut", 0, 3, vec![col(1, "Email", Some("email"))]));

        let r = b.finalize(succeeded());
        let wb = &r.workbooks[0];
        assert!(!wb.completed);
        let by_name: Vec<(&str, bool)> = wb.sheets.iter().map(|s| (s.name.as_str(), s.completed)).collect();
        assert_eq!(by_name, vec![("done", true), ("cut", false)]);
    }

    #[test]
    fn duplicate_table_position_replaces() {
        let mut b = RunReportBuilder::new(RunId::from("r"), MappingConfig::default());
        b.add_table(table("a", "s", 0, 3, vec![col(1, "Email", None)]));
        b.add_table(table("a", "s", 0, 9, vec![col(1, "Email", Some("email"))]));
        assert_eq!(b.table_count(), 1);
        let r = b.finalize(succeeded());
        assert_eq!(r.counts.rows.total, 9);
    }

    #[test]
    fn empty_sheets_and_workbooks_still_appear() {
        let mut b = RunReportBuilder::new(RunId::from("r"), MappingConfig::default());
        b.complete_sheet("a.xlsx", "Empty", 2);
        b.complete_workbook("a.xlsx");
        b.complete_workbook("b.xlsx");
        let r = b.finalize(succeeded());
        assert_eq!(r.workbook_count, 2);
        assert_eq!(r.sheet_count, 1);
        assert!(r.workbooks.iter().all(|w| w.completed));
        assert!(r.workbooks[0].sheets[0].completed);
        assert_eq!(r.evaluation.outcome, Outcome::Failure);
    }
}
