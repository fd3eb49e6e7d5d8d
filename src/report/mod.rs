//! # Run completion report.
//!
//! Built incrementally while a run executes and embedded, once, in the
//! terminal `run.completed` event.
//!
//! - [`facts`] engine-supplied table observations
//! - [`mapping`] per-column mapping decisions
//! - [`builder`] incremental accumulation and rollups
//! - [`grading`] outcome classification
//! - [`model`] the serialized report tree

pub mod builder;
pub mod facts;
pub mod grading;
pub mod mapping;
pub mod model;

pub use builder::{ExecutionFacts, RunReportBuilder};
pub use facts::{ColumnFacts, IssueFacts, TableFacts};
pub use grading::{GradeInput, grade};
pub use mapping::{Candidate, MappingDecision};
pub use model::{
    Counts, Evaluation, Execution, FieldSummary, Finding, FindingCode, Outcome, REPORT_VERSION,
    Region, RowSpan, RunReport, Severity, SheetSummary, TableSummary, ValidationSummary,
    WorkbookSummary,
};
