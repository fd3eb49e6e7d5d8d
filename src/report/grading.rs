//! # Run outcome grading.
//!
//! ```text
//! execution not succeeded, 0 tables  → unknown  + execution_failed|execution_cancelled
//! 0 tables                           → failure  + no_tables_detected
//! 0 expected fields mapped           → failure  + no_fields_mapped
//! some expected fields unmapped      → partial  + fields_unmapped
//! otherwise                          → success
//!   validation errors recorded       → partial  + validation_errors
//!   execution not succeeded          → partial  + execution_failed|execution_cancelled
//! ```
//! Warnings never downgrade a run; only errors do.

use crate::orchestrator::RunStatus;

use super::model::{Evaluation, Finding, FindingCode, Outcome};

/// Facts the grader looks at.
#[derive(Clone, Copy, Debug)]
pub struct GradeInput {
    pub status: RunStatus,
    pub tables: u64,
    pub expected_fields: u64,
    pub mapped_fields: u64,
    pub validation_errors: u64,
}

pub fn grade(input: GradeInput) -> Evaluation {
    let execution_finding = execution_finding(input.status);

    if input.tables == 0 {
        if let Some(f) = execution_finding {
            return Evaluation {
                outcome: Outcome::Unknown,
                findings: vec![f],
            };
        }
        return Evaluation {
            outcome: Outcome::Failure,
            findings: vec![finding(
                FindingCode::NoTablesDetected,
                "no tables were detected in the input".to_owned(),
            )],
        };
    }

    let mut findings = Vec::new();
    let mut outcome = if input.mapped_fields == 0 {
        findings.push(finding(
            FindingCode::NoFieldsMapped,
            format!("none of the {} expected fields were mapped", input.expected_fields),
        ));
        Outcome::Failure
    } else if input.mapped_fields < input.expected_fields {
        findings.push(finding(
            FindingCode::FieldsUnmapped,
            format!(
                "{} of {} expected fields were not mapped",
                input.expected_fields - input.mapped_fields,
                input.expected_fields
            ),
        ));
        Outcome::Partial
    } else {
        Outcome::Success
    };

    if input.validation_errors > 0 {
        findings.push(finding(
            FindingCode::ValidationErrors,
            format!("{} validation errors recorded", input.validation_errors),
        ));
        if outcome == Outcome::Success {
            outcome = Outcome::Partial;
        }
    }

    if let Some(f) = execution_finding {
        findings.push(f);
        if outcome == Outcome::Success {
            outcome = Outcome::Partial;
        }
    }

    Evaluation { outcome, findings }
}

fn execution_finding(status: RunStatus) -> Option<Finding> {
    match status {
        RunStatus::Succeeded => None,
        RunStatus::Cancelled => Some(finding(
            FindingCode::ExecutionCancelled,
            "execution was cancelled before completion".to_owned(),
        )),
        _ => Some(finding(
            FindingCode::ExecutionFailed,
            "execution did not complete successfully".to_owned(),
        )),
    }
}

fn finding(code: FindingCode, message: String) -> Finding {
    Finding { code, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(status: RunStatus, tables: u64, expected: u64, mapped: u64, errors: u64) -> GradeInput {
        GradeInput {
            status,
            tables,
            expected_fields: expected,
            mapped_fields: mapped,
            validation_errors: errors,
        }
    }

    fn codes(e: &Evaluation) -> Vec<FindingCode> {
        e.findings.iter().map(|f| f.code).collect()
    }

    #[test]
    fn failed_before_any_table_is_unknown() {
        let e = grade(input(RunStatus::Failed, 0, 3, 0, 0));
        assert_eq!(e.outcome, Outcome::Unknown);
        assert_eq!(codes(&e), vec![FindingCode::ExecutionFailed]);
    }

    #[test]
    fn cancelled_before_any_table_is_unknown() {
        let e = grade(input(RunStatus::Cancelled, 0, 0, 0, 0));
        assert_eq!(e.outcome, Outcome::Unknown);
        assert_eq!(codes(&e), vec![FindingCode::ExecutionCancelled]);
    }

    #[test]
    fn success_without_tables_is_failure() {
        let e = grade(input(RunStatus::Succeeded, 0, 0, 0, 0));
        assert_eq!(e.outcome, Outcome::Failure);
        assert_eq!(codes(&e), vec![FindingCode::NoTablesDetected]);
    }

    #[test]
    fn nothing_mapped_is_failure() {
        let e = grade(input(RunStatus::Succeeded, 2, 4, 0, 0));
        assert_eq!(e.outcome, Outcome::Failure);
        assert_eq!(codes(&e), vec![FindingCode::NoFieldsMapped]);
    }

    #[test]
    fn partially_mapped_is_partial() {
        let e = grade(input(RunStatus::Succeeded, 1, 4, 3, 0));
        assert_eq!(e.outcome, Outcome::Partial);
        assert_eq!(codes(&e), vec![FindingCode::FieldsUnmapped]);
    }

    #[test]
    fn clean_run_is_success() {
        let e = grade(input(RunStatus::Succeeded, 1, 1, 1, 0));
        assert_eq!(e.outcome, Outcome::Success);
        assert!(e.findings.is_empty());
    }

    #[test]
    fn validation_errors_downgrade_success() {
        let e = grade(input(RunStatus::Succeeded, 1, 1, 1, 2));
        assert_eq!(e.outcome, Outcome::Partial);
        assert_eq!(codes(&e), vec![FindingCode::ValidationErrors]);
    }

    #[test]
    fn failed_run_with_tables_reflects_progress() {
        let e = grade(input(RunStatus::Failed, 1, 1, 1, 0));
        assert_eq!(e.outcome, Outcome::Partial);
        assert_eq!(codes(&e), vec![FindingCode::ExecutionFailed]);
    }
}
