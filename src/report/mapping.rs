//! # Column mapping outcomes.
//!
//! [`MappingDecision`] is a closed sum type: every physical column ends up in
//! exactly one of four variants, and each variant carries only the fields that
//! make sense for it. Reason codes are per-variant enums, so a `mapped` decision
//! cannot carry a reason and the others cannot omit one.
//!
//! ## Classification rules
//! ```text
//! passthrough flag            → Passthrough(explicit_policy)
//! engine chose a field        → Mapped{field, score, method}
//! no header text              → Unmapped(empty_header)
//! no candidates               → Unmapped(no_candidates)
//! best score < threshold      → Unmapped(below_threshold)
//! top two within margin       → Ambiguous(tied_candidates)
//! clear winner not chosen     → Unmapped(field_claimed)
//! ```
//! Candidates are sorted by descending score (ties by field name) and capped at
//! [`MappingConfig::max_candidates`].

use serde::{Deserialize, Serialize};

use crate::config::MappingConfig;

use super::facts::ColumnFacts;

/// A scored candidate field for a column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Candidate {
    pub field: String,
    pub score: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguousReason {
    TiedCandidates,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedReason {
    EmptyHeader,
    NoCandidates,
    BelowThreshold,
    FieldClaimed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassthroughReason {
    ExplicitPolicy,
}

/// Outcome of mapping one physical column to a canonical field.
///
/// Adding a variant is a schema change and needs a version bump of every
/// payload that embeds it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case", deny_unknown_fields)]
pub enum MappingDecision {
    Mapped {
        field: String,
        score: f64,
        method: String,
    },
    Ambiguous {
        candidates: Vec<Candidate>,
        reason: AmbiguousReason,
    },
    Unmapped {
        reason: UnmappedReason,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        candidates: Vec<Candidate>,
    },
    Passthrough {
        reason: PassthroughReason,
    },
}

impl MappingDecision {
    /// Stable status label.
    pub fn status(&self) -> &'static str {
        match self {
            MappingDecision::Mapped { .. } => "mapped",
            MappingDecision::Ambiguous { .. } => "ambiguous",
            MappingDecision::Unmapped { .. } => "unmapped",
            MappingDecision::Passthrough { .. } => "passthrough",
        }
    }

    /// Reason code; `None` only for `mapped`.
    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            MappingDecision::Mapped { .. } => None,
            MappingDecision::Ambiguous { reason, .. } => Some(match reason {
                AmbiguousReason::TiedCandidates => "tied_candidates",
            }),
            MappingDecision::Unmapped { reason, .. } => Some(match reason {
                UnmappedReason::EmptyHeader => "empty_header",
                UnmappedReason::NoCandidates => "no_candidates",
                UnmappedReason::BelowThreshold => "below_threshold",
                UnmappedReason::FieldClaimed => "field_claimed",
            }),
            MappingDecision::Passthrough { reason } => Some(match reason {
                PassthroughReason::ExplicitPolicy => "explicit_policy",
            }),
        }
    }

    /// The chosen field, if mapped.
    pub fn mapped_field(&self) -> Option<(&str, f64)> {
        match self {
            MappingDecision::Mapped { field, score, .. } => Some((field.as_str(), *score)),
            _ => None,
        }
    }
}

/// Classifies one column. Total: every input yields exactly one decision.
pub fn classify(column: &ColumnFacts, cfg: &MappingConfig) -> MappingDecision {
    if column.passthrough {
        return MappingDecision::Passthrough {
            reason: PassthroughReason::ExplicitPolicy,
        };
    }

    let candidates = ranked(&column.candidates, cfg.max_candidates);

    if let Some(field) = column.chosen.as_deref().filter(|f| !f.trim().is_empty()) {
        let score = column
            .score
            .or_else(|| {
                column
                    .candidates
                    .iter()
                    .filter(|c| c.field == field)
                    .map(|c| c.score)
                    .reduce(f64::max)
            })
            .map(sanitize)
            .unwrap_or(0.0);
        return MappingDecision::Mapped {
            field: field.to_owned(),
            score,
            method: column.method.clone().unwrap_or_else(|| "score".to_owned()),
        };
    }

    let header_empty = column
        .header_raw
        .as_deref()
        .map(str::trim)
        .is_none_or(str::is_empty);
    if header_empty && candidates.is_empty() {
        return MappingDecision::Unmapped {
            reason: UnmappedReason::EmptyHeader,
            candidates,
        };
    }

    let Some(best) = candidates.first() else {
        return MappingDecision::Unmapped {
            reason: UnmappedReason::NoCandidates,
            candidates,
        };
    };

    if best.score < cfg.threshold {
        return MappingDecision::Unmapped {
            reason: UnmappedReason::BelowThreshold,
            candidates,
        };
    }

    let tied = candidates
        .get(1)
        .is_some_and(|second| best.score - second.score <= cfg.ambiguity_margin);
    if tied {
        return MappingDecision::Ambiguous {
            candidates,
            reason: AmbiguousReason::TiedCandidates,
        };
    }

    MappingDecision::Unmapped {
        reason: UnmappedReason::FieldClaimed,
        candidates,
    }
}

/// Sorts by descending score (ties by field name) and caps the list.
fn ranked(candidates: &[Candidate], cap: usize) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = candidates
        .iter()
        .filter(|c| !c.field.trim().is_empty())
        .map(|c| Candidate {
            field: c.field.clone(),
            score: sanitize(c.score),
        })
        .collect();
    out.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.field.cmp(&b.field))
    });
    out.truncate(cap.max(1));
    out
}

/// Non-finite scores cannot be serialized; clamp into `[0, 1]`.
fn sanitize(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
