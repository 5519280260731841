//! Strategy library admission gate
//!
//! A pure decision procedure: given a parsed upgrade candidate, the
//! current catalogue snapshot and the per-task admission counts, decide
//! whether to admit a new entry, enhance an existing one, or skip.
//! Admission requires a complete justification (coverage gap, reuse
//! failure, new value) and at least two references to existing
//! entries. At most one new entry per category per task; a qualifying
//! candidate over quota is routed to enhance its closest reference.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::library::{StrategyCatalog, StrategyDraft, StrategyId};

static DECISION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^DECISION:\s*(APPLY|SKIP)\s*$").expect("decision regex"));
static ACTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^ACTION:\s*(create_new|enhance_existing)\s*$").expect("action regex")
});
static CATEGORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^CATEGORY:\s*([A-Z])\s*$").expect("category regex"));
static TARGET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^TARGET_ID:\s*([A-Z]-\d+)\s*$").expect("target regex"));
static REFS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^REFERENCE_IDS:\s*(.+)$").expect("refs regex"));
static JUSTIFICATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(coverage_gap|reuse_failure|new_value):\s*(.+)$").expect("justification regex")
});
static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^####\s+(.+?)(?:\s*\([A-Z]-\d+\))?\s*$").expect("title regex"));

/// Gate thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePolicy {
    /// New entries allowed per category within one task.
    pub max_new_per_category: usize,
    /// Existing entries a candidate must cite to prove it checked.
    pub min_reference_ids: usize,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            max_new_per_category: 1,
            min_reference_ids: 2,
        }
    }
}

/// The three admission criteria; all must be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Justification {
    pub coverage_gap: Option<String>,
    pub reuse_failure: Option<String>,
    pub new_value: Option<String>,
}

impl Justification {
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.coverage_gap.is_none() {
            missing.push("coverage_gap");
        }
        if self.reuse_failure.is_none() {
            missing.push("reuse_failure");
        }
        if self.new_value.is_none() {
            missing.push("new_value");
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }
}

/// Requested mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    CreateNew,
    EnhanceExisting,
}

/// A parsed upgrade candidate (DECISION: APPLY).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeCandidate {
    pub action: GateAction,
    pub draft: StrategyDraft,
    /// Present for enhance_existing.
    pub target_id: Option<StrategyId>,
    pub reference_ids: Vec<StrategyId>,
    pub justification: Justification,
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GateDecision {
    /// Append as a new entry; the library allocates the id.
    Admit { draft: StrategyDraft },
    /// Fold into an existing entry instead.
    Enhance { target: StrategyId, note: String },
    /// Do nothing; the reason is recorded in the upgrade section.
    Skip { reason: String },
}

impl GateDecision {
    pub fn as_str(&self) -> &str {
        match self {
            GateDecision::Admit { .. } => "admit",
            GateDecision::Enhance { .. } => "enhance",
            GateDecision::Skip { .. } => "skip",
        }
    }
}

/// Evaluate one candidate against the catalogue.
///
/// `session_new_counts` tracks admissions already made during this
/// task, keyed by category. The function never mutates anything; the
/// caller applies the decision through the library and bumps the count
/// on `Admit`.
pub fn evaluate(
    candidate: &UpgradeCandidate,
    catalog: &StrategyCatalog,
    session_new_counts: &HashMap<char, usize>,
    policy: &GatePolicy,
) -> GateDecision {
    let missing = candidate.justification.missing();
    if !missing.is_empty() {
        return GateDecision::Skip {
            reason: format!("missing justification: {}", missing.join(", ")),
        };
    }
    if candidate.reference_ids.len() < policy.min_reference_ids {
        return GateDecision::Skip {
            reason: format!(
                "insufficient reference ids to prove novelty ({} given, {} required)",
                candidate.reference_ids.len(),
                policy.min_reference_ids
            ),
        };
    }

    match candidate.action {
        GateAction::EnhanceExisting => {
            let Some(target) = candidate.target_id else {
                return GateDecision::Skip {
                    reason: "enhance_existing without a target id".to_string(),
                };
            };
            if !catalog.contains(&target) {
                return GateDecision::Skip {
                    reason: format!("enhancement target {} not found", target),
                };
            }
            GateDecision::Enhance {
                target,
                note: enhancement_note(candidate),
            }
        }
        GateAction::CreateNew => {
            let category = candidate.draft.category;
            if catalog.has_title(category, &candidate.draft.title) {
                // Re-admitting an admitted strategy: the coverage gap
                // it claimed no longer exists.
                return GateDecision::Skip {
                    reason: format!(
                        "'{}' already covered in category {}",
                        candidate.draft.title, category
                    ),
                };
            }
            let used = session_new_counts.get(&category).copied().unwrap_or(0);
            if used >= policy.max_new_per_category {
                return match catalog.first_existing(&candidate.reference_ids) {
                    Some(target) => GateDecision::Enhance {
                        target,
                        note: enhancement_note(candidate),
                    },
                    None => GateDecision::Skip {
                        reason: format!("category {} reached its new-strategy quota", category),
                    },
                };
            }
            GateDecision::Admit {
                draft: candidate.draft.clone(),
            }
        }
    }
}

fn enhancement_note(candidate: &UpgradeCandidate) -> String {
    let value = candidate
        .justification
        .new_value
        .as_deref()
        .unwrap_or(&candidate.draft.title);
    format!("{}: {}", candidate.draft.title, value)
}

/// Parse an upgrade-stage output into a candidate.
///
/// Returns `None` when the output declines (`DECISION: SKIP`) or lacks
/// the decision metadata entirely; both mean the gate has nothing to
/// evaluate.
pub fn parse_candidate(text: &str) -> Option<UpgradeCandidate> {
    let decision = DECISION_RE.captures(text)?;
    if &decision[1] != "APPLY" {
        return None;
    }
    let action = match ACTION_RE.captures(text).map(|c| c[1].to_string()) {
        Some(a) if a == "create_new" => GateAction::CreateNew,
        Some(_) => GateAction::EnhanceExisting,
        None => return None,
    };
    let category = CATEGORY_RE
        .captures(text)
        .and_then(|c| c[1].chars().next())
        .unwrap_or('A');
    let target_id = TARGET_RE
        .captures(text)
        .and_then(|c| c[1].parse::<StrategyId>().ok());
    let reference_ids = REFS_RE
        .captures(text)
        .map(|c| {
            c[1].split(',')
                .filter_map(|part| part.trim().parse::<StrategyId>().ok())
                .collect()
        })
        .unwrap_or_default();

    let mut justification = Justification::default();
    for caps in JUSTIFICATION_RE.captures_iter(text) {
        let value = Some(caps[2].trim().to_string());
        match &caps[1] {
            "coverage_gap" => justification.coverage_gap = value,
            "reuse_failure" => justification.reuse_failure = value,
            _ => justification.new_value = value,
        }
    }

    let title = TITLE_RE
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_else(|| "Untitled strategy".to_string());
    let body = parse_draft_body(text, category, title);

    Some(UpgradeCandidate {
        action,
        draft: body,
        target_id,
        reference_ids,
        justification,
    })
}

fn parse_draft_body(text: &str, category: char, title: String) -> StrategyDraft {
    let mut applicability = String::new();
    let mut steps = Vec::new();
    let mut examples = Vec::new();
    let mut list: Option<bool> = None; // true = steps, false = examples

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Applicability:") {
            applicability = rest.trim().to_string();
            list = None;
        } else if trimmed == "Steps:" {
            list = Some(true);
        } else if trimmed == "Examples:" {
            list = Some(false);
        } else if let Some(item) = trimmed.strip_prefix("- ") {
            match list {
                Some(true) => steps.push(item.trim().to_string()),
                Some(false) => examples.push(item.trim().to_string()),
                None => {}
            }
        } else if trimmed.ends_with(':') || trimmed.starts_with("####") {
            // A new field or heading ends any open list.
            if !matches!(trimmed, "Steps:" | "Examples:") {
                list = None;
            }
        }
    }

    StrategyDraft {
        category,
        title,
        applicability,
        steps,
        examples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::StrategyEntry;

    const APPLY_TEXT: &str = "DECISION: APPLY\nACTION: create_new\nCATEGORY: A\nREFERENCE_IDS: A-01, A-02\ncoverage_gap: no strategy covers paywalled sources\nreuse_failure: A-01 stalled on a login page\nnew_value: adds an archive-first fallback\n\n#### Archive-first retrieval\nApplicability: when the primary source is paywalled\nSteps:\n- query a web archive first\n- fall back to the live page\nExamples:\n- newspaper archive lookup\n";

    fn catalog_with(entries: &[(char, u32, &str)]) -> StrategyCatalog {
        let mut catalog = StrategyCatalog::new();
        catalog.ensure_category('A', "Research");
        for (category, number, title) in entries {
            catalog.entries.push(StrategyEntry {
                id: StrategyId::new(*category, *number),
                title: (*title).to_string(),
                applicability: String::new(),
                steps: Vec::new(),
                examples: Vec::new(),
                enhancements: Vec::new(),
            });
        }
        catalog
    }

    fn base_catalog() -> StrategyCatalog {
        catalog_with(&[('A', 1, "Broad search"), ('A', 2, "Cross-check sources")])
    }

    #[test]
    fn test_parse_candidate_full_metadata() {
        let candidate = parse_candidate(APPLY_TEXT).unwrap();
        assert_eq!(candidate.action, GateAction::CreateNew);
        assert_eq!(candidate.draft.category, 'A');
        assert_eq!(candidate.draft.title, "Archive-first retrieval");
        assert_eq!(candidate.reference_ids.len(), 2);
        assert!(candidate.justification.is_complete());
        assert_eq!(candidate.draft.steps.len(), 2);
        assert_eq!(candidate.draft.examples.len(), 1);
    }

    #[test]
    fn test_parse_candidate_skip_returns_none() {
        assert!(parse_candidate("DECISION: SKIP\nreason: nothing new").is_none());
        assert!(parse_candidate("no metadata at all").is_none());
    }

    #[test]
    fn test_admit_when_all_criteria_hold() {
        let candidate = parse_candidate(APPLY_TEXT).unwrap();
        let decision = evaluate(
            &candidate,
            &base_catalog(),
            &HashMap::new(),
            &GatePolicy::default(),
        );
        assert!(matches!(decision, GateDecision::Admit { .. }));
    }

    #[test]
    fn test_skip_on_incomplete_justification() {
        let mut candidate = parse_candidate(APPLY_TEXT).unwrap();
        candidate.justification.reuse_failure = None;
        let decision = evaluate(
            &candidate,
            &base_catalog(),
            &HashMap::new(),
            &GatePolicy::default(),
        );
        let GateDecision::Skip { reason } = decision else {
            panic!("expected skip");
        };
        assert!(reason.contains("reuse_failure"));
    }

    #[test]
    fn test_skip_on_too_few_references() {
        let mut candidate = parse_candidate(APPLY_TEXT).unwrap();
        candidate.reference_ids.truncate(1);
        let decision = evaluate(
            &candidate,
            &base_catalog(),
            &HashMap::new(),
            &GatePolicy::default(),
        );
        let GateDecision::Skip { reason } = decision else {
            panic!("expected skip");
        };
        assert!(reason.contains("reference ids"));
    }

    #[test]
    fn test_readmission_is_skipped() {
        // Once admitted, the same candidate no longer names a coverage gap.
        let candidate = parse_candidate(APPLY_TEXT).unwrap();
        let catalog = catalog_with(&[
            ('A', 1, "Broad search"),
            ('A', 2, "Cross-check sources"),
            ('A', 3, "Archive-first retrieval"),
        ]);
        let decision = evaluate(&candidate, &catalog, &HashMap::new(), &GatePolicy::default());
        assert!(matches!(decision, GateDecision::Skip { .. }));
    }

    #[test]
    fn test_quota_routes_to_enhance_existing() {
        let candidate = parse_candidate(APPLY_TEXT).unwrap();
        let mut counts = HashMap::new();
        counts.insert('A', 1);
        let decision = evaluate(&candidate, &base_catalog(), &counts, &GatePolicy::default());
        let GateDecision::Enhance { target, .. } = decision else {
            panic!("expected enhance");
        };
        assert_eq!(target, StrategyId::new('A', 1));
    }

    #[test]
    fn test_quota_without_existing_reference_skips() {
        let mut candidate = parse_candidate(APPLY_TEXT).unwrap();
        candidate.reference_ids = vec![StrategyId::new('C', 8), StrategyId::new('C', 9)];
        let mut counts = HashMap::new();
        counts.insert('A', 1);
        let decision = evaluate(&candidate, &base_catalog(), &counts, &GatePolicy::default());
        let GateDecision::Skip { reason } = decision else {
            panic!("expected skip");
        };
        assert!(reason.contains("quota"));
    }

    #[test]
    fn test_enhance_requires_existing_target() {
        let mut candidate = parse_candidate(APPLY_TEXT).unwrap();
        candidate.action = GateAction::EnhanceExisting;
        candidate.target_id = Some(StrategyId::new('A', 9));
        let decision = evaluate(
            &candidate,
            &base_catalog(),
            &HashMap::new(),
            &GatePolicy::default(),
        );
        assert!(matches!(decision, GateDecision::Skip { .. }));

        candidate.target_id = Some(StrategyId::new('A', 2));
        let decision = evaluate(
            &candidate,
            &base_catalog(),
            &HashMap::new(),
            &GatePolicy::default(),
        );
        assert!(matches!(
            decision,
            GateDecision::Enhance { target, .. } if target == StrategyId::new('A', 2)
        ));
    }
}
