//! Pure, dependency-light parsers over the project's planning documents:
//! the phase roadmap, milestone/progress tables, per-phase verification and
//! UAT gap indicators, and the `--phases` CLI range grammar. None of these
//! functions touch the filesystem; callers read the files and hand the
//! contents here so the parsers stay deterministic and easy to snapshot-test.

use crate::errors::RoadmapError;
use regex::Regex;

/// One phase entry extracted from a roadmap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoadmapPhase {
    pub number: String,
    pub name: String,
    pub completed: bool,
}

/// Extracts ordered phase entries from lines of the form
/// `- [x] **Phase <number>: <name>**` (space instead of `x` means pending).
/// Returns `RoadmapError::NoPhasesFound` if the document contains none.
pub fn parse_phases(text: &str) -> Result<Vec<RoadmapPhase>, RoadmapError> {
    let re = Regex::new(r"(?m)^- \[([ x])\] \*\*Phase ([0-9]+(?:\.[0-9]+)?): (.+?)\*\*\s*$")
        .expect("static regex is valid");
    let phases: Vec<RoadmapPhase> = re
        .captures_iter(text)
        .map(|cap| RoadmapPhase {
            completed: &cap[1] == "x",
            number: cap[2].to_string(),
            name: cap[3].to_string(),
        })
        .collect();
    if phases.is_empty() {
        return Err(RoadmapError::NoPhasesFound);
    }
    Ok(phases)
}

/// Counters fed to the dashboard's read-only milestone view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MilestoneCounts {
    pub phases: usize,
    pub phases_completed: usize,
    pub plans: usize,
}

/// Derives phase counters from the same roadmap document `parse_phases`
/// reads, and counts `- [x|_] **Plan N: ...**` entries the same way for the
/// plans counter.
pub fn parse_milestones(text: &str) -> MilestoneCounts {
    let phases = parse_phases(text).unwrap_or_default();
    let plan_re = Regex::new(r"(?m)^- \[([ x])\] \*\*Plan [0-9]+(?:\.[0-9]+)?: .+?\*\*\s*$")
        .expect("static regex is valid");
    MilestoneCounts {
        phases: phases.len(),
        phases_completed: phases.iter().filter(|p| p.completed).count(),
        plans: plan_re.captures_iter(text).count(),
    }
}

/// Gap predicate for the verify-step's gap-detection loop (§4.1c):
/// - verification contains `gaps_found`/`GAPS_FOUND` -> gaps.
/// - verification contains `passed`/`PASSED` -> no gaps.
/// - otherwise (verification absent, or present but inconclusive), a UAT
///   document containing `FAIL` or `Issue Found` indicates gaps; its
///   absence (or the absence of both documents) means no gaps.
pub fn check_for_gaps(verification: Option<&str>, uat: Option<&str>) -> bool {
    if let Some(v) = verification {
        if v.contains("gaps_found") || v.contains("GAPS_FOUND") {
            return true;
        }
        if v.contains("passed") || v.contains("PASSED") {
            return false;
        }
    }
    match uat {
        Some(u) => u.contains("FAIL") || u.contains("Issue Found"),
        None => false,
    }
}

/// Zero-pads the integer part of a phase number to width 2, preserving any
/// decimal suffix, and builds the on-disk verification/UAT file stem the
/// gap loop reads: `<NN>-VERIFICATION.md` / `<NN>-UAT.md`.
pub fn verification_file_name(phase_number: &str) -> String {
    format!("{}-VERIFICATION.md", crate::model::pad_phase_number(phase_number))
}

pub fn uat_file_name(phase_number: &str) -> String {
    format!("{}-UAT.md", crate::model::pad_phase_number(phase_number))
}

/// Parses the `--phases` / `GSD_AUTOPILOT_PHASES` range grammar:
/// `N | N-M | N,M,... | mix`. Decimals are permitted for single numbers
/// (`"3.1"`) but not as range bounds. Result is deduplicated and sorted by
/// numeric value.
pub fn parse_range(spec: &str) -> Result<Vec<String>, RoadmapError> {
    if spec.trim().is_empty() {
        return Err(RoadmapError::InvalidRange(spec.to_string()));
    }

    let mut out: Vec<String> = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(RoadmapError::InvalidRange(spec.to_string()));
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo
                .trim()
                .parse()
                .map_err(|_| RoadmapError::InvalidRange(spec.to_string()))?;
            let hi: u32 = hi
                .trim()
                .parse()
                .map_err(|_| RoadmapError::InvalidRange(spec.to_string()))?;
            if hi < lo {
                return Err(RoadmapError::InvalidRange(spec.to_string()));
            }
            for n in lo..=hi {
                out.push(n.to_string());
            }
        } else {
            if !is_valid_phase_number(part) {
                return Err(RoadmapError::InvalidRange(spec.to_string()));
            }
            out.push(part.to_string());
        }
    }

    out.sort_by(|a, b| {
        numeric_value(a)
            .partial_cmp(&numeric_value(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    out.dedup();
    Ok(out)
}

fn is_valid_phase_number(s: &str) -> bool {
    let re = Regex::new(r"^[0-9]+(\.[0-9]+)?$").expect("static regex is valid");
    re.is_match(s)
}

fn numeric_value(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

/// Lowercases and hyphenates a phase name for use in an on-disk directory
/// name: runs of non-alphanumeric characters collapse to a single `-`, and
/// leading/trailing hyphens are trimmed.
pub fn slugify(name: &str) -> String {
    let mut out = String::new();
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
            pending_dash = false;
        } else {
            pending_dash = true;
        }
    }
    out
}

/// The on-disk folder name for a phase's planning documents:
/// `<NN>-<slugified-name>`.
pub fn phase_dir_name(phase_number: &str, phase_name: &str) -> String {
    format!("{}-{}", crate::model::pad_phase_number(phase_number), slugify(phase_name))
}

/// Deterministic canned-context document name written in place of a real
/// discuss step when discuss is skipped.
pub fn context_file_name(phase_number: &str) -> String {
    format!("{}-CONTEXT.md", crate::model::pad_phase_number(phase_number))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROADMAP: &str = "\
# Roadmap

- [x] **Phase 1: Project setup**
- [x] **Phase 2: Core models**
- [ ] **Phase 3: HTTP API**
- [ ] **Phase 3.1: HTTP API hardening**
";

    #[test]
    fn parses_ordered_phases_with_completion_flags() {
        let phases = parse_phases(ROADMAP).unwrap();
        assert_eq!(phases.len(), 4);
        assert_eq!(phases[0].number, "1");
        assert!(phases[0].completed);
        assert_eq!(phases[2].number, "3");
        assert!(!phases[2].completed);
        assert_eq!(phases[3].number, "3.1");
        assert_eq!(phases[3].name, "HTTP API hardening");
    }

    #[test]
    fn no_phases_found_is_an_error() {
        let err = parse_phases("nothing to see here").unwrap_err();
        assert!(matches!(err, RoadmapError::NoPhasesFound));
    }

    #[test]
    fn milestone_counts_derive_from_phase_and_plan_entries() {
        let text = format!(
            "{ROADMAP}\n- [x] **Plan 1: Bootstrap**\n- [ ] **Plan 2: API**\n"
        );
        let counts = parse_milestones(&text);
        assert_eq!(counts.phases, 4);
        assert_eq!(counts.phases_completed, 2);
        assert_eq!(counts.plans, 2);
    }

    #[test]
    fn gap_predicate_verification_gaps_found_wins() {
        assert!(check_for_gaps(Some("status: gaps_found"), None));
        assert!(check_for_gaps(Some("STATUS: GAPS_FOUND"), Some("PASSED UAT")));
    }

    #[test]
    fn gap_predicate_verification_passed_short_circuits() {
        assert!(!check_for_gaps(Some("result: passed"), Some("FAIL")));
    }

    #[test]
    fn gap_predicate_falls_through_to_uat_when_verification_absent() {
        assert!(check_for_gaps(None, Some("UAT: FAIL (login broken)")));
        assert!(check_for_gaps(None, Some("Issue Found in checkout")));
        assert!(!check_for_gaps(None, Some("all good")));
    }

    #[test]
    fn gap_predicate_false_when_neither_document_exists() {
        assert!(!check_for_gaps(None, None));
    }

    #[test]
    fn verification_and_uat_file_names_zero_pad() {
        assert_eq!(verification_file_name("3"), "03-VERIFICATION.md");
        assert_eq!(uat_file_name("3.1"), "03.1-UAT.md");
    }

    #[test]
    fn parse_range_single_number() {
        assert_eq!(parse_range("3").unwrap(), vec!["3"]);
    }

    #[test]
    fn parse_range_allows_decimal_single_number() {
        assert_eq!(parse_range("3.1").unwrap(), vec!["3.1"]);
    }

    #[test]
    fn parse_range_expands_hyphen_range() {
        assert_eq!(parse_range("2-5").unwrap(), vec!["2", "3", "4", "5"]);
    }

    #[test]
    fn parse_range_mix_dedupes_and_sorts() {
        assert_eq!(
            parse_range("1-3,5,7-9").unwrap(),
            vec!["1", "2", "3", "5", "7", "8", "9"]
        );
        assert_eq!(parse_range("5,1,5,3").unwrap(), vec!["1", "3", "5"]);
    }

    #[test]
    fn parse_range_rejects_invalid_inputs() {
        assert!(parse_range("abc").is_err());
        assert!(parse_range("").is_err());
        assert!(parse_range("5-3").is_err());
        assert!(parse_range("1-2-3").is_err());
    }
}
