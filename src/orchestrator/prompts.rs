//! Deterministic prompt text handed to the agent subprocess for each step.
//! The agent's own prompt format is an external contract the orchestrator
//! does not control; these builders only need to name the phase, step, and
//! any gap-loop modifier clearly enough for the agent (and a human skimming
//! the event log) to follow along.

use std::path::Path;

pub fn project_init(prd_path: Option<&Path>) -> String {
    match prd_path {
        Some(path) => format!(
            "Initialize this project from the PRD at {}. Produce ROADMAP.md with one \
             `- [ ] **Phase N: Name**` line per phase, plus any per-phase planning documents.",
            path.display()
        ),
        None => "Initialize this project. Produce ROADMAP.md with one \
                  `- [ ] **Phase N: Name**` line per phase, plus any per-phase planning documents."
            .to_string(),
    }
}

pub fn discuss(number: &str, name: &str) -> String {
    format!("Discuss phase {number} ({name}): clarify scope and open questions before planning.")
}

pub fn plan(number: &str, name: &str, modifier: Option<&str>) -> String {
    match modifier {
        Some(m) => format!(
            "Plan phase {number} ({name}) [{m}]: produce or update the phase's plan documents."
        ),
        None => format!("Plan phase {number} ({name}): produce the phase's plan documents."),
    }
}

pub fn execute(number: &str, name: &str, modifier: Option<&str>) -> String {
    match modifier {
        Some(m) => format!("Execute phase {number} ({name}) [{m}]: implement per the plan documents."),
        None => format!("Execute phase {number} ({name}): implement per the plan documents."),
    }
}

pub fn verify(number: &str, name: &str) -> String {
    format!(
        "Verify phase {number} ({name}): run the verification suite and write \
         <NN>-VERIFICATION.md (and <NN>-UAT.md if applicable)."
    )
}
