//! Text and JSON views of a finished run

use pilot_core::{Inventory, PipelineController, ProjectSnapshot, RunReport};
use serde_json::{json, Value};
use std::fmt::Write;

pub(crate) fn text_report(controller: &PipelineController, report: &RunReport) -> String {
    let mut out = String::new();
    let elapsed = report.finished_at - report.started_at;
    let _ = writeln!(
        out,
        "Migration run: {}/{} targets completed in {}ms",
        report.completed().len(),
        report.outcomes.len(),
        elapsed.num_milliseconds()
    );

    for outcome in &report.outcomes {
        let _ = writeln!(
            out,
            "\n  {} [{}] steps {}/{}, reflection attempts {}",
            outcome.library,
            outcome.phase.as_str(),
            outcome.steps_completed,
            outcome.steps_total,
            outcome.attempts
        );
        for step in controller.steps(outcome.target_id) {
            let rules: Vec<&str> = step.supporting_rules.iter().map(|r| r.as_str()).collect();
            let _ = writeln!(
                out,
                "    {}. {} ({:?}) [{}]",
                step.ordinal,
                step.description,
                step.status,
                rules.join(", ")
            );
        }
        for check in controller.checks(outcome.target_id, None) {
            let _ = writeln!(
                out,
                "      check {} run {}: {:?}{}",
                check.name,
                check.run,
                check.status,
                check.error.as_deref().map(|e| format!(" ({e})")).unwrap_or_default()
            );
        }
        for attempt in controller.attempts(outcome.target_id) {
            let _ = writeln!(
                out,
                "    reflection #{} {:?}: {}",
                attempt.attempt, attempt.outcome, attempt.diagnosis
            );
        }
        if let Some(error) = &outcome.error {
            let _ = writeln!(out, "    error: {error}");
        }
    }

    if !report.up_to_date.is_empty() {
        let _ = writeln!(out, "\n  up to date: {}", report.up_to_date.join(", "));
    }
    let skipped: Vec<String> = controller
        .targets()
        .into_iter()
        .filter(|t| report.outcome(&t.library).is_none() && !report.up_to_date.contains(&t.library))
        .map(|t| t.library)
        .collect();
    if !skipped.is_empty() {
        let _ = writeln!(out, "\n  not run: {}", skipped.join(", "));
    }
    let _ = writeln!(out, "\n{} trace events recorded", report.trace_events);
    out
}

pub(crate) fn json_report(controller: &PipelineController, report: &RunReport) -> Value {
    let mut steps = Vec::new();
    let mut checks = Vec::new();
    let mut attempts = Vec::new();
    for target in controller.targets() {
        steps.extend(controller.steps(target.id));
        checks.extend(controller.checks(target.id, None));
        attempts.extend(controller.attempts(target.id));
    }

    json!({
        "report": report,
        "targets": controller.targets(),
        "steps": steps,
        "checks": checks,
        "attempts": attempts,
        "trace": controller.trace_log().events(),
    })
}

pub(crate) fn inventory(snapshot: &ProjectSnapshot, inventory: &Inventory) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} ({}): {} source files",
        snapshot.root.display(),
        snapshot.depth.label(),
        inventory.files
    );
    for (language, count) in &inventory.languages {
        let _ = writeln!(out, "  {language:?}: {count}");
    }
    for manifest in &inventory.manifests {
        let _ = writeln!(out, "  manifest {}", manifest.display());
    }
    out
}
