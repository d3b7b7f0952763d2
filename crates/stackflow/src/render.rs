//! Terminal rendering of plans and apply reports

use colored::{ColoredString, Colorize};
use serde_json::Value;
use stackflow_engine::{
    Action, ApplyReport, DiffEntry, Outcome, Plan, PlannedValue, ReplaceOrder, StepEvent,
};
use std::collections::BTreeMap;

fn action_label(action: Action) -> ColoredString {
    let text = format!("{:>3}", action.symbol());
    match action {
        Action::Create => text.green(),
        Action::Update => text.yellow(),
        Action::Replace => text.magenta(),
        Action::Delete => text.red(),
        Action::NoOp => text.normal(),
    }
}

pub fn value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{:?}", s),
        other => other.to_string(),
    }
}

fn planned(value: &PlannedValue) -> String {
    match value {
        PlannedValue::Known(v) => self::value(v),
        PlannedValue::Unknown => "(known after apply)".dimmed().to_string(),
    }
}

/// One entry with its attribute changes
pub fn print_entry(entry: &DiffEntry) {
    let mut header = format!("{} {}", action_label(entry.action), entry.address.to_string().bold());
    if let Some(deposed) = &entry.deposed {
        header.push_str(&format!(" (deposed {})", deposed).dimmed().to_string());
    }
    match (entry.action, entry.replace_order) {
        (Action::Replace, Some(ReplaceOrder::CreateBeforeDestroy)) => {
            header.push_str(&" (create before destroy)".dimmed().to_string());
        }
        (Action::Replace, _) => {
            header.push_str(&" (destroy before create)".dimmed().to_string());
        }
        _ => {}
    }
    println!("{}", header);

    let empty_before = BTreeMap::new();
    let before = entry.before.as_ref().unwrap_or(&empty_before);
    match entry.action {
        Action::Create => {
            if let Some(after) = &entry.after {
                for (key, v) in after {
                    println!("      {} = {}", key, planned(v));
                }
            }
        }
        Action::Update | Action::Replace => {
            let Some(after) = &entry.after else {
                return;
            };
            for key in entry.changed_attributes() {
                let old = before.get(key).map(self::value).unwrap_or_else(|| "null".to_string());
                let new = after.get(key).map(planned).unwrap_or_else(|| "null".to_string());
                let marker = if entry.replace_reasons.iter().any(|r| r == key) {
                    " # forces replacement".red().to_string()
                } else {
                    String::new()
                };
                println!("      {} = {} -> {}{}", key, old, new, marker);
            }
        }
        Action::Delete | Action::NoOp => {}
    }
}

/// Changed entries and the summary line. Returns whether anything changes.
pub fn print_plan(plan: &Plan) -> bool {
    if !plan.has_changes {
        println!("{}", "No changes. Infrastructure matches the configuration.".green());
        return false;
    }

    println!("Planned changes:");
    println!();
    for entry in plan.entries.iter().filter(|e| e.is_change()) {
        print_entry(entry);
    }
    println!();
    println!("{} {}", "Plan:".bold(), plan.summary());
    true
}

/// Progress callback used while applying
pub fn print_event(event: StepEvent<'_>) {
    match event {
        StepEvent::Started(step) => {
            println!("  {} {}", "→".blue(), step);
        }
        StepEvent::Finished(step, outcome) => match outcome {
            Outcome::Success => println!("  {} {}", "✓".green(), step),
            Outcome::Failed(e) => println!("  {} {}: {}", "✗".red(), step, e),
            Outcome::Skipped { upstream } => {
                println!("  {} {} (skipped, {} did not succeed)", "-".yellow(), step, upstream)
            }
            Outcome::Cancelled => println!("  {} {} (cancelled)", "-".yellow(), step),
        },
    }
}

/// Final apply summary; every failure is listed, not only the first.
pub fn print_report(report: &ApplyReport) {
    println!();
    let succeeded = report.count(|o| o.is_success());
    let failed = report.count(|o| matches!(o, Outcome::Failed(_)));
    let skipped = report.count(|o| matches!(o, Outcome::Skipped { .. }));
    let cancelled = report.count(|o| matches!(o, Outcome::Cancelled));

    let line = format!(
        "{} succeeded, {} failed, {} skipped, {} cancelled in {:.1}s",
        succeeded,
        failed,
        skipped,
        cancelled,
        report.duration.as_secs_f64()
    );
    if report.is_success() {
        println!("{} {}", "Apply complete:".green().bold(), line);
    } else {
        println!("{} {}", "Apply incomplete:".red().bold(), line);
    }

    let failures = report.failures();
    if !failures.is_empty() {
        println!();
        println!("{}", "Errors:".red().bold());
        for (step, error) in failures {
            println!("  • {}: {}", step, error);
        }
    }

    let ambiguous = report.ambiguous();
    if !ambiguous.is_empty() {
        println!();
        println!(
            "{}",
            "The real-world result of these operations is unknown. Inspect them and run `stackflow refresh`:"
                .yellow()
        );
        for (step, _) in ambiguous {
            println!("  • {}", step);
        }
    }

    if report.cancelled {
        println!();
        println!("{}", "Apply was cancelled; completed results were saved.".yellow());
    }

    if let Some(e) = &report.commit_error {
        println!();
        println!("{} {}", "Failed to save state:".red().bold(), e);
    }
}

pub fn print_outputs(outputs: &BTreeMap<String, Value>) {
    if outputs.is_empty() {
        return;
    }
    println!();
    println!("{}", "Outputs:".bold());
    for (name, v) in outputs {
        println!("  {} = {}", name.cyan(), value(v));
    }
}
