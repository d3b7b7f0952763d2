use crate::project::Project;
use crate::render;
use colored::Colorize;
use stackflow_engine::RefreshReport;
use std::path::Path;

pub async fn handle(
    project: &Project,
    vars: &[String],
    out: Option<&Path>,
    refresh: bool,
) -> anyhow::Result<()> {
    let stack = project.stack(vars)?;
    let engine = project.engine(None);
    let outcome = engine.plan(&stack.resources, refresh).await?;

    if let Some(report) = &outcome.refresh {
        print_refresh_summary(report);
    }
    render::print_plan(&outcome.plan);

    if let Some(out) = out {
        outcome.plan.to_artifact().write(out).await?;
        println!();
        println!(
            "Saved plan to {}. Apply it with: stackflow apply {}",
            out.display().to_string().cyan(),
            out.display()
        );
    }
    Ok(())
}

pub(crate) fn print_refresh_summary(report: &RefreshReport) {
    if !report.has_drift() && report.errors.is_empty() {
        return;
    }
    println!("{}", "Objects changed outside of stackflow:".yellow());
    for drift in &report.drifted {
        println!(
            "  ~ {} ({})",
            drift.address.to_string().bold(),
            drift.attributes.join(", ")
        );
    }
    for address in &report.vanished {
        println!("  - {} (no longer exists)", address.to_string().bold());
    }
    for (address, error) in &report.errors {
        println!("  {} {}: {}", "!".red(), address, error);
    }
    println!();
}
