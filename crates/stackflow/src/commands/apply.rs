use super::cancel_on_ctrl_c;
use crate::project::Project;
use crate::render;
use colored::Colorize;
use stackflow_engine::{ApplyOutcome, CancelHandle, PlanArtifact};
use std::path::Path;

pub async fn handle(
    project: &Project,
    vars: &[String],
    saved_plan: Option<&Path>,
    yes: bool,
    parallelism: Option<usize>,
) -> anyhow::Result<()> {
    let stack = project.stack(vars)?;
    let engine = project.engine(parallelism);

    // A saved plan was already reviewed; otherwise show the plan first
    let artifact = match saved_plan {
        Some(path) => {
            println!("Applying saved plan {}", path.display().to_string().cyan());
            PlanArtifact::read(path).await?
        }
        None => {
            let outcome = engine.plan(&stack.resources, false).await?;
            if !render::print_plan(&outcome.plan) {
                return Ok(());
            }
            if !yes {
                println!();
                println!("To apply these changes, run again with --yes");
                return Ok(());
            }
            outcome.plan.to_artifact()
        }
    };

    println!();
    let cancel = CancelHandle::new();
    let watcher = cancel_on_ctrl_c(cancel.clone());
    let result = engine
        .apply(&stack.resources, Some(artifact), cancel, render::print_event)
        .await;
    watcher.abort();

    finish(result?)
}

/// Print the report and turn an incomplete apply into an error exit.
pub(crate) fn finish(outcome: ApplyOutcome) -> anyhow::Result<()> {
    render::print_report(&outcome.report);
    render::print_outputs(&outcome.outputs);
    if outcome.report.is_success() {
        Ok(())
    } else if let Some(ambiguity) = outcome.report.ambiguity() {
        Err(ambiguity.into())
    } else {
        let failures = outcome.report.failures().len();
        anyhow::bail!(
            "apply did not complete ({} failed step{})",
            failures,
            if failures == 1 { "" } else { "s" }
        )
    }
}
