use super::apply::finish;
use super::cancel_on_ctrl_c;
use crate::project::Project;
use crate::render;
use colored::Colorize;
use stackflow_engine::CancelHandle;

pub async fn handle(
    project: &Project,
    vars: &[String],
    yes: bool,
    parallelism: Option<usize>,
) -> anyhow::Result<()> {
    let stack = project.stack(vars)?;
    let engine = project.engine(parallelism);

    let state = engine.load_state().await?;
    if state.is_empty() {
        println!("{}", "Nothing to destroy.".green());
        return Ok(());
    }

    println!("{}", "Resources to destroy:".red().bold());
    for record in state.records() {
        match &record.deposed {
            Some(key) => println!("  - {} (deposed {})", record.address(), key),
            None => println!("  - {}", record.address()),
        }
    }

    if !yes {
        println!();
        println!("{}", "Warning: this deletes every recorded resource.".yellow());
        println!("To destroy, run again with --yes");
        return Ok(());
    }

    println!();
    let cancel = CancelHandle::new();
    let watcher = cancel_on_ctrl_c(cancel.clone());
    let result = engine
        .destroy(&stack.resources, cancel, render::print_event)
        .await;
    watcher.abort();

    finish(result?)
}
