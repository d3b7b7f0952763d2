use crate::project::Project;
use crate::render;
use colored::Colorize;
use serde_json::Value;

pub async fn handle(
    project: &Project,
    vars: &[String],
    name: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let stack = project.stack(vars)?;
    let outputs = project.engine(None).outputs(&stack.resources).await?;

    if let Some(name) = name {
        let value = outputs
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("No output named '{}'", name))?;
        match value {
            Value::String(s) if !json => println!("{}", s),
            other => println!("{}", serde_json::to_string_pretty(other)?),
        }
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outputs)?);
    } else if outputs.is_empty() {
        println!("{}", "No outputs.".dimmed());
    } else {
        for (name, value) in &outputs {
            println!("{} = {}", name.cyan(), render::value(value));
        }
    }
    Ok(())
}
