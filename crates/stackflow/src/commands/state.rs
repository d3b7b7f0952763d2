use crate::project::Project;
use colored::Colorize;
use stackflow_engine::InstanceAddress;

pub async fn handle_list(project: &Project) -> anyhow::Result<()> {
    let state = project.engine(None).load_state().await?;
    for record in state.records() {
        match &record.deposed {
            Some(key) => println!("{} {}", record.address(), format!("(deposed {})", key).dimmed()),
            None => println!("{}", record.address()),
        }
    }
    Ok(())
}

pub async fn handle_show(project: &Project, address: &str) -> anyhow::Result<()> {
    let address = parse_address(address)?;
    let state = project.engine(None).load_state().await?;
    let record = state
        .get(&address)
        .ok_or_else(|| anyhow::anyhow!("{} is not in state", address))?;

    println!("{}", address.to_string().bold());
    if let Some(id) = record.id() {
        println!("  id: {}", id.cyan());
    }
    println!("  schema version: {}", record.schema_version);
    if !record.dependencies.is_empty() {
        let deps: Vec<String> = record.dependencies.iter().map(|d| d.to_string()).collect();
        println!("  depends on: {}", deps.join(", "));
    }
    println!("{}", serde_json::to_string_pretty(&record.attributes)?);
    Ok(())
}

pub async fn handle_rm(project: &Project, address: &str) -> anyhow::Result<()> {
    let address = parse_address(address)?;
    let record = project.engine(None).forget(&address).await?;
    println!(
        "{} Removed {} from state; the object{} was left in place.",
        "✓".green(),
        address.to_string().bold(),
        record
            .id()
            .map(|id| format!(" ({})", id))
            .unwrap_or_default()
    );
    Ok(())
}

fn parse_address(address: &str) -> anyhow::Result<InstanceAddress> {
    address
        .parse()
        .map_err(|e: String| anyhow::anyhow!("Invalid address '{}': {}", address, e))
}
