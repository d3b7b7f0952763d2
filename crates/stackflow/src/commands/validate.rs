use crate::project::Project;
use colored::Colorize;

pub async fn handle(project: &Project, vars: &[String]) -> anyhow::Result<()> {
    println!("{}", "Validating configuration...".blue());
    println!(
        "Stack file: {}",
        project.stack_file.display().to_string().cyan()
    );

    let stack = project.stack(vars)?;
    let engine = project.engine(None);
    let graph = engine.build_graph(&stack.resources).await?;

    println!("{}", "✓ Configuration is valid".green().bold());
    println!();
    println!("Summary ({}):", stack.name.bold());
    println!(
        "  Resources: {} ({} instances)",
        stack.resources.len(),
        graph.len()
    );
    for resource in stack.resources.iter() {
        let instances = graph.instances_of(&resource.id).len();
        if resource.repetition.is_some() {
            println!("    - {} × {}", resource.id.to_string().cyan(), instances);
        } else {
            println!("    - {}", resource.id.to_string().cyan());
        }
    }
    if !stack.resources.data.is_empty() {
        println!("  Data sources: {}", stack.resources.data.len());
    }
    if !stack.resources.outputs.is_empty() {
        println!("  Outputs: {}", stack.resources.outputs.len());
    }
    Ok(())
}
