use crate::project::Project;

/// Print the resource graph as Graphviz DOT.
pub async fn handle(project: &Project, vars: &[String]) -> anyhow::Result<()> {
    let stack = project.stack(vars)?;
    let graph = project.engine(None).build_graph(&stack.resources).await?;
    print!("{}", graph.to_dot());
    Ok(())
}
