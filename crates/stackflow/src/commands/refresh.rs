use super::plan::print_refresh_summary;
use crate::project::Project;
use colored::Colorize;

pub async fn handle(project: &Project) -> anyhow::Result<()> {
    let engine = project.engine(None);
    let (report, state) = engine.refresh().await?;

    if report.has_drift() || !report.errors.is_empty() {
        print_refresh_summary(&report);
    } else {
        println!("{}", "No drift detected.".green());
    }
    println!(
        "Checked {} object{} (state serial {})",
        report.checked,
        if report.checked == 1 { "" } else { "s" },
        state.serial
    );

    if !report.errors.is_empty() {
        anyhow::bail!("{} object(s) could not be read", report.errors.len());
    }
    Ok(())
}
