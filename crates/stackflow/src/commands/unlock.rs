use crate::project::Project;
use chrono::Utc;
use colored::Colorize;

/// Break the state lock. Never done automatically.
pub async fn handle(project: &Project, lock_id: &str) -> anyhow::Result<()> {
    let engine = project.engine(None);
    match engine.lock_info().await? {
        None => {
            println!("{}", "State is not locked.".green());
            return Ok(());
        }
        Some(info) if info.id != lock_id => {
            anyhow::bail!(
                "Lock id mismatch: the state is locked with id {} by {} ({})",
                info.id,
                info.owner,
                info.operation
            );
        }
        Some(info) => {
            let age = Utc::now().signed_duration_since(info.acquired_at);
            println!(
                "Breaking lock held by {} for {} ({} minutes old)",
                info.owner.bold(),
                info.operation,
                age.num_minutes()
            );
        }
    }

    engine.force_unlock(lock_id).await?;
    println!("{} Lock {} released", "✓".green(), lock_id);
    Ok(())
}
