mod commands;
mod project;
mod render;

use clap::{Parser, Subcommand};
use colored::Colorize;
use project::Project;
use stackflow_engine::EngineError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stackflow")]
#[command(about = "Declare it in KDL. Reconcile it in dependency order.", long_about = None)]
struct Cli {
    /// Stack file (default: discovered from the current directory)
    #[arg(short = 'f', long = "file", global = true)]
    file: Option<PathBuf>,

    /// Override a stack variable (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE", global = true)]
    vars: Vec<String>,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the stack file and its resource graph
    Validate,
    /// Print the resource graph in Graphviz DOT format
    Graph,
    /// Show the changes apply would make
    Plan {
        /// Save the plan to a file for a later `apply <PLAN>`
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Read every recorded object first and plan against what exists
        #[arg(long)]
        refresh: bool,
    },
    /// Create, update and delete resources to match the stack
    Apply {
        /// Saved plan file from `plan --out`
        plan: Option<PathBuf>,
        /// Apply without asking
        #[arg(short, long)]
        yes: bool,
        /// Maximum concurrent operations
        #[arg(short, long)]
        parallelism: Option<usize>,
    },
    /// Delete every resource recorded in state
    Destroy {
        /// Destroy without asking
        #[arg(short, long)]
        yes: bool,
        /// Maximum concurrent operations
        #[arg(short, long)]
        parallelism: Option<usize>,
    },
    /// Read recorded objects back and record drift
    Refresh,
    /// Show output values
    Output {
        /// A single output
        name: Option<String>,
        /// JSON output
        #[arg(long)]
        json: bool,
    },
    /// Inspect or edit recorded state
    #[command(subcommand)]
    State(StateCommands),
    /// Break a state lock left behind by a crashed run
    #[command(name = "force-unlock")]
    ForceUnlock {
        /// Lock id, as shown in the lock error
        lock_id: String,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum StateCommands {
    /// List recorded resource instances
    List,
    /// Show one recorded instance
    Show {
        /// Instance address, e.g. local_file.page[0]
        address: String,
    },
    /// Forget an instance without deleting the real object
    Rm {
        /// Instance address
        address: String,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        if e.downcast_ref::<EngineError>().is_some_and(EngineError::is_recoverable) {
            eprintln!("{}", "Retry once the other operation has finished.".yellow());
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Version needs no project
    if matches!(cli.command, Commands::Version) {
        println!("stackflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let project = Project::locate(cli.file.as_deref())?;
    let vars = &cli.vars;

    match cli.command {
        Commands::Validate => commands::validate::handle(&project, vars).await,
        Commands::Graph => commands::graph::handle(&project, vars).await,
        Commands::Plan { out, refresh } => {
            commands::plan::handle(&project, vars, out.as_deref(), refresh).await
        }
        Commands::Apply {
            plan,
            yes,
            parallelism,
        } => commands::apply::handle(&project, vars, plan.as_deref(), yes, parallelism).await,
        Commands::Destroy { yes, parallelism } => {
            commands::destroy::handle(&project, vars, yes, parallelism).await
        }
        Commands::Refresh => commands::refresh::handle(&project).await,
        Commands::Output { name, json } => {
            commands::output::handle(&project, vars, name.as_deref(), json).await
        }
        Commands::State(StateCommands::List) => commands::state::handle_list(&project).await,
        Commands::State(StateCommands::Show { address }) => {
            commands::state::handle_show(&project, &address).await
        }
        Commands::State(StateCommands::Rm { address }) => {
            commands::state::handle_rm(&project, &address).await
        }
        Commands::ForceUnlock { lock_id } => commands::unlock::handle(&project, &lock_id).await,
        Commands::Version => Ok(()),
    }
}
