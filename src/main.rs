use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use vmfleet_hypervisor::platform::LinuxPlatform;
use vmfleet_hypervisor::qemu::QemuFactory;
use vmfleet_hypervisor::state::StateStore;

#[derive(Parser)]
#[command(name = "vmfleet-hypervisor")]
#[command(about = "QEMU lifecycle engine for local instance fleets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State directory override
    #[arg(long, global = true, env = "VMFLEET_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that this host can run instances
    Health,

    /// Print the hypervisor version
    Version,

    /// Launch an instance and supervise it until the guest powers down
    Run {
        /// Path to the instance description (JSON)
        description: PathBuf,
    },

    /// List known instances and their states
    List,

    /// Apply a sizing property to a stopped instance
    Set {
        /// Path to the instance description (JSON)
        description: PathBuf,

        /// Property to change: cpus, memory or disk
        property: String,

        /// New value (e.g. 4, 4G, 20G)
        value: String,
    },

    /// Remove an instance's host resources and stored state
    Purge {
        /// Instance name
        name: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => ProjectDirs::from("", "", "vmfleet")
            .context("failed to determine project directories")?
            .data_dir()
            .join("hypervisor"),
    };
    std::fs::create_dir_all(&state_dir).context("failed to create state directory")?;
    tracing::debug!(state_dir = %state_dir.display(), "using state directory");

    let store = StateStore::new(&state_dir.join("state.db"))
        .context("failed to initialize the state store")?;
    let factory = QemuFactory::new(
        state_dir,
        Box::new(|| Ok(Arc::new(LinuxPlatform::new()))),
    )
    .context("failed to initialize the QEMU backend")?;

    match cli.command {
        Commands::Health => vmfleet_hypervisor::cli::health::execute(&factory)?,
        Commands::Version => vmfleet_hypervisor::cli::version::execute(&factory)?,
        Commands::Run { description } => {
            vmfleet_hypervisor::cli::run::execute(&description, &factory, &store)?;
        }
        Commands::List => vmfleet_hypervisor::cli::list::execute(&store)?,
        Commands::Set {
            description,
            property,
            value,
        } => {
            vmfleet_hypervisor::cli::set::execute(&description, &property, &value, &factory, &store)?;
        }
        Commands::Purge { name } => {
            vmfleet_hypervisor::cli::purge::execute(&name, &factory, &store)?;
        }
    }

    Ok(())
}
