//! hookvfs - instance administration
//!
//! Usage:
//!   hookvfs --instance <name> status            - Show instance state
//!   hookvfs --instance <name> link-file <v> <r> - Map a virtual file
//!   hookvfs --instance <name> link-dir <v> <r>  - Layer a source directory
//!   hookvfs --instance <name> resolve <v>       - Translate a virtual path
//!   hookvfs --instance <name> list <v>          - Merged directory listing
//!   hookvfs --instance <name> run <program>     - Launch a virtualized child

use clap::{Parser, Subcommand};
use hookvfs::config::{InstanceConfig, LogLevel};
use hookvfs::context::HookContext;
use hookvfs::paths::VirtualPath;
use hookvfs::propagate::ChildLauncher;
use hookvfs::redirect::{self, OpClass, Resolution};
use hookvfs::tree::NodeFlags;
use hookvfs::{Error, Result};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "hookvfs")]
#[command(version = "0.1.0")]
#[command(about = "User-space virtual filesystem instance administration")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Instance name (overrides the configuration file)
    #[arg(short, long)]
    instance: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show instance state
    Status,

    /// Map a virtual file onto a real file
    LinkFile {
        /// Virtual path
        virtual_path: String,
        /// Real path backing it
        real_path: String,
    },

    /// Layer one or more source directories at a virtual directory
    LinkDir {
        /// Virtual path
        virtual_path: String,
        /// Source directories, deepest layer last
        real_paths: Vec<String>,
    },

    /// Virtually delete a path
    Remove {
        /// Virtual path
        virtual_path: String,
    },

    /// Translate a virtual path the way an intercepted open would
    Resolve {
        /// Virtual path
        virtual_path: String,
    },

    /// Merged listing of a virtual directory
    List {
        /// Virtual path
        virtual_path: String,
    },

    /// Manage the executable blacklist
    Blacklist {
        /// Suffix to add
        suffix: Option<String>,

        /// Clear the blacklist
        #[arg(long)]
        clear: bool,
    },

    /// Force a library into future processes with this executable name
    ForceLoad {
        /// Executable name
        process_name: String,
        /// Library to load
        library_path: String,
    },

    /// List registered processes
    Processes,

    /// Launch a child process into the instance
    Run {
        /// Program to run
        program: PathBuf,
        /// Arguments
        args: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing())
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    if let Err(e) = run_command(&cli) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<InstanceConfig> {
    let mut config = match &cli.config {
        Some(path) => InstanceConfig::load(path)?,
        None => {
            let path = InstanceConfig::default_path();
            if path.exists() {
                InstanceConfig::load(&path)?
            } else {
                let mut config = InstanceConfig::default();
                config.apply_env_overrides();
                config
            }
        }
    };

    if let Some(instance) = &cli.instance {
        config = InstanceConfig::new(instance);
        config.apply_env_overrides();
    }

    config.validate()?;
    Ok(config)
}

fn run_command(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let ctx = HookContext::attach_unmanaged(&config)?;

    match &cli.command {
        Commands::Status => cmd_status(&ctx),
        Commands::LinkFile {
            virtual_path,
            real_path,
        } => cmd_link_file(&ctx, virtual_path, real_path),
        Commands::LinkDir {
            virtual_path,
            real_paths,
        } => cmd_link_dir(&ctx, virtual_path, real_paths),
        Commands::Remove { virtual_path } => cmd_remove(&ctx, virtual_path),
        Commands::Resolve { virtual_path } => cmd_resolve(&ctx, virtual_path),
        Commands::List { virtual_path } => cmd_list(&ctx, virtual_path),
        Commands::Blacklist { suffix, clear } => cmd_blacklist(&ctx, suffix.as_deref(), *clear),
        Commands::ForceLoad {
            process_name,
            library_path,
        } => cmd_force_load(&ctx, process_name, library_path),
        Commands::Processes => cmd_processes(&ctx),
        Commands::Run { program, args } => cmd_run(&ctx, program, args),
    }
}

fn cmd_status(ctx: &HookContext) -> Result<()> {
    let guard = ctx.read_access()?;

    println!("Instance: {}", ctx.instance_name());
    println!("==========");
    println!();
    println!("Attached processes: {}", guard.user_count());
    println!("Registered pids: {:?}", guard.registered_processes());
    println!("Tree nodes: {}", guard.tree_node_count());
    println!("Log level: {:?}", guard.log_level());
    println!(
        "Overlay root: {}",
        guard
            .overlay_root()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(unset)".to_string())
    );

    let deleted = guard.deleted_files();
    println!("Deleted entries: {}", deleted.len());
    for (from, to) in deleted {
        println!("  {} (was {})", from, to);
    }

    let fakes = guard.fake_directories();
    println!("Fake directories: {}", fakes.len());
    for (from, to) in fakes {
        println!("  {} -> {}", from, to);
    }

    let blacklist = guard.blacklist();
    println!("Blacklist: {}", blacklist.len());
    for item in blacklist {
        println!("  {}", item);
    }

    Ok(())
}

fn cmd_link_file(ctx: &HookContext, virtual_path: &str, real_path: &str) -> Result<()> {
    let path = VirtualPath::parse(virtual_path)?;
    let guard = ctx.write_access()?;
    guard.add_file(&path, real_path, NodeFlags::empty())?;
    info!("linked {} -> {}", path, real_path);
    Ok(())
}

fn cmd_link_dir(ctx: &HookContext, virtual_path: &str, real_paths: &[String]) -> Result<()> {
    if real_paths.is_empty() {
        return Err(Error::Config("at least one source directory required".to_string()));
    }

    let path = VirtualPath::parse(virtual_path)?;
    let guard = ctx.write_access()?;
    guard.add_directory(&path, real_paths, NodeFlags::empty())?;
    info!("layered {} source(s) at {}", real_paths.len(), path);
    Ok(())
}

fn cmd_remove(ctx: &HookContext, virtual_path: &str) -> Result<()> {
    let guard = ctx.write_access()?;
    if redirect::observe_delete(&guard, virtual_path)? {
        info!("removed {}", virtual_path);
    } else {
        info!("nothing to remove at {}", virtual_path);
    }
    Ok(())
}

fn cmd_resolve(ctx: &HookContext, virtual_path: &str) -> Result<()> {
    let guard = ctx.read_access()?;
    match redirect::resolve(&guard, virtual_path, OpClass::OpenExisting)? {
        Resolution::Real(real) => println!("{}", real.display()),
        Resolution::Absent => println!("(absent)"),
        Resolution::MissingBacking => println!("(backing missing)"),
    }
    Ok(())
}

fn cmd_list(ctx: &HookContext, virtual_path: &str) -> Result<()> {
    let guard = ctx.read_access()?;
    for entry in redirect::enumerate(&guard, virtual_path)? {
        let marker = match entry.kind {
            hookvfs::redirect::EntryKind::Directory => "/",
            hookvfs::redirect::EntryKind::File => "",
        };
        match entry.real {
            Some(real) => println!("{}{}\t{}", entry.name, marker, real.display()),
            None => println!("{}{}\t(virtual)", entry.name, marker),
        }
    }
    Ok(())
}

fn cmd_blacklist(ctx: &HookContext, suffix: Option<&str>, clear: bool) -> Result<()> {
    let guard = ctx.write_access()?;

    if clear {
        guard.clear_blacklist();
        info!("blacklist cleared");
    }

    if let Some(suffix) = suffix {
        guard.blacklist_executable(suffix)?;
        info!("blacklisted {}", suffix);
    }

    if !clear && suffix.is_none() {
        for item in guard.blacklist() {
            println!("{}", item);
        }
    }
    Ok(())
}

fn cmd_force_load(ctx: &HookContext, process_name: &str, library_path: &str) -> Result<()> {
    let guard = ctx.write_access()?;
    guard.force_load_library(process_name, library_path)?;
    info!("forcing {} into {}", library_path, process_name);
    Ok(())
}

fn cmd_processes(ctx: &HookContext) -> Result<()> {
    let guard = ctx.read_access()?;
    for pid in guard.registered_processes() {
        println!("{}", pid);
    }
    Ok(())
}

fn cmd_run(ctx: &HookContext, program: &PathBuf, args: &[String]) -> Result<()> {
    let launcher = ChildLauncher::new(ctx);
    let mut child = launcher.launch(program, args)?;
    let status = child.wait()?;

    launcher.reap(child.id())?;

    if !status.success() {
        return Err(Error::Internal(format!(
            "child exited with {}",
            status.code().unwrap_or(-1)
        )));
    }
    Ok(())
}
