use anyhow::Result;
use clap::{Parser, Subcommand};
use gfsvol::modules::config::parse_log_level;
use gfsvol::modules::constants::DEFAULT_ROOT;
use gfsvol::modules::options::split_option;
use gfsvol::{DriverConfig, Host, JsonFileStore, StoreError, VolumeDriver, VolumeInfo};
use log::{debug, error, info, LevelFilter};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Directory under which physical mounts are created
    #[arg(long, global = true, default_value = DEFAULT_ROOT)]
    root: PathBuf,

    /// State file (defaults to <root>/glusterfs-state.json)
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    /// Comma separated server list fixed for every volume
    #[arg(long, global = true, env = "SERVERS", default_value = "")]
    servers: String,

    /// Remote volume shared by every volume
    #[arg(long, global = true, env = "VOLUME_NAME", default_value = "")]
    volume_name: String,

    /// Space separated `key[=value]` mount options fixed for every volume
    #[arg(long, global = true, env = "OPTIONS", default_value = "")]
    options: String,

    /// TRACE, DEBUG, INFO, WARNING, ERROR, CRITICAL or NONE
    #[arg(long, global = true, env = "LOGLEVEL", default_value = "")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a volume
    Create {
        /// Volume name
        name: String,
        /// Volume option, repeatable
        #[arg(short = 'o', long = "opt", value_name = "KEY[=VALUE]")]
        opts: Vec<String>,
    },
    /// Show a volume
    Get {
        /// Volume name
        name: String,
    },
    /// List all volumes
    List,
    /// Print the path of a volume
    Path {
        /// Volume name
        name: String,
    },
    /// Mount a volume, taking one reference
    Mount {
        /// Volume name
        name: String,
    },
    /// Release one reference on a volume
    Unmount {
        /// Volume name
        name: String,
    },
    /// Remove a volume
    Remove {
        /// Volume name
        name: String,
    },
    /// Show driver capabilities
    Capabilities,
}

impl Commands {
    /// Whether the command saves state when it succeeds.
    fn mutates(&self) -> bool {
        matches!(
            self,
            Commands::Create { .. }
                | Commands::Mount { .. }
                | Commands::Unmount { .. }
                | Commands::Remove { .. }
        )
    }
}

// A failed load leaves the driver empty; saving that would wipe the file.
fn check_loaded(loaded: std::result::Result<(), StoreError>, command: &Commands) -> Result<()> {
    if let Err(e) = loaded {
        if command.mutates() {
            return Err(anyhow::Error::new(e)
                .context("state file could not be loaded, refusing to overwrite it"));
        }
        error!("{}", e);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger based on verbose flag and LOGLEVEL
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        parse_log_level(&cli.log_level)?
    };

    env_logger::Builder::new().filter_level(log_level).init();

    let mut config = DriverConfig::new(cli.root.clone())
        .with_servers(cli.servers.clone())
        .with_volume_name(cli.volume_name.clone())
        .with_option_string(&cli.options)?;
    if let Some(state_file) = &cli.state_file {
        config = config.with_state_path(state_file.clone());
    }

    let store = JsonFileStore::new(config.state_path.clone());
    debug!("Using state file {}", store.path().display());
    let driver = VolumeDriver::new(config, Host::system(), Box::new(store));
    check_loaded(driver.load_state(), &cli.command)?;

    match &cli.command {
        Commands::Create { name, opts } => {
            let options: BTreeMap<String, String> = opts
                .iter()
                .map(|token| {
                    let (key, value) = split_option(token);
                    (key.to_string(), value.to_string())
                })
                .collect();
            driver.create(name, options)?;
            info!("Created volume {}", name);
            println!("{}", name);
        }
        Commands::Get { name } => {
            let volume = driver.get(name)?;
            print_volumes(&[volume], cli.json)?;
        }
        Commands::List => {
            print_volumes(&driver.list(), cli.json)?;
        }
        Commands::Path { name } => {
            println!("{}", driver.path(name)?.display());
        }
        Commands::Mount { name } => {
            println!("{}", driver.mount(name)?.display());
        }
        Commands::Unmount { name } => {
            driver.unmount(name)?;
        }
        Commands::Remove { name } => {
            driver.remove(name)?;
            println!("{}", name);
        }
        Commands::Capabilities => {
            let capabilities = driver.capabilities();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&capabilities)?);
            } else {
                println!("Scope: {:?}", capabilities.scope);
            }
        }
    }

    Ok(())
}

fn print_volumes(volumes: &[VolumeInfo], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(volumes)?);
        return Ok(());
    }
    for volume in volumes {
        println!("{}\t{}", volume.name, volume.mountpoint.display());
    }
    Ok(())
}
