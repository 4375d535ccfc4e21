use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use imgpull::{config, ImportSession};

#[derive(Parser)]
#[command(name = "imgpull", about = "Download raw VM disk images into a local cache")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file (default: ~/.config/imgpull/imgpullrc)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Download an image into the cache
    Pull {
        /// Source URL (http:// or https://)
        url: String,

        /// Also create a writable copy with this machine name
        #[arg(short, long)]
        local: Option<String>,

        /// Replace an existing writable copy
        #[arg(short, long)]
        force_local: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Show current configuration
    Get,
    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.as_deref();

    if cli.verbose {
        let resolved = config::resolve_path(config_path)?;
        eprintln!("config: {}", resolved.display());
    }

    let cfg = config::load(config_path)?;

    match cli.command {
        Command::Config(cmd) => match cmd {
            ConfigCommand::Get => {
                cfg.display();
            }
            ConfigCommand::Set { key, value } => {
                let mut cfg = cfg;
                match key.as_str() {
                    "image_root" => {
                        cfg.image_root = PathBuf::from(&value);
                    }
                    _ => bail!("unknown config key: {key}"),
                }
                config::save(&cfg, config_path)?;
            }
        },
        Command::Pull {
            url,
            local,
            force_local,
        } => {
            fs::create_dir_all(&cfg.image_root)
                .with_context(|| format!("failed to create {}", cfg.image_root.display()))?;

            let mut session = ImportSession::new(cfg.image_root.clone(), cli.verbose)?;
            session.pull(&url, local.as_deref(), force_local)?;
            session.run()?;

            if let Some(local) = local {
                println!("{local}");
            }
        }
    }

    Ok(())
}
