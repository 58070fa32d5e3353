use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// The command line interface for consrv.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the consrv.toml configuration file.
    #[arg(short = 'c', long, default_value = "consrv.toml")]
    pub config: PathBuf,

    /// Path to the OpenSSH format host key file.
    #[arg(short = 'k', long, default_value = "host_key")]
    pub host_key: PathBuf,

    /// [EXPERIMENTAL] run as an unprivileged process on platforms which
    /// support it.
    #[arg(long = "experimental-drop-privileges")]
    pub drop_privileges: bool,

    /// Subcommands.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}

/// Run a subcommand to completion.
pub fn handle_command(command: Commands) {
    match command {
        Commands::Examples(Examples::Config) => {
            let example = Config::example()
                .to_toml()
                .expect("the example configuration serializes");
            println!("{example}");
        }
    }
}
