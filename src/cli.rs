//! Command-line interface for agi
//!
//! Uses clap with derive for type-safe CLI parsing

use agi::manifest::DEFAULT_CONFIG_PATH;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// agi - Linux chroot jail manager
#[derive(Parser)]
#[command(name = "agi")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short = 'y', long)]
        force: bool,
    },

    /// Validate configuration
    Validate,

    /// Build the jail tree for an environment
    Create {
        /// Environment name
        name: String,
    },

    /// Start a jail
    Start {
        /// Environment name
        name: String,
    },

    /// Stop a jail
    Stop {
        /// Environment name
        name: String,
    },

    /// Stop then start a jail
    Restart {
        /// Environment name
        name: String,
    },

    /// Show the status of one jail
    Status {
        /// Environment name
        name: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List jails and their status
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Execute a command in a running jail
    Exec {
        /// Environment name
        name: String,

        /// Command to execute (use -- to separate from options)
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Stop a jail and delete its tree
    Remove {
        /// Environment name
        name: String,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Commands {
    /// Commands that mount, chroot or write under the base path
    pub fn needs_root(&self) -> bool {
        matches!(
            self,
            Commands::Create { .. }
                | Commands::Start { .. }
                | Commands::Stop { .. }
                | Commands::Restart { .. }
                | Commands::Exec { .. }
                | Commands::Remove { .. }
        )
    }
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "agi", &mut std::io::stdout());
    }
}
