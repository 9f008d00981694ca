//! CLI command definitions using clap

use crate::output::OutputFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Keel CLI - inspect model files, hardware and the model store
#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json, table)
    #[arg(short = 'o', long, global = true)]
    pub output: Option<OutputFormat>,

    /// Configuration file path
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Models directory, overrides the configuration
    #[arg(long, global = true, env = "KEEL_MODELS_DIR")]
    pub models_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Detect the format of model files
    Detect {
        /// Files to classify
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Estimate the memory footprint of a model
    Estimate {
        /// Size tag, e.g. 7b, 350m, large
        #[arg(short, long)]
        size: Option<String>,

        /// Quantization tag, e.g. q4_k_m, q8_0, f16
        #[arg(short, long)]
        quant: Option<String>,
    },

    /// Show detected accelerators and memory
    Hardware,

    /// Manage stored models
    Models {
        #[command(subcommand)]
        action: ModelCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

impl Commands {
    /// Dotted command path used in logs, e.g. `models.download`.
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Detect { .. } => "detect",
            Commands::Estimate { .. } => "estimate",
            Commands::Hardware => "hardware",
            Commands::Models { action } => match action {
                ModelCommands::List => "models.list",
                ModelCommands::Download { .. } => "models.download",
                ModelCommands::Size { .. } => "models.size",
                ModelCommands::Delete { .. } => "models.delete",
            },
            Commands::Config { action } => match action {
                ConfigCommands::Show => "config.show",
                ConfigCommands::Validate { .. } => "config.validate",
            },
        }
    }
}

/// Model store subcommands
#[derive(Subcommand)]
pub enum ModelCommands {
    /// List models in the models directory and configured catalog
    List,

    /// Download or copy a model into the store
    Download {
        /// Model id
        id: String,

        /// URL or local path
        source: String,

        /// Expected SHA-256 of the file
        #[arg(long)]
        sha256: Option<String>,

        /// File name to store under
        #[arg(long)]
        filename: Option<String>,
    },

    /// Show the stored size of a model
    Size {
        /// Model id
        id: String,
    },

    /// Delete a stored model
    Delete {
        /// Model id
        id: String,
    },
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Validate a configuration file
    Validate {
        /// Configuration file
        path: PathBuf,
    },
}
