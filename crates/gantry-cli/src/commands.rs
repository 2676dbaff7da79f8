//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a pipeline configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "gantry.yaml")]
        path: PathBuf,
    },

    /// Print pipelines in dependency order, upstream first
    Graph {
        /// Path to the configuration file
        #[arg(default_value = "gantry.yaml")]
        path: PathBuf,
    },

    /// Print the JSON schema of the configuration file
    Schema,

    /// Run scheduling passes against a configuration and a modifications feed
    Tick {
        /// Path to the configuration file
        #[arg(short, long, default_value = "gantry.yaml")]
        config: PathBuf,

        /// YAML list of materials and their modifications
        #[arg(short, long)]
        modifications: PathBuf,

        /// Scheduler settings file
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Number of passes to run
        #[arg(short = 'n', long, default_value_t = 1)]
        ticks: u32,
    },

    /// Keep scheduling until interrupted
    Serve {
        /// Path to the configuration file
        #[arg(short, long, default_value = "gantry.yaml")]
        config: PathBuf,

        /// YAML list of materials and their modifications
        #[arg(short, long)]
        modifications: PathBuf,

        /// Scheduler settings file
        #[arg(short, long)]
        settings: Option<PathBuf>,
    },
}
