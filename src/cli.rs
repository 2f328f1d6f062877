use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "import-triage")]
#[command(about = "Classifies files dropped into import folders", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./Config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Watch the configured roots until Enter is pressed
    Run {
        /// Stop after this many passes
        #[arg(long)]
        passes: Option<u64>,
    },
    /// Run a single dry pass over a directory and print the verdicts
    Check {
        path: String,
    },
    /// Print configuration values
    PrintConfig,
}
