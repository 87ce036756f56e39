use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "memdex",
    about = "Resumable indexing and retrieval for personal chat memory"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build or resume the index for a corpus
    Build(BuildArgs),
    /// Retrieve the chunks most similar to a query
    Search(SearchArgs),
    /// Show build progress and index readiness
    Status(StatusArgs),
    /// Delete all build progress and batch files
    Reset,
    /// Manage stored settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Build --

#[derive(Debug, Parser)]
pub struct BuildArgs {
    /// JSON-lines corpus, plain or gzipped
    pub corpus: PathBuf,

    /// Build an in-memory TF-IDF index instead of calling the embedding
    /// service
    #[arg(long)]
    pub statistical: bool,

    /// Corpus lines per batch
    #[arg(long)]
    pub batch_size: Option<u64>,

    /// Chunks per embedding request
    #[arg(long)]
    pub sub_batch_size: Option<usize>,

    /// Stop after this many batches, leaving the build resumable
    #[arg(long)]
    pub max_batches: Option<u64>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "5")]
    pub count: usize,

    /// Only return chunks whose category contains this text
    #[arg(short = 'c', long)]
    pub category: Option<String>,

    /// Output results as JSON
    #[arg(long, conflicts_with = "context")]
    pub json: bool,

    /// Print a prompt context block instead of a result list
    #[arg(long)]
    pub context: bool,

    /// Character budget for --context
    #[arg(long, default_value_t = memdex::context::DEFAULT_CONTEXT_CHARS)]
    pub max_chars: usize,

    /// Search an in-memory TF-IDF index built from --corpus
    #[arg(long, requires = "corpus")]
    pub statistical: bool,

    /// Corpus to index for --statistical
    #[arg(long)]
    pub corpus: Option<PathBuf>,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show every setting with its resolved value
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting in the state database
    Set {
        /// Setting name (see `config show`)
        key: String,
        /// New value
        value: String,
    },
    /// Remove a stored setting (revert to default)
    Clear {
        /// Setting name
        key: String,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "memdex",
            &mut std::io::stdout(),
        );
    }
}
