use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use docfuse::{
    lexical_index::Analyzer,
    rag::{DEFAULT_MAX_TURNS, ProviderKind},
    search::DEFAULT_K,
};

#[derive(Debug, Parser)]
#[command(
    name = "docfuse",
    about = "Hybrid lexical and semantic search over your documents"
)]
pub struct Cli {
    /// Index directory (defaults to $DOCFUSE_INDEX_DIR or the XDG data dir)
    #[arg(long, global = true)]
    pub index_dir: Option<PathBuf>,

    /// Embedding model ID, local path, or hash[:DIM] for the offline embedder
    #[arg(long, global = true)]
    pub embedder: Option<String>,

    /// Cross-encoder model ID, local path, or "overlap" for the offline ranker
    #[arg(long, global = true)]
    pub cross_encoder: Option<String>,

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
    /// Create a new, empty index
    Create(CreateArgs),
    /// Add documents given on the command line
    Add(AddArgs),
    /// Ingest every .txt, .pdf and .epub file under a directory
    LoadDocs(LoadDocsArgs),
    /// Ingest the rows of a CSV dataset
    LoadDataset(LoadDatasetArgs),
    /// Find the chunks closest to a query in the best matching documents
    Search(SearchArgs),
    /// Search and rank the candidate chunks with the cross-encoder
    Rank(SearchArgs),
    /// Answer one question from the index with a completion provider
    Ask(AskArgs),
    /// Interactive question answering
    Chat(ChatArgs),
    /// Show index status and statistics
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

fn parse_analyzer(s: &str) -> Result<Analyzer, String> {
    s.parse().map_err(|e: docfuse::Error| e.to_string())
}

fn parse_provider(s: &str) -> Result<ProviderKind, String> {
    s.parse().map_err(|e: docfuse::Error| e.to_string())
}

#[derive(Debug, Parser)]
pub struct CreateArgs {
    /// Text analyzer: keyword, standard, fancy or language
    #[arg(long, default_value = "standard", value_parser = parse_analyzer)]
    pub analyzer: Analyzer,

    /// Fix the vector dimension up front instead of taking it from the
    /// first document
    #[arg(long)]
    pub dimension: Option<usize>,

    /// Replace an existing index
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Debug, Parser)]
pub struct AddArgs {
    /// Document contents
    #[arg(required = true)]
    pub contents: Vec<String>,

    /// Document id (single document), or the shared id with --shared
    #[arg(long)]
    pub id: Option<String>,

    /// Store every document under one shared id
    #[arg(long)]
    pub shared: bool,
}

#[derive(Debug, Parser)]
pub struct LoadDocsArgs {
    /// Directory to ingest recursively
    pub dir: PathBuf,
}

#[derive(Debug, Parser)]
pub struct LoadDatasetArgs {
    /// CSV file with a header row
    pub path: PathBuf,

    /// Column holding document ids
    #[arg(long, default_value = "id")]
    pub id_column: String,

    /// Column holding document text
    #[arg(long, default_value = "content")]
    pub content_column: String,
}

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Documents taken from the lexical stage, and chunks kept per document
    #[arg(short, long, default_value_t = DEFAULT_K)]
    pub k: usize,

    /// Restrict the lexical stage to these fields (repeatable)
    #[arg(long = "field")]
    pub fields: Vec<String>,

    /// Abort the search after this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ProviderArgs {
    /// Completion provider: openai, anthropic or nvidia
    #[arg(long, default_value = "openai", value_parser = parse_provider)]
    pub provider: ProviderKind,

    /// API key (defaults to the provider's environment variable)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Override the provider's base URL
    #[arg(long)]
    pub base_url: Option<String>,

    /// Completion model name
    #[arg(long)]
    pub model: Option<String>,

    /// Documents retrieved per question
    #[arg(short, long, default_value_t = DEFAULT_K)]
    pub k: usize,

    /// Chat history file (defaults to chat_history.json in the index dir)
    #[arg(long)]
    pub history: Option<PathBuf>,

    /// Number of history entries kept
    #[arg(long, default_value_t = DEFAULT_MAX_TURNS)]
    pub max_history: usize,
}

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The question
    pub query: String,

    #[command(flatten)]
    pub provider: ProviderArgs,
}

#[derive(Debug, Parser)]
pub struct ChatArgs {
    #[command(flatten)]
    pub provider: ProviderArgs,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

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
        clap_complete::generate(self.shell, &mut cmd, "docfuse", &mut std::io::stdout());
    }
}
