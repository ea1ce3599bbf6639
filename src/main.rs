use std::{
    io::{BufRead, Write},
    path::Path,
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use docfuse::{
    DataDir, Error, ModelManager, Result, RetrievalEngine,
    doc_id::DEFAULT_SHARED_ID,
    engine::IndexStatus,
    ingestion::{IdPolicy, NewDocument},
    lexical_index::IndexSchema,
    model_manager::{CrossEncoderSpec, EmbedderSpec},
    rag::{self, ChatHistory, ProviderConfig, RagSession},
    search::{self, SearchParams},
};
use kdam::{BarExt, tqdm};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCFUSE_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn model_manager(cli: &Cli) -> Result<ModelManager> {
    let embedder = match &cli.embedder {
        Some(name) => name.parse()?,
        None => EmbedderSpec::from_env(),
    };
    let cross_encoder = match &cli.cross_encoder {
        Some(name) => name.parse()?,
        None => CrossEncoderSpec::from_env(),
    };
    Ok(ModelManager::with_specs(embedder, cross_encoder))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.index_dir.as_deref())?;
    let models = Arc::new(model_manager(&cli)?);
    let mut engine = RetrievalEngine::new(models);
    let index_dir = data_dir.root();

    match cli.command {
        Command::Create(args) => {
            let schema = IndexSchema {
                analyzer: args.analyzer,
                dimension: args.dimension,
            };
            engine.create(index_dir, schema, args.overwrite)?;
            println!("Created index at {}", index_dir.display());
        }
        Command::Add(args) => {
            engine.open_or_create(index_dir, IndexSchema::default())?;
            cmd_add(&engine, args)?;
        }
        Command::LoadDocs(args) => {
            engine.open_or_create(index_dir, IndexSchema::default())?;
            cmd_load_docs(&engine, &args.dir)?;
        }
        Command::LoadDataset(args) => {
            engine.open_or_create(index_dir, IndexSchema::default())?;
            let count =
                engine.ingest_dataset(&args.path, &args.id_column, &args.content_column)?;
            println!("Added {count} document(s) from {}", args.path.display());
        }
        Command::Search(args) => {
            engine.load(index_dir)?;
            let results = engine.search(&search_params(&args))?;
            if args.json {
                println!("{}", search::to_json(&args.query, &results)?);
            } else {
                search::format_matches_human(&results);
            }
        }
        Command::Rank(args) => {
            engine.load(index_dir)?;
            let results = engine.search_and_rank(&search_params(&args))?;
            if args.json {
                println!("{}", search::to_json(&args.query, &results)?);
            } else {
                search::format_ranked_human(&results);
            }
        }
        Command::Ask(args) => {
            engine.load(index_dir)?;
            let mut session = rag_session(engine, &data_dir, &args.provider)?;
            let answer = runtime()?.block_on(session.ask(&args.query))?;
            println!("{answer}");
        }
        Command::Chat(args) => {
            engine.load(index_dir)?;
            let session = rag_session(engine, &data_dir, &args.provider)?;
            cmd_chat(session)?;
        }
        Command::Status(args) => {
            engine.load(index_dir)?;
            cmd_status(&engine.status()?, args.json)?;
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

fn search_params(args: &cli::SearchArgs) -> SearchParams {
    let mut params = SearchParams::new(&args.query, args.k);
    if !args.fields.is_empty() {
        params = params.with_fields(args.fields.clone());
    }
    if let Some(ms) = args.timeout_ms {
        params = params.with_timeout(Duration::from_millis(ms));
    }
    params
}

fn cmd_add(engine: &RetrievalEngine, args: cli::AddArgs) -> Result<()> {
    let cli::AddArgs {
        contents,
        id,
        shared,
    } = args;

    let (policy, documents): (IdPolicy, Vec<NewDocument>) = match id {
        _ if shared => (
            IdPolicy::Shared(id.unwrap_or_else(|| DEFAULT_SHARED_ID.to_string())),
            contents.into_iter().map(NewDocument::new).collect(),
        ),
        Some(_) if contents.len() > 1 => {
            return Err(Error::Config(
                "--id names a single document; use --shared to group several".into(),
            ));
        }
        Some(id) => (
            IdPolicy::Auto,
            contents
                .into_iter()
                .map(|content| NewDocument::with_id(id.clone(), content))
                .collect(),
        ),
        None => (
            IdPolicy::Auto,
            contents.into_iter().map(NewDocument::new).collect(),
        ),
    };

    for id in engine.add_documents(documents, &policy)? {
        println!("{id}");
    }
    Ok(())
}

fn cmd_load_docs(engine: &RetrievalEngine, dir: &Path) -> Result<()> {
    let bar: Mutex<Option<kdam::Bar>> = Mutex::new(None);
    let count = engine.ingest_directory(dir, &|_, total| {
        if let Ok(mut slot) = bar.lock() {
            let bar = slot.get_or_insert_with(|| tqdm!(total = total, desc = "Extracting"));
            let _ = bar.update(1);
        }
    })?;
    if bar.lock().map(|slot| slot.is_some()).unwrap_or(false) {
        eprintln!();
    }

    println!("Added {count} document(s) from {}", dir.display());
    Ok(())
}

fn cmd_status(status: &IndexStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(status)?);
    } else {
        println!("Index directory: {}", status.dir);
        println!("Analyzer: {}", status.analyzer);
        println!("Documents: {}", status.documents);
        match status.dimension {
            Some(d) => println!("Dimension: {d}"),
            None => println!("Dimension: (not yet established)"),
        }
        if let Some(embedder) = &status.embedder {
            println!("Embedder: {embedder}");
        }
        if let Some(cross_encoder) = &status.cross_encoder {
            println!("Cross-encoder: {cross_encoder}");
        }
    }
    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

fn rag_session(
    engine: RetrievalEngine,
    data_dir: &DataDir,
    args: &cli::ProviderArgs,
) -> Result<RagSession> {
    let provider = rag::connect(&ProviderConfig {
        kind: args.provider,
        api_key: args.api_key.clone(),
        base_url: args.base_url.clone(),
        model: args.model.clone(),
    })?;
    let history_path = args
        .history
        .clone()
        .unwrap_or_else(|| data_dir.history_file());
    let history = ChatHistory::open(&history_path, args.max_history)?;

    Ok(RagSession::new(engine, provider, history).with_k(args.k))
}

fn cmd_chat(mut session: RagSession) -> Result<()> {
    let rt = runtime()?;
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    println!("Welcome to docfuse chat!");
    println!("Type '/exit' or '/bye' to end the conversation.\n");

    loop {
        print!("User: ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input.to_ascii_lowercase().as_str(), "/exit" | "/bye") {
            println!("Chatbot: Goodbye!");
            break;
        }

        match rt.block_on(session.ask(input)) {
            Ok(answer) => println!("Chatbot: {answer}\n"),
            Err(e) => eprintln!("Error: {e}\n"),
        }
    }
    Ok(())
}
