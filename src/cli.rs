//! Command-line interface.
//!
//! `serve` runs the router itself. The router commands (`query`, `scan`,
//! `stats`, `models`, `reload`) are thin HTTP clients against a running
//! server — the same surface any other client uses — honoring
//! `ROUTER_API_HOST` / `ROUTER_API_PORT`. The `conversation` subcommands
//! open the store file directly so they work without a server.
//!
//! Exit codes: 0 success, 1 usage error, 2 configuration error,
//! 3 all-backends-failed, 4 store error.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use crate::{
    config::Config,
    facade::RouterFacade,
    registry::Registry,
    store::{
        export::{export_to_json, import_from_json, ExportDocument},
        ConversationStore, ListFilter, SearchFilter,
    },
};

pub const EXIT_OK: u8 = 0;
pub const EXIT_USAGE: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_ALL_BACKENDS_FAILED: u8 = 3;
pub const EXIT_STORE: u8 = 4;

#[derive(Debug, Parser)]
#[command(name = "llm-router", version, about = "Cost-aware LLM request router")]
pub struct Cli {
    /// Config file path (overrides ROUTER_CONFIG_PATH).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP server and the background model scanner.
    Serve,
    /// Route one query through a running server.
    Query {
        text: String,
        /// Force a specific model reference (`local`, `cloud`, `provider:id`).
        #[arg(long)]
        force_model: Option<String>,
        /// Continue an existing conversation.
        #[arg(long)]
        session: Option<i64>,
    },
    /// Trigger a registry refresh on a running server.
    Scan,
    /// Show the running server's statistics.
    Stats,
    /// List the models the running server has detected.
    Models,
    /// Reload the running server's configuration.
    Reload,
    /// Operate on the conversation store directly.
    Conversation {
        #[command(subcommand)]
        command: ConversationCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConversationCommand {
    /// List conversations, newest first.
    List {
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Print one conversation with its messages.
    Show { id: i64 },
    /// Full-text search over titles and message content.
    Search { query: String },
    /// Write a JSON export document to a file (or stdout).
    Export {
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        topic: Option<String>,
    },
    /// Import a JSON export document.
    Import { file: PathBuf },
    /// Show store row counts.
    Stats,
}

/// Parse arguments and dispatch. Returns the process exit code.
pub async fn run() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help/--version are "errors" to clap but successes to us.
            let code = if e.use_stderr() { EXIT_USAGE } else { EXIT_OK };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let code = match cli.command {
        Command::Serve => serve(cli.config.as_deref()).await,
        Command::Query { text, force_model, session } => {
            query(&text, force_model.as_deref(), session).await
        }
        Command::Scan => simple_post("/models/scan", EXIT_USAGE).await,
        Command::Stats => simple_get("/router/stats").await,
        Command::Models => simple_get("/models/detected").await,
        // A rejected reload means the config file is bad.
        Command::Reload => simple_post("/router/config/reload", EXIT_CONFIG).await,
        Command::Conversation { command } => conversation(cli.config.as_deref(), command),
    };
    ExitCode::from(code)
}

/// Config path resolution: `--config`, then `ROUTER_CONFIG_PATH`, then
/// `./config.yaml`.
pub fn config_path(cli_override: Option<&Path>) -> PathBuf {
    cli_override
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("ROUTER_CONFIG_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.yaml"))
}

/// Base URL of the running server, from `ROUTER_API_HOST`/`ROUTER_API_PORT`.
pub fn api_base() -> String {
    let host = std::env::var("ROUTER_API_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port = std::env::var("ROUTER_API_PORT").unwrap_or_else(|_| "8080".into());
    format!("http://{host}:{port}")
}

/// Store location without requiring a config file: `ROUTER_STORAGE_PATH`
/// wins, then the config file's `database.path`, then the default.
fn storage_path(cli_config: Option<&Path>) -> PathBuf {
    if let Ok(path) = std::env::var("ROUTER_STORAGE_PATH") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    let path = config_path(cli_config);
    if let Ok(config) = Config::load(&path) {
        return config.database.path;
    }
    PathBuf::from("data/conversations.db")
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn serve(cli_config: Option<&Path>) -> u8 {
    let config_path = config_path(cli_config);
    let config = match Config::load(&config_path) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return EXIT_CONFIG;
        }
    };

    // Log to stdout and to a daily-rotated file in the data directory.
    let log_dir = config.data_dir().join("logs");
    let file_appender = tracing_appender::rolling::daily(&log_dir, "llm-router.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    {
        use tracing_subscriber::fmt::writer::MakeWriterExt as _;
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "llm_router=info,tower_http=warn".into()),
            )
            .with_writer(file_writer.and(std::io::stdout))
            .init();
    }

    let store = match ConversationStore::open(&config.database.path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("store error: {e:#}");
            return EXIT_STORE;
        }
    };

    let registry = Arc::new(Registry::new(Some(
        config.data_dir().join("model_registry.json"),
    )));

    // Surface registry diffs in the operator log; downstream consumers use
    // the same subscription channel.
    let mut registry_events = registry.subscribe();
    tokio::spawn(async move {
        while let Some(change) = registry_events.recv().await {
            tracing::info!(
                added = change.added.len(),
                removed = change.removed.len(),
                updated = change.updated.len(),
                "model registry changed"
            );
        }
    });

    registry.refresh(&config).await;
    warn_on_invalid_cloud_credentials(&config, &registry).await;

    let facade = Arc::new(RouterFacade::new(
        Arc::clone(&config),
        config_path,
        Arc::clone(&registry),
        store,
    ));

    let mut store_events = facade.store.subscribe();
    tokio::spawn(async move {
        while let Some(event) = store_events.recv().await {
            tracing::debug!(?event, "store event");
        }
    });

    tokio::spawn(scan_loop(Arc::clone(&facade)));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("failed to bind {addr}: {e}");
            return EXIT_CONFIG;
        }
    };
    tracing::info!(%addr, "llm-router listening");

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));
    let app = crate::api::router(facade)
        .layer(trace_layer)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();

    let result = tokio::select! {
        r = axum::serve(listener, app) => r.map_err(anyhow::Error::from),
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    };

    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("server error: {e:#}");
            EXIT_USAGE
        }
    }
}

/// Probe the default cloud backend's credentials once at startup so a bad
/// key shows up in the log immediately instead of on the first fallback.
async fn warn_on_invalid_cloud_credentials(config: &Config, registry: &Registry) {
    use crate::backends::BackendClient;
    use crate::config::ModelRef;

    let snapshot = registry.snapshot();
    let Some(entry) = snapshot.lookup(&ModelRef::Cloud) else {
        return;
    };
    match BackendClient::for_entry(entry, config, 10_000) {
        Ok(client) => {
            if !client.validate_credentials().await {
                tracing::warn!(
                    model = %entry.model_ref(),
                    "default cloud backend rejected its credentials — fallback to cloud will fail"
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "could not build default cloud backend client"),
    }
}

/// Background task: refresh the registry every `scanner.cache_ttl` seconds.
/// The interval re-reads the live config, so a reload takes effect on the
/// next tick.
async fn scan_loop(facade: Arc<RouterFacade>) {
    loop {
        let ttl = facade.config().scanner.cache_ttl.max(1);
        tokio::time::sleep(std::time::Duration::from_secs(ttl)).await;
        let config = facade.config();
        facade.registry.refresh(&config).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// ---------------------------------------------------------------------------
// HTTP-client commands
// ---------------------------------------------------------------------------

async fn query(text: &str, force_model: Option<&str>, session: Option<i64>) -> u8 {
    if text.trim().is_empty() {
        eprintln!("query text must not be empty");
        return EXIT_USAGE;
    }
    let mut body = json!({ "input": text });
    if let Some(force) = force_model {
        body["force_model"] = json!(force);
    }
    if let Some(session) = session {
        body["session_id"] = json!(session);
    }

    let url = format!("{}/router/query", api_base());
    let response = match reqwest::Client::new().post(&url).json(&body).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("could not reach the router at {url}: {e}");
            eprintln!("is the server running? (llm-router serve)");
            return EXIT_USAGE;
        }
    };

    let status = response.status();
    let payload: Value = match response.json().await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("unreadable response from the router: {e}");
            return EXIT_USAGE;
        }
    };

    if payload["success"] == true {
        println!("{}", payload["response"].as_str().unwrap_or_default());
        if payload["metadata"]["cost_warning"] == true {
            eprintln!("note: request fell back from local to a paid cloud backend");
        }
        EXIT_OK
    } else if status.as_u16() == 502 || status.as_u16() == 503 {
        eprintln!("all backends failed:");
        if let Some(failures) = payload["failures"].as_array() {
            for f in failures {
                eprintln!(
                    "  {} — {}: {}",
                    f["model"].as_str().unwrap_or("?"),
                    f["error_kind"].as_str().unwrap_or("error"),
                    f["error"].as_str().unwrap_or(""),
                );
            }
        } else if let Some(error) = payload["error"].as_str() {
            eprintln!("  {error}");
        }
        EXIT_ALL_BACKENDS_FAILED
    } else {
        eprintln!("router error: {}", payload["error"].as_str().unwrap_or("unknown"));
        EXIT_USAGE
    }
}

async fn simple_get(path: &str) -> u8 {
    http_passthrough(reqwest::Method::GET, path, EXIT_USAGE).await
}

async fn simple_post(path: &str, failure_code: u8) -> u8 {
    http_passthrough(reqwest::Method::POST, path, failure_code).await
}

async fn http_passthrough(method: reqwest::Method, path: &str, failure_code: u8) -> u8 {
    let url = format!("{}{path}", api_base());
    let response = match reqwest::Client::new().request(method, &url).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("could not reach the router at {url}: {e}");
            eprintln!("is the server running? (llm-router serve)");
            return EXIT_USAGE;
        }
    };
    let status = response.status();
    match response.json::<Value>().await {
        Ok(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
            if status.is_success() { EXIT_OK } else { failure_code }
        }
        Err(e) => {
            eprintln!("unreadable response from the router: {e}");
            EXIT_USAGE
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation commands (direct store access)
// ---------------------------------------------------------------------------

fn conversation(cli_config: Option<&Path>, command: ConversationCommand) -> u8 {
    let path = storage_path(cli_config);
    let store = match ConversationStore::open(&path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("store error opening {}: {e:#}", path.display());
            return EXIT_STORE;
        }
    };

    let result = match command {
        ConversationCommand::List { topic, status, limit } => {
            list_conversations(&store, topic.as_deref(), status.as_deref(), limit)
        }
        ConversationCommand::Show { id } => show_conversation(&store, id),
        ConversationCommand::Search { query } => search_conversations(&store, &query),
        ConversationCommand::Export { output, topic } => {
            export_conversations(&store, output.as_deref(), topic.as_deref())
        }
        ConversationCommand::Import { file } => import_conversations(&store, &file),
        ConversationCommand::Stats => {
            store.stats().map(|s| {
                println!(
                    "conversations: {}\nmessages: {}\ntopics: {}",
                    s.conversations, s.messages, s.topics
                );
            })
        }
    };

    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("store error: {e:#}");
            EXIT_STORE
        }
    }
}

fn list_conversations(
    store: &ConversationStore,
    topic: Option<&str>,
    status: Option<&str>,
    limit: u32,
) -> anyhow::Result<()> {
    let topic_id = match topic {
        Some(name) => match store.topic_by_name(name)? {
            Some(t) => Some(t.id),
            None => {
                println!("no conversations (topic `{name}` does not exist)");
                return Ok(());
            }
        },
        None => None,
    };
    let status = status.map(str::parse).transpose()?;
    let conversations = store.list_conversations(&ListFilter {
        topic_id,
        status,
        limit: Some(limit),
        offset: None,
    })?;
    for c in conversations {
        println!(
            "{:>6}  {:<10}  {}  {}",
            c.id,
            c.status,
            c.updated_at.format("%Y-%m-%d %H:%M"),
            c.title
        );
    }
    Ok(())
}

fn show_conversation(store: &ConversationStore, id: i64) -> anyhow::Result<()> {
    let conversation = store
        .get_conversation(id)?
        .ok_or_else(|| anyhow::anyhow!("conversation {id} does not exist"))?;
    println!("# {} ({})", conversation.title, conversation.status);
    for m in store.get_messages(id, None, None)? {
        let model = m.model_ref.map(|r| format!(" [{r}]")).unwrap_or_default();
        println!("{} {}{}: {}", m.timestamp.format("%H:%M:%S"), m.role, model, m.content);
    }
    Ok(())
}

fn search_conversations(store: &ConversationStore, query: &str) -> anyhow::Result<()> {
    let hits = store.search_conversations(query, &SearchFilter::default())?;
    if hits.is_empty() {
        println!("no matches");
        return Ok(());
    }
    for hit in hits {
        println!(
            "{:>6}  {:>3} message(s)  {}",
            hit.conversation.id, hit.matched_messages, hit.conversation.title
        );
    }
    Ok(())
}

fn export_conversations(
    store: &ConversationStore,
    output: Option<&Path>,
    topic: Option<&str>,
) -> anyhow::Result<()> {
    let topic_id = topic
        .map(|name| {
            store
                .topic_by_name(name)?
                .map(|t| t.id)
                .ok_or_else(|| anyhow::anyhow!("topic `{name}` does not exist"))
        })
        .transpose()?;
    let document = export_to_json(store, None, topic_id)?;
    let json = serde_json::to_string_pretty(&document)?;
    match output {
        Some(path) => {
            std::fs::write(path, &json)?;
            eprintln!(
                "exported {} conversation(s) to {}",
                document.conversations.len(),
                path.display()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn import_conversations(store: &ConversationStore, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)?;
    let document: ExportDocument = serde_json::from_str(&content)?;
    let created = import_from_json(store, &document)?;
    eprintln!("imported {} conversation(s)", created.len());
    Ok(())
}
