use anyhow::Result;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};
use webscout_core::SearchResults;
use webscout_local::browser::ChromiumFactory;
use webscout_local::llm::RefineClient;
use webscout_local::session::{SessionConfig, SessionManager};
use webscout_local::{identity, refine, search};

#[derive(Parser, Debug)]
#[command(name = "webscout")]
#[command(about = "Web research tool server (search + extract + refine)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP tool server.
    Serve(ServeCmd),
    /// Diagnose configuration/launch issues (json; no secrets).
    Doctor,
    /// Print version info.
    Version,
}

#[derive(clap::Args, Debug)]
struct ServeCmd {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 9888)]
    port: u16,
}

type Pool = Arc<SessionManager<ChromiumFactory>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Serve(cmd) => serve(cmd.port).await,
        Commands::Doctor => {
            println!("{}", serde_json::to_string_pretty(&doctor())?);
            Ok(())
        }
        Commands::Version => {
            println!("webscout {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn serve(port: u16) -> Result<()> {
    info!("starting webscout server");
    webscout_local::clear_cache_root();

    let pool: Pool = Arc::new(SessionManager::new(ChromiumFactory, SessionConfig::default()));

    let app = router(Arc::clone(&pool));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.destroy().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
}

fn router(pool: Pool) -> Router {
    Router::new()
        // The orchestration host requires a 200 on "/" as a liveness probe.
        .route("/", get(|| async { "OK" }))
        .route("/search", post(search_handler))
        .with_state(pool)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody {
    #[serde(default)]
    query: String,
    max_results: Option<usize>,
    /// Explicit session override; normally the session is derived from the
    /// workspace hint.
    session_id: Option<String>,
}

async fn search_handler(
    State(pool): State<Pool>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> Response {
    match run_search(&pool, &headers, body).await {
        Ok(results) => Json(results).into_response(),
        // Tool errors ride a 200: the host forwards the message to the model
        // instead of treating the call as transport failure.
        Err(e) => (StatusCode::OK, format!("Error: {e}")).into_response(),
    }
}

async fn run_search(
    pool: &Pool,
    headers: &HeaderMap,
    body: SearchBody,
) -> webscout_core::Result<SearchResults> {
    let hints = env_hints(headers);
    let session_id = match body.session_id.filter(|s| !s.trim().is_empty()) {
        Some(id) => id,
        None => identity::session_id(&hints)?,
    };
    let creds = identity::model_provider_credentials(&hints);
    let client = creds.map(|c| RefineClient::new(reqwest::Client::new(), c));

    let query = body.query;
    let max_results = body.max_results.unwrap_or(10).clamp(1, 20);

    let unrefined = pool
        .with_session(&session_id, move |session| async move {
            search::search(session.context(), &query, max_results).await
        })
        .await?;

    refine::refine(client.as_ref(), unrefined).await
}

fn env_hints(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(identity::ENV_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, serde::Serialize)]
struct Doctor {
    version: &'static str,
    cache_root: String,
    session_ttl_secs: u64,
    lock_timeout_secs: u64,
    token_budget: usize,
    refine_model_override: bool,
    search_endpoint_override: bool,
}

fn doctor() -> Doctor {
    Doctor {
        version: env!("CARGO_PKG_VERSION"),
        cache_root: webscout_local::cache_root().display().to_string(),
        session_ttl_secs: webscout_local::session::SESSION_TTL.as_secs(),
        lock_timeout_secs: webscout_local::session::LOCK_TIMEOUT.as_secs(),
        token_budget: refine::MAX_RESULTS_TOKENS,
        refine_model_override: std::env::var("WEBSCOUT_REFINE_MODEL").is_ok(),
        search_endpoint_override: std::env::var("WEBSCOUT_SEARCH_ENDPOINT").is_ok(),
    }
}
