//! Fluence Runner HTTP server - Runs submitted code in the sandbox engine.

use axum::{
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use fluence_runner::config::{
    apply_env_overrides, load_config, load_config_from_path, validate_config, Config, LogFormat,
};
use fluence_runner::{Engine, ExecutionResponse};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

// ---- CLI ----

#[derive(Parser)]
#[command(name = "fluence-runner", about = "Sandboxed code execution service")]
struct Args {
    /// Bind address (overrides HOST / config)
    #[arg(long)]
    bind: Option<String>,

    /// Port (overrides PORT / config)
    #[arg(long, short)]
    port: Option<u16>,

    /// Config file (json5 or toml)
    #[arg(long, short, env = "FLUENCE_CONFIG")]
    config: Option<PathBuf>,
}

// ---- App State ----

#[derive(Clone)]
struct AppState {
    engine: Engine,
}

// ---- Error Handling ----

struct AppError(fluence_runner::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            StatusCode::UNPROCESSABLE_ENTITY
        } else {
            error!("Request failed: {}", self.0);
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let body = Json(serde_json::json!({ "detail": self.0.to_string() }));
        (status, body).into_response()
    }
}

impl From<fluence_runner::Error> for AppError {
    fn from(err: fluence_runner::Error) -> Self {
        AppError(err)
    }
}

// ---- Request/Response Types ----

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    code: String,
    #[serde(default)]
    test_script: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    service: &'static str,
    version: &'static str,
}

// ---- Handlers ----

async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecutionResponse>, AppError> {
    let response = state
        .engine
        .execute_code(&request.code, request.test_script.as_deref())
        .await?;
    Ok(Json(response))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        service: fluence_runner::NAME,
        version: fluence_runner::VERSION,
    })
}

// ---- Router ----

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE])
}

fn build_router(state: AppState, config: &Config) -> Router {
    let api = Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health));

    Router::new()
        .nest("/api", api)
        .with_state(state)
        .layer(cors_layer(&config.server.allowed_origins))
}

// ---- Main ----

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log.level.clone().into());

    match config.log.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => {
            let mut config = load_config_from_path(path)?;
            apply_env_overrides(&mut config);
            config
        }
        None => load_config()?,
    };
    if let Some(bind) = args.bind {
        config.server.host = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_tracing(&config);

    let validation = validate_config(&config);
    for issue in &validation.warnings {
        warn!("Config: {}", issue);
    }
    if !validation.valid {
        for issue in &validation.errors {
            error!("Config: {}", issue);
        }
        anyhow::bail!("Invalid configuration ({} errors)", validation.errors.len());
    }

    // Fails closed when the backend cannot isolate
    let engine = Engine::from_config(&config.sandbox).await?;

    let app = build_router(AppState { engine }, &config);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("{} {} listening on http://{}", fluence_runner::NAME, fluence_runner::VERSION, addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
