//! Walkforward: walk-forward backtests of a next-day direction signal
//!
//! Usage:
//!   walkforward run --symbols BTCUSDT,ETHUSDT   Backtest from the CLI
//!   walkforward history --symbol BTCUSDT        List stored runs
//!   walkforward serve --port 3001               Launch the HTTP API

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use engine::{
    run_pipeline, BacktestReport, BinanceClient, HistoryPeriod, ModelKind, PipelineRequest,
    SymbolOutcome,
};
use persistence::repository::{BacktestRunRecord, RunRepository};
use persistence::Database;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "walkforward")]
#[command(about = "Walk-forward backtester for next-day direction models", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run walk-forward backtests from the CLI
    Run {
        /// Symbols to backtest (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,
        /// History to fetch: Nd, Nm, Ny or max
        #[arg(long, default_value = "5y")]
        period: HistoryPeriod,
        /// Classifier: gbm (alias xgb) or linear
        #[arg(long, default_value = "gbm")]
        model: ModelKind,
        /// Go long when P(up) >= threshold
        #[arg(long, default_value_t = 0.55)]
        threshold: f64,
        /// Artifact root directory (one subdirectory per symbol)
        #[arg(long, default_value = "artifacts")]
        out: PathBuf,
        /// Minimum training rows (floored at 200)
        #[arg(long, default_value_t = 400)]
        min_train: usize,
        /// Rows between predictions
        #[arg(long, default_value_t = 1)]
        step: usize,
        /// Transaction cost per unit of turnover, in basis points
        #[arg(long, default_value_t = 2.0)]
        cost_bp: f64,
        /// Evaluate walk-forward steps in parallel
        #[arg(long)]
        parallel: bool,
        /// Do not record the run in the database
        #[arg(long)]
        no_db: bool,
    },
    /// List stored backtest runs
    History {
        /// Only runs for this symbol
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Launch the HTTP API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
}

#[derive(Clone)]
struct AppState {
    binance: Arc<BinanceClient>,
    db: Arc<Database>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,walkforward=debug")
    } else {
        EnvFilter::new("info,engine=info,walkforward=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn db_path() -> String {
    std::env::var("WALKFORWARD_DB_PATH").unwrap_or_else(|_| "data/walkforward.db".to_string())
}

async fn open_db(path: &str) -> anyhow::Result<Database> {
    Database::new(path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })
}

fn binance_client() -> BinanceClient {
    match std::env::var("WALKFORWARD_BINANCE_URL") {
        Ok(url) => BinanceClient::with_base_url(&url),
        Err(_) => BinanceClient::new(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Run {
            symbols,
            period,
            model,
            threshold,
            out,
            min_train,
            step,
            cost_bp,
            parallel,
            no_db,
        } => {
            let request = PipelineRequest {
                symbols,
                period,
                model,
                threshold,
                out_dir: out,
                min_train_size: min_train,
                step_size: step,
                cost_bp,
                parallel,
            };
            cmd_run(request, no_db).await?;
        }
        Commands::History { symbol, limit } => {
            cmd_history(symbol, limit).await?;
        }
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Run command
// ============================================================================

async fn cmd_run(request: PipelineRequest, no_db: bool) -> anyhow::Result<()> {
    println!("\n=== Walkforward v{} ===", APP_VERSION);
    println!("Symbols: {}", request.symbols.join(", "));
    println!(
        "Period: {} | Model: {} | Threshold: {} | Min train: {} | Step: {} | Cost: {} bp",
        request.period,
        request.model,
        request.threshold,
        request.walk_forward_config().min_train_size,
        request.step_size,
        request.cost_bp,
    );

    let db = if no_db {
        None
    } else {
        let path = db_path();
        let db = open_db(&path).await?;
        println!("Database: {}", path);
        Some(db)
    };
    println!();

    let binance = binance_client();
    let outcomes = run_pipeline(&request, &binance, db.as_ref().map(|d| d.pool())).await;

    print_outcomes(&outcomes);

    if outcomes.iter().all(|o| o.result.is_err()) {
        anyhow::bail!("All {} backtests failed", outcomes.len());
    }
    Ok(())
}

fn fmt_metric(value: f64, scale: f64) -> String {
    if value.is_nan() {
        "n/a".to_string()
    } else {
        format!("{:.2}", value * scale)
    }
}

fn print_outcomes(outcomes: &[SymbolOutcome]) {
    println!(
        "  {:<10} {:<7} {:>7} {:>7} {:>8} {:>8} {:>8} {:>7} {:>6}  {}",
        "Symbol", "Model", "Samples", "Preds", "Sharpe", "CAGR%", "MaxDD%", "Win%", "AUC", "Artifacts"
    );
    println!("  {}", "-".repeat(100));
    for outcome in outcomes {
        match &outcome.result {
            Ok(r) => print_report(r),
            Err(e) => println!("  {:<10} FAILED: {:#}", outcome.symbol, e),
        }
    }
}

fn print_report(r: &BacktestReport) {
    println!(
        "  {:<10} {:<7} {:>7} {:>7} {:>8} {:>8} {:>8} {:>7} {:>6}  {}",
        r.symbol,
        r.model,
        r.n_samples,
        r.n_predictions,
        fmt_metric(r.metrics.sharpe, 1.0),
        fmt_metric(r.metrics.cagr, 100.0),
        fmt_metric(r.metrics.max_drawdown, 100.0),
        fmt_metric(r.metrics.win_rate, 100.0),
        fmt_metric(r.auc, 1.0),
        r.artifact_dir.display(),
    );
}

// ============================================================================
// History command
// ============================================================================

async fn cmd_history(symbol: Option<String>, limit: i64) -> anyhow::Result<()> {
    let path = db_path();
    let db = open_db(&path).await?;
    let repo = RunRepository::new(db.pool());

    let runs = match &symbol {
        Some(s) => repo.list_by_symbol(s, limit).await?,
        None => repo.list_recent(limit).await?,
    };
    let total = repo.count().await?;

    println!("\nDatabase: {} ({} runs stored)", path, total);
    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }
    print_history(&runs);
    Ok(())
}

fn print_history(runs: &[BacktestRunRecord]) {
    let opt = |v: Option<f64>, scale: f64| v.map_or("n/a".to_string(), |x| format!("{:.2}", x * scale));

    println!(
        "  {:<17} {:<16} {:<10} {:<6} {:<6} {:>6} {:>8} {:>8} {:>8} {:>6}",
        "Created", "Hash", "Symbol", "Model", "Period", "Preds", "Sharpe", "CAGR%", "MaxDD%", "AUC"
    );
    println!("  {}", "-".repeat(100));
    for r in runs {
        let created = r
            .created_at_utc()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "  {:<17} {:<16} {:<10} {:<6} {:<6} {:>6} {:>8} {:>8} {:>8} {:>6}",
            created,
            r.run_hash,
            r.symbol,
            r.model,
            r.period,
            r.n_predictions,
            opt(r.sharpe, 1.0),
            opt(r.cagr, 100.0),
            opt(r.max_drawdown, 100.0),
            opt(r.auc, 1.0),
        );
    }
}

// ============================================================================
// Serve command
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Walkforward v{} starting...", APP_VERSION);

    let path = db_path();
    let db = open_db(&path).await?;
    info!("Database initialized: {}", path);

    let state = AppState {
        binance: Arc::new(binance_client()),
        db: Arc::new(db),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/backtest", post(api_backtest))
        .route("/runs", get(api_runs))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Walkforward v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health     - Health check");
    println!("  POST /api/backtest   - Run walk-forward backtests");
    println!("  GET  /api/runs       - Stored runs (?symbol=&limit=)");
    println!("\n  Database: {}", path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "walkforward",
        "version": APP_VERSION,
    }))
}

/// POST /api/backtest: runs the pipeline to completion and returns every symbol's outcome
async fn api_backtest(
    State(state): State<AppState>,
    Json(request): Json<PipelineRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if request.symbols.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "success": false, "error": "No symbols given" })),
        ));
    }
    if let Err(e) = request.walk_forward_config().validate() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "success": false, "error": e.to_string() })),
        ));
    }

    info!(symbols = ?request.symbols, model = %request.model, "Backtest requested");
    let outcomes = run_pipeline(&request, state.binance.as_ref(), Some(state.db.pool())).await;

    let mut reports = Vec::new();
    let mut errors = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(report) => reports.push(report),
            Err(e) => errors.push(serde_json::json!({
                "symbol": outcome.symbol,
                "error": format!("{e:#}"),
            })),
        }
    }

    Ok(Json(serde_json::json!({
        "success": errors.is_empty(),
        "reports": reports,
        "errors": errors,
    })))
}

#[derive(Deserialize)]
struct RunsQuery {
    symbol: Option<String>,
    limit: Option<i64>,
}

/// GET /api/runs
async fn api_runs(
    State(state): State<AppState>,
    Query(params): Query<RunsQuery>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(20).clamp(1, 500);
    let repo = RunRepository::new(state.db.pool());

    let runs = match params.symbol.as_deref() {
        Some(symbol) => repo.list_by_symbol(symbol, limit).await,
        None => repo.list_recent(limit).await,
    };

    match runs {
        Ok(records) => Json(serde_json::json!({
            "success": true,
            "data": records,
            "limit": limit,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query runs: {}", e),
            "data": [],
        })),
    }
}
