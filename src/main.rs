use axum::{routing::get, Router};
use dotenvy::dotenv;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ticketserver::classifier::TicketClassifier;
use ticketserver::config::AppConfig;
use ticketserver::jobs::{self, bulk};
use ticketserver::llm::rate_limiter::{FixedWindowLimiter, RedisCounterStore, WINDOW};
use ticketserver::llm::OpenAiClient;
use ticketserver::shared::state::AppState;
use ticketserver::shared::utils::{create_conn, run_migrations};
use ticketserver::stats;
use ticketserver::tickets;

fn print_usage() {
    println!("Usage: ticketserver [COMMAND]");
    println!();
    println!("Commands:");
    println!("  (none)          Run the API server and classification worker");
    println!("  bulk-classify   Dispatch classification jobs for existing tickets");
    println!("      --status=STATUS     Filter by status (open, closed, pending)");
    println!("      --unclassified      Only classify tickets without a category");
    println!("      --limit=N           Maximum number of tickets to classify (default 50)");
    println!("      --preserve-manual   Preserve manually set categories");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "bulk-classify" => return bulk::run(&args[2..]).await,
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            command => {
                eprintln!("Unknown command: {command}");
                eprintln!("Run 'ticketserver --help' for usage information");
                anyhow::bail!("Unknown command: {command}");
            }
        }
    }

    let config = AppConfig::from_env()?;

    let pool = create_conn(&config.database_url)?;
    run_migrations(&pool).map_err(|e| anyhow::anyhow!("{e}"))?;

    let cache = Arc::new(redis::Client::open(config.cache_url.as_str())?);

    let provider = Arc::new(OpenAiClient::new(&config.openai)?);
    let limiter = FixedWindowLimiter::new(
        Arc::new(RedisCounterStore::new(Arc::clone(&cache))),
        config.classify.rate_limit_per_minute,
        WINDOW,
    );
    let classifier = Arc::new(TicketClassifier::new(
        provider,
        limiter,
        config.classify.enabled,
    ));

    jobs::start_classify_worker(pool.clone(), Arc::clone(&cache), classifier);

    let state = Arc::new(AppState { conn: pool, cache });

    let app = Router::new()
        .merge(tickets::configure_tickets_routes())
        .route("/api/stats", get(stats::get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("ticketserver listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
