use std::path::PathBuf;
use std::sync::Arc;

use axum::http::Method;
use bookmarks::backend::LocalBackend;
use bookmarks::config::{Cli, Command, Config, default_config_dir, default_config_path};
use bookmarks::db::Database;
use bookmarks::feed::ChangeFeed;
use bookmarks::handler::AppState;
use bookmarks::routes::routes;
use bookmarks::shell;
use clap::Parser;
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Cli::parse();
    let command = args.command.unwrap_or(Command::Serve);

    // With --config, the database lives next to the config file.
    // Otherwise both live in ~/.bookmarks/
    let (config_path, data_dir) = match args.config_path {
        Some(path) => {
            let path = PathBuf::from(path);
            let dir = path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            (path, dir)
        }
        None => (default_config_path(), default_config_dir()),
    };

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("failed to create data directory {:?}: {}", data_dir, e);
        std::process::exit(1);
    }

    match command {
        Command::Serve => {
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        Command::Shell => {
            // keep the terminal readable; logs go to stderr
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    let cfg = Config::new(&config_path.to_string_lossy()).unwrap_or_else(|e| {
        tracing::error!(error = %e, path = ?config_path, "failed to load config file");
        std::process::exit(1);
    });
    let db = Arc::new(Database::new(&cfg, &data_dir).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to setup database");
        std::process::exit(1);
    }));
    let feed = ChangeFeed::new(cfg.app.feed_capacity);

    match command {
        Command::Serve => serve(cfg, db, feed).await,
        Command::Shell => {
            let backend = LocalBackend::new(db.clone(), feed, cfg.auth);
            if let Err(e) = shell::run(backend).await {
                tracing::error!(error = %format!("{:#}", e), "shell exited with an error");
                std::process::exit(1);
            }
            if let Err(e) = db.sync().await {
                tracing::warn!(error = %e, "final sync failed");
            }
        }
    }
}

async fn serve(cfg: Config, db: Arc<Database>, feed: ChangeFeed) {
    tracing::info!("bookmarks.svc starting");

    let address = format!("0.0.0.0:{}", cfg.app.get_port());
    let cancellation_token = CancellationToken::new();
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    // Flush local writes to the primary once the server stops taking requests
    let flush_db = db.clone();
    let flush_token = cancellation_token.clone();
    let flush_done = shutdown_complete_tx.clone();
    tokio::spawn(async move {
        flush_token.cancelled().await;
        if let Err(e) = flush_db.sync().await {
            tracing::warn!(error = %e, "final sync failed");
        }
        drop(flush_done);
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = routes().layer(cors).with_state(AppState {
        db,
        feed: feed.clone(),
        auth: Arc::new(cfg.auth),
    });

    let listener = tokio::net::TcpListener::bind(&address).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to setup tcp listener");
        std::process::exit(1);
    });

    tracing::info!("bookmarks.svc running on {}", &address);
    let signal_token = cancellation_token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl+c signal received, preparing to shutdown");
            // open change streams would otherwise hold the graceful shutdown
            feed.close();
            signal_token.cancel();
        }
    });

    let shutdown = cancellation_token.clone();
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %err, "server exited with an error");
        std::process::exit(1);
    }
    cancellation_token.cancel();

    drop(shutdown_complete_tx);
    shutdown_complete_rx.recv().await;
    tracing::info!("bookmarks.svc going off, graceful shutdown complete");
}
