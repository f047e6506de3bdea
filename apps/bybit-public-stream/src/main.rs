//! Bybit Public Stream Binary
//!
//! Connects to Bybit's public stream and follows the ticker of every
//! configured symbol, keeping a merged view per symbol.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin bybit-public-stream
//! ```
//!
//! # Environment Variables
//!
//! - `BYBIT_NETWORK`: mainnet | testnet (default: mainnet)
//! - `BYBIT_CATEGORY`: spot | linear | inverse | option (default: linear)
//! - `BYBIT_SYMBOLS`: Comma-separated symbols (default: BTCUSDT)
//! - `BYBIT_STREAM_HEARTBEAT_INTERVAL_SECS`: Ping interval (default: 20)
//! - `BYBIT_STREAM_HEARTBEAT_TIMEOUT_SECS`: Pong timeout (default: 20)
//! - `BYBIT_STREAM_RECONNECT_DELAY_INITIAL_MS`: First backoff delay (default: 500)
//! - `BYBIT_STREAM_RECONNECT_DELAY_MAX_SECS`: Backoff cap (default: 30)
//! - `BYBIT_STREAM_RECONNECT_DELAY_MULTIPLIER`: Backoff growth (default: 2.0)
//! - `BYBIT_STREAM_MAX_RECONNECT_ATTEMPTS`: 0 for unlimited (default: 0)
//! - `BYBIT_STREAM_METRICS_PORT`: Prometheus port, 0 to disable (default: 9090)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: bybit-public-stream)
//! - `RUST_LOG`: Log level (default: info)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bybit_public_stream::infrastructure::telemetry;
use bybit_public_stream::{
    FrameSink, PublicStreamClient, PublicStreamClientConfig, StreamConfig, StreamEvent, Symbol,
    TickerData, TickerKey, TickerResponse, TickerService, TopicDispatcher, Unsubscribe,
    init_metrics,
};
use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Latest merged ticker per symbol.
type TickerBook = Arc<Mutex<HashMap<Symbol, TickerData>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "failed to install rustls crypto provider")?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Bybit public stream");

    let config = StreamConfig::from_env()?;
    log_config(&config);

    if init_metrics(config.metrics_port)? {
        tracing::info!(port = config.metrics_port, "Prometheus exporter listening");
    }

    let shutdown_token = CancellationToken::new();

    // Create the connection
    let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(256);
    let client = Arc::new(PublicStreamClient::new(
        PublicStreamClientConfig::from(&config),
        event_tx,
        shutdown_token.clone(),
    ));

    // Ticker family on the shared connection
    let sink: Arc<dyn FrameSink> = Arc::clone(&client) as Arc<dyn FrameSink>;
    let tickers = Arc::new(TickerService::new(sink));
    client.register_dispatcher(Arc::clone(&tickers) as Arc<dyn TopicDispatcher>);

    tokio::spawn(handle_stream_events(event_rx));

    let run_client = Arc::clone(&client);
    let client_task = tokio::spawn(async move {
        if let Err(e) = run_client.run().await {
            tracing::error!(error = %e, "Public stream client error");
        }
    });

    let book: TickerBook = Arc::new(Mutex::new(HashMap::new()));
    let mut subscriptions: Vec<Unsubscribe<_>> = Vec::with_capacity(config.symbols.len());

    for symbol in &config.symbols {
        let book = Arc::clone(&book);
        let result = tickers
            .subscribe(
                TickerKey::new(symbol.clone()),
                move |msg: TickerResponse| -> anyhow::Result<()> {
                    apply_ticker(&book, msg);
                    Ok(())
                },
            )
            .await;

        match result {
            Ok(handle) => subscriptions.push(handle),
            Err(e) if e.is_duplicate() => {
                tracing::warn!(symbol = %symbol, "Symbol listed twice, skipping");
            }
            Err(e) => {
                // Registration is kept and sent again once connected
                tracing::warn!(symbol = %symbol, error = %e, "Subscribe deferred until connected");
            }
        }
    }

    tracing::info!(symbols = config.symbols.len(), "Bybit public stream ready");

    await_shutdown().await;

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );

    let release_all = async {
        for handle in &subscriptions {
            if let Err(e) = handle.unsubscribe().await {
                tracing::debug!(key = %handle.key(), error = %e, "Unsubscribe not delivered");
            }
        }
        for key in tickers.registry().keys() {
            let _ = tickers.unsubscribe(&key).await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, release_all)
        .await
        .is_err()
    {
        tracing::warn!("Timed out releasing subscriptions");
    }

    client.close().await;
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, client_task).await;

    let book = book.lock();
    for (symbol, ticker) in book.iter() {
        tracing::info!(symbol = %symbol, last_price = %ticker.last_price, "Final ticker");
    }

    tracing::info!("Bybit public stream stopped");
    Ok(())
}

/// Fold one ticker message into the book.
fn apply_ticker(book: &TickerBook, msg: TickerResponse) {
    let symbol = Symbol::new(msg.data.symbol.clone());
    let mut book = book.lock();

    if msg.is_snapshot() {
        book.insert(symbol.clone(), msg.data);
    } else {
        book.entry(symbol.clone())
            .or_default()
            .apply_delta(&msg.data);
    }

    if let Some(ticker) = book.get(&symbol) {
        tracing::debug!(
            symbol = %symbol,
            last_price = %ticker.last_price,
            bid = %ticker.bid1_price,
            ask = %ticker.ask1_price,
            cross_sequence = ?msg.cross_sequence,
            "Ticker updated"
        );
    }
}

/// Log events from the public stream client.
async fn handle_stream_events(mut rx: mpsc::Receiver<StreamEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Connected => {
                tracing::info!("Public stream connected");
            }
            StreamEvent::Disconnected => {
                tracing::warn!("Public stream disconnected");
            }
            StreamEvent::Reconnecting { attempt } => {
                tracing::info!(attempt, "Public stream reconnecting");
            }
            StreamEvent::OperationRejected { op, message } => {
                tracing::error!(op = %op, message = %message, "Operation rejected");
            }
            StreamEvent::DispatchFailed { family, error } => {
                tracing::warn!(family, error = %error, "Dispatch failed");
            }
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    tracing::info!(
        network = config.network.as_str(),
        category = config.category.as_str(),
        symbols = config.symbols.len(),
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(stream_url = %config.stream_url(), "WebSocket endpoint");
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
