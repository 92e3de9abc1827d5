//! `Contrimeter` store server -- in-memory document store with live queries.
//!
//! An axum server exposing the document store over WebSocket (`/ws`) and
//! the video-call token endpoint (`POST /api/livekit/token`).
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9100
//! cargo run --bin contrimeter-store
//!
//! # Run on custom address with call credentials from the environment
//! LIVEKIT_API_KEY=... LIVEKIT_API_SECRET=... LIVEKIT_URL=wss://... \
//!     cargo run --bin contrimeter-store -- --bind 127.0.0.1:8080
//! ```

use std::sync::Arc;

use clap::Parser;
use contrimeter_store::config::{StoreCliArgs, StoreConfig};
use contrimeter_store::database::Database;
use contrimeter_store::server::{self, ServerState};
use contrimeter_store::token::TokenMinter;

#[tokio::main]
async fn main() {
    let cli = StoreCliArgs::parse();

    let config = match StoreConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if config.call.is_none() {
        tracing::warn!("call credentials not configured, token requests will fail");
    }
    tracing::info!(addr = %config.bind_addr, "starting contrimeter store server");

    let minter = TokenMinter::new(config.call.clone()).with_ttl(config.token_ttl);
    let state = Arc::new(
        ServerState::new(Arc::new(Database::new()), minter)
            .with_max_frame_size(config.max_frame_size),
    );

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "store server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "store server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start store server");
            std::process::exit(1);
        }
    }
}
