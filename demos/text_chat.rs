//! # Text Chat Demo
//!
//! A terminal client for a PairChat rendezvous server. No camera or
//! microphone is used, so every match runs text-only.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example text_chat
//!
//! # Override the server URL:
//! PAIRCHAT_URL=ws://my-server:3000/ws cargo run --example text_chat
//! ```
//!
//! Type a line to chat. Commands: `/start`, `/skip`, `/leave`, `/restart`,
//! `/quit`.

use pairchat_client::{
    Alert, NullMediaCapability, Session, SessionConfig, SessionEvent, UserPreferences, ViewState,
    WebSocketConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Default server URL when `PAIRCHAT_URL` is not set.
const DEFAULT_URL: &str = "ws://localhost:3000/ws";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("PAIRCHAT_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let interests = std::env::var("PAIRCHAT_INTERESTS").unwrap_or_default();
    tracing::info!("Connecting to {url}");

    let config = SessionConfig::new()
        .with_preferences(UserPreferences::from_interest_list(&interests))
        .with_auto_start(true);

    // ── Connect ─────────────────────────────────────────────────────
    let (mut session, mut events) =
        Session::connect(WebSocketConnector::new(url), NullMediaCapability, config);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0usize;

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };

                match event {
                    SessionEvent::Snapshot(snapshot) => {
                        let view = ViewState::from(&snapshot);
                        // The log resets on every match.
                        if view.messages.len() < printed {
                            printed = 0;
                        }
                        for bubble in view.messages.iter().skip(printed) {
                            println!("[{:?}] {}", bubble.alignment, bubble.text);
                        }
                        printed = view.messages.len();
                        tracing::debug!(status = view.status, searching = view.searching, "View updated");
                    }
                    SessionEvent::PresenceCount(count) => {
                        tracing::info!("{count} online");
                    }
                    SessionEvent::Alert(Alert::TransportFailure { reason }) => {
                        tracing::error!("Connection lost: {reason}. Type /restart to reconnect.");
                    }
                    SessionEvent::Alert(alert) => {
                        tracing::warn!("{alert:?}");
                    }
                    SessionEvent::Closed => {
                        tracing::info!("Session closed");
                        break;
                    }
                }
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let result = match line.trim() {
                    "" => Ok(()),
                    "/start" => session.start(),
                    "/skip" => session.skip(),
                    "/leave" => session.leave(),
                    "/restart" => session.restart(),
                    "/quit" => break,
                    text => session.send_chat(text),
                };
                if let Err(e) = result {
                    tracing::warn!("Command rejected: {e}");
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    session.shutdown().await;
    Ok(())
}
