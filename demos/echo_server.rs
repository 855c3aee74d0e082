//! Echo server.
//!
//! Demonstrates:
//! - Building an Engine with the default JSON codec
//! - Handling Accepted / Message / Closed events
//! - Replying from the handler and broadcasting from outside it
//! - Graceful shutdown on Ctrl+C
//!
//! Every inbound message is answered with `{"hello":"hello world!"}` and
//! echoed back; every 10 seconds all sessions receive a heartbeat.
//!
//! Usage:
//!   cargo run --example echo_server
//!   cargo run --example echo_server -- --debug
//!   cargo run --example echo_server -- --port 9000

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use wsengine::{Engine, Envelope, JsonCodec, SessionEvent};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_PORT: u16 = 10086;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Args
// ============================================================================

#[derive(Debug, Clone)]
struct Args {
    debug: bool,
    port: u16,
}

impl Args {
    fn parse() -> anyhow::Result<Self> {
        let args: Vec<String> = std::env::args().collect();

        let port = match args.iter().position(|a| a == "--port") {
            Some(index) => args
                .get(index + 1)
                .context("--port needs a value")?
                .parse()
                .context("--port must be a number")?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            debug: args.iter().any(|a| a == "--debug"),
            port,
        })
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse()?;
    init_logging(args.debug);

    let engine = Engine::builder()
        .serv_id("echo-10086")
        .addr("127.0.0.1")
        .port(args.port)
        .handler(on_event)
        .build()?;

    engine.start().await.context("failed to start engine")?;
    println!("Listening on ws://127.0.0.1:{}/ws", engine.port());
    println!("Press Ctrl+C to exit...");

    let heartbeat = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(HEARTBEAT_INTERVAL);
            let mut n = 0u64;
            loop {
                ticks.tick().await;
                n += 1;
                engine.broadcast(&json!({"heartbeat": n}));
            }
        })
    };

    tokio::signal::ctrl_c().await?;

    heartbeat.abort();
    engine.stop().await;
    println!("Stopped");

    Ok(())
}

// ============================================================================
// Handler
// ============================================================================

fn on_event(envelope: Envelope<JsonCodec>) {
    let session = &envelope.session;

    match envelope.event {
        SessionEvent::Accepted => {
            println!("[{}] accepted from {}", session.id(), session.remote_ip());
        }
        SessionEvent::Message(value) => {
            println!("[{}] message: {value}", session.id());
            session.send(json!({"hello": "hello world!"}));
            session.send(value);
        }
        SessionEvent::Closed { code } => {
            println!("[{}] closed ({code})", session.id());
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

fn init_logging(debug: bool) {
    let filter = if debug { "wsengine=debug" } else { "wsengine=info" };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}
