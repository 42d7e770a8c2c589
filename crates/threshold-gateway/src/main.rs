//! `threshold`: operator CLI and local HTTP gateway for the navigation mesh.
//!
//! ```text
//! threshold test-offline [hours]   simulate a disconnected window (default 1h)
//! threshold gate-status            posture of every registered cell
//! threshold gate-release <cell>    lift a lockdown
//! threshold sync-force             prune, sync and replay now
//! threshold route-check <t>        route table and recent nav logs (wealth | info | myth)
//! threshold dashboard              mesh gauges (default)
//! threshold serve                  HTTP gateway on 127.0.0.1:{gateway_port}
//! ```

mod routes;

use serde::Serialize;
use std::sync::Arc;
use threshold_core::{MeshConfig, MeshContext, Threshold};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[THRESHOLD] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let sub = args.get(1).map(|s| s.as_str()).unwrap_or("dashboard");

    if matches!(sub, "--help" | "-h" | "help") {
        print_help();
        return;
    }

    if let Err(e) = run(sub, &args[args.len().min(2)..]).await {
        eprintln!("threshold {}: {}", sub, e);
        std::process::exit(1);
    }
}

async fn run(sub: &str, rest: &[String]) -> Result<(), String> {
    let config = MeshConfig::load().map_err(|e| format!("Config: {}", e))?;
    let mesh = MeshContext::open(config).map_err(|e| format!("Mesh: {}", e))?;

    match sub {
        "test-offline" => {
            let hours = match rest.first() {
                Some(h) => h.parse::<f64>().map_err(|_| format!("invalid hours '{}'", h))?,
                None => 1.0,
            };
            print_json(&mesh.test_offline(hours).await.map_err(|e| e.to_string())?)
        }
        "gate-status" => print_json(&mesh.gate_status()),
        "gate-release" => {
            let cell = rest.first().ok_or("usage: threshold gate-release <cell>")?;
            mesh.gate().release_lockdown(cell).map_err(|e| e.to_string())?;
            print_json(&mesh.gate_status())
        }
        "sync-force" => print_json(&mesh.sync_force().await.map_err(|e| e.to_string())?),
        "route-check" => {
            let threshold: Threshold = rest
                .first()
                .ok_or("usage: threshold route-check <wealth|info|myth>")?
                .parse()
                .map_err(|e: threshold_core::MeshError| e.to_string())?;
            print_json(&mesh.route_check(threshold).map_err(|e| e.to_string())?)
        }
        "dashboard" | "status" => print_json(&mesh.dashboard().map_err(|e| e.to_string())?),
        "serve" => serve(mesh).await,
        other => Err(format!("unknown subcommand '{}'. Use: threshold --help", other)),
    }
}

async fn serve(mesh: MeshContext) -> Result<(), String> {
    let addr = format!("127.0.0.1:{}", mesh.config().gateway_port);
    let app = routes::router(routes::AppState { mesh: Arc::new(mesh) });

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("bind {}: {}", addr, e))?;
    tracing::info!(addr = %addr, "[GATEWAY] threshold mesh listening");

    tokio::select! {
        result = axum::serve(listener, app) => result.map_err(|e| e.to_string()),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("[GATEWAY] shutdown requested");
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let out = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", out);
    Ok(())
}

fn print_help() {
    println!("threshold v{}", VERSION);
    println!();
    println!("Usage: threshold [COMMAND]");
    println!();
    println!("Commands:");
    println!("  test-offline [hours]  Simulate an offline window and report the fallback path");
    println!("  gate-status           Posture, anomalies and severity per cell");
    println!("  gate-release <cell>   Release a locked cell");
    println!("  sync-force            Prune expired cache, sync pending entries, replay queued requests");
    println!("  route-check <t>       Route availability for wealth | info | myth");
    println!("  dashboard             Mesh gauges (default)");
    println!("  serve                 Run the HTTP gateway");
    println!("  help                  Print this help message");
    println!();
    println!("Configure via THRESHOLD_CONFIG (default config/threshold.toml) or THRESHOLD__* env vars.");
}
