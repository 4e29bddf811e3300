//! DDoS Mitigation Service
//!
//! This is the main entry point for the DDoS mitigation service.
//! It loads configuration, starts the detection loops and serves the API.

use std::sync::Arc;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};

use ddos_mitigation_service::api::{self, ApiState};
use ddos_mitigation_service::config;
use ddos_mitigation_service::core::engine::{DetectionEngine, LogMitigationSink, NoTraffic};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;

    // Initialize logging; RUST_LOG overrides the configured level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.logging.level.as_str()))
        .init();

    info!("Starting DDoS Mitigation Service...");
    let config = Arc::new(config);

    // Build the detection engine
    let (engine, report) = DetectionEngine::from_config(&config, Arc::new(LogMitigationSink));
    for (network, e) in &report.rejected {
        warn!("Ignored network {}: {}", network, e);
    }
    info!(
        "Monitoring {} networks in {} host groups",
        report.inserted,
        config.host_groups.len()
    );
    let engine = Arc::new(engine);

    // Start detection and session GC loops
    let tasks = engine.start(Arc::new(NoTraffic));

    // Create API state
    let state = web::Data::new(ApiState {
        engine: engine.clone(),
        config: config.clone(),
    });

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::config)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    for task in tasks {
        task.abort();
    }
    info!("DDoS Mitigation Service stopped");
    Ok(())
}
