//! # wsgate
//!
//! Gateway binary: loads settings, registers the built-in handlers for each
//! configured tenant, issues the requested token grants and serves until
//! Ctrl-C.

#![deny(unsafe_code)]

mod handlers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use wsgate_logging::LogFormat;
use wsgate_server::{
    ConnectionRouter, HandlerRegistry, ShutdownCoordinator, TOKEN_PARAM, TokenRegistry, UserId,
};
use wsgate_settings::GatewaySettings;

/// Multi-tenant WebSocket gateway.
#[derive(Parser, Debug)]
#[command(name = "wsgate", about = "Token-authenticated multi-tenant WebSocket gateway")]
struct Cli {
    /// Settings file (defaults to `~/.wsgate/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Issue a token for `tenant:user` at startup. Repeatable.
    #[arg(long = "grant", value_name = "TENANT:USER", value_parser = parse_grant)]
    grants: Vec<(String, UserId)>,
}

impl Cli {
    fn apply_overrides(&self, settings: &mut GatewaySettings) {
        if let Some(ref host) = self.host {
            settings.server.bind_address.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
    }
}

fn parse_grant(raw: &str) -> Result<(String, UserId), String> {
    match raw.split_once(':') {
        Some((tenant, user)) if !tenant.is_empty() && !user.is_empty() => {
            Ok((tenant.to_owned(), UserId::new(user)))
        }
        _ => Err(format!("expected TENANT:USER, got `{raw}`")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(wsgate_settings::settings_path);
    let mut settings = wsgate_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply_overrides(&mut settings);

    wsgate_logging::init_subscriber(
        &settings.logging.level,
        LogFormat::from_json_flag(settings.logging.json),
    );

    let tokens = Arc::new(TokenRegistry::new());
    let registry = HandlerRegistry::new();
    handlers::register_builtin(&registry, &settings.tenants);

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let router = Arc::new(ConnectionRouter::new(
        Arc::clone(&tokens),
        Arc::new(registry),
        settings.server.max_message_size,
        Arc::clone(&shutdown),
    )
    .with_outbound_limit(settings.server.max_outbound_bytes));

    let gateway = wsgate_server::bind(&settings, router)
        .await
        .context("Failed to start gateway")?;
    let addr = gateway.local_addr();
    let scheme = gateway.scheme();

    for (tenant, user) in &args.grants {
        let token = tokens.get_token(tenant, user);
        tracing::info!(%tenant, %user, "token granted, connect to {scheme}://{addr}/{tenant}/<handler>");
        println!("{tenant}\t{user}\t{TOKEN_PARAM}={}", token.as_str());
    }

    tracing::info!(
        tenants = ?settings.tenants,
        max_message_size = settings.server.max_message_size,
        "wsgate listening on {scheme}://{addr}"
    );

    let listener_shutdown = shutdown.token();
    let server = tokio::spawn(gateway.serve(listener_shutdown));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let timeout = Duration::from_secs(settings.server.shutdown_timeout_secs);
    let drained = shutdown.graceful_shutdown(Some(timeout)).await;
    match tokio::time::timeout(timeout, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => tracing::warn!(error = %err, "listener stopped with error"),
        Ok(Err(err)) => tracing::warn!(error = %err, "listener task failed"),
        Err(_) => tracing::warn!("listener did not stop in time, exiting anyway"),
    }

    if drained {
        tracing::info!("Shutdown complete");
    } else {
        tracing::warn!("Shutdown complete, some connections were dropped");
    }
    Ok(())
}
