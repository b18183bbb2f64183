use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use alias_relay::address::AddressTranscoder;
use alias_relay::config::RelayConfig;
use alias_relay::directory::AliasDirectory;
use alias_relay::message_id::MessageIdCipher;
use alias_relay::outbound::{Dispatcher, MailgunSender, OutboundSender};
use alias_relay::pipeline::Resolver;
use alias_relay::signature::SignatureValidator;
use alias_relay::webhook::{AppState, webhook_routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env().context("Invalid configuration")?;

    // ── Directory & crypto ──────────────────────────────────────────────
    let directory = Arc::new(
        AliasDirectory::load(&config.users_path).context("Could not load alias directory")?,
    );
    let secret = config
        .load_master_secret()
        .context("Could not load master secret")?;
    let cipher = Arc::new(
        MessageIdCipher::new(secret, config.mailer_domain.clone())
            .context("Master secret is too short")?,
    );

    let transcoder = AddressTranscoder::new(config.mailer_domain.clone(), Arc::clone(&directory));
    let resolver = Resolver::new(
        transcoder,
        cipher,
        Arc::clone(&directory),
        config.allow_outbound,
        config.default_name.clone(),
    );
    let validator = SignatureValidator::new(config.webhook_signing_key.clone())
        .with_max_age(config.webhook_max_age_secs);

    // ── Outbound ────────────────────────────────────────────────────────
    let sender: Arc<dyn OutboundSender> =
        Arc::new(MailgunSender::new(&config.mailgun, config.mailer_domain.clone()));
    let (dispatcher, dispatch_worker) = Dispatcher::spawn(sender, config.dispatch.clone());

    // ── Webhook server ──────────────────────────────────────────────────
    let state = AppState {
        validator: Arc::new(validator),
        resolver: Arc::new(resolver),
        dispatcher,
        limits: config.attachments.clone(),
        in_memory: config.no_disk,
    };
    let app = webhook_routes(state, &config.receive_endpoint);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr,
        endpoint = %config.receive_endpoint,
        domain = %config.mailer_domain,
        aliases = directory.len(),
        forwarding = config.allow_outbound,
        no_disk = config.no_disk,
        "Relay listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // The router held the last dispatcher handle; wait for queued sends.
    info!("Shutting down, draining send queue");
    dispatch_worker.await.context("Dispatcher task failed")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
