use std::path::Path;
use std::sync::Arc;

use switchboard::config::AppConfig;
use switchboard::gateway::{ProviderClient, SmsGateway, VoiceGateway};
use switchboard::http::{AppState, build_router};
use switchboard::sms::escalation;
use switchboard::store::Store;
use switchboard::voice::TokenSigner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env()?;

    let store = Arc::new(Store::open(Path::new(&config.db_path)).await?);

    let provider = Arc::new(ProviderClient::new(&config.provider)?);
    let sms_gateway: Arc<dyn SmsGateway> = provider.clone();
    let voice_gateway: Arc<dyn VoiceGateway> = provider;

    let state = AppState::new(
        Arc::clone(&store),
        Arc::clone(&sms_gateway),
        voice_gateway,
        TokenSigner::new(config.signing_secret.clone()),
        config.voice_webhook_base.clone(),
        config.notifications_from.clone(),
    );

    escalation::spawn_sweep_task(store, sms_gateway, config.escalation_sweep_interval_secs);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Webhook server listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
