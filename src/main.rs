use anyhow::Result;
use sensor_dump::config::Config;
use sensor_dump::http;
use sensor_dump::service::{pcm_audio_opener, Service};
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_dump=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // `.env` may carry RUST_LOG, and settings-file warnings need a subscriber.
    dotenvy::dotenv().ok();
    init_tracing()?;
    let config = Config::from_env()?;

    let service = Arc::new(Service::new(&config, pcm_audio_opener(&config.sampling))?);
    service.start_logging().await?;

    let http_handle = match config.http_bind.as_deref() {
        Some(bind) => {
            let app = http::router(http::HttpState {
                service: service.clone(),
            });
            let listener = tokio::net::TcpListener::bind(bind).await?;
            tracing::info!(bind = %bind, "sensor-dump HTTP listening");
            Some(tokio::spawn(async move {
                axum::serve(listener, app).await.ok();
            }))
        }
        None => None,
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = async {
            match http_handle {
                Some(handle) => { let _ = handle.await; }
                None => std::future::pending::<()>().await,
            }
        } => {
            tracing::warn!("HTTP server exited");
        }
    }

    service.stop_logging().await?;
    service.shutdown().await;
    Ok(())
}
