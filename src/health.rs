use crate::error::{truncate_body, UploadError};
use crate::indexer::{ElasticTarget, CONNECT_TIMEOUT};
use reqwest::Client;
use std::time::Duration;

/// Connect budget plus roughly two seconds to read the reply.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT.as_secs() + 2);

/// Single probe of the index root. Any 2xx passes; retries belong to the caller.
pub async fn check_host(client: &Client, target: &ElasticTarget) -> Result<(), UploadError> {
    let response = target
        .authorize(client.get(target.base_url().clone()))
        .timeout(HEALTH_TIMEOUT)
        .send()
        .await?;
    let status = response.status();
    if status.is_success() {
        tracing::debug!(url = %target.base_url(), %status, "index host reachable");
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(UploadError::Status {
        status: status.as_u16(),
        body: truncate_body(&body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::indexer::build_client;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use chrono::NaiveDate;

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn target(port: u16, with_auth: bool) -> ElasticTarget {
        let mut config = test_config().elastic;
        config.port = port;
        if with_auth {
            config.username = Some("elastic".to_string());
            config.password = Some("changeme".to_string());
        }
        ElasticTarget::resolve(&config, NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn healthy_host_passes_and_sends_basic_auth() {
        let app = Router::new().route(
            "/",
            get(|headers: HeaderMap| async move {
                match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                    Some(value) if value.starts_with("Basic ") => StatusCode::OK,
                    _ => StatusCode::UNAUTHORIZED,
                }
            }),
        );
        let port = serve(app).await;
        let client = build_client(Duration::from_secs(2)).unwrap();

        check_host(&client, &target(port, true)).await.unwrap();
        let err = check_host(&client, &target(port, false)).await.unwrap_err();
        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn refused_connection_is_a_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = build_client(Duration::from_secs(2)).unwrap();
        let err = check_host(&client, &target(port, false)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.status(), None);
    }
}
