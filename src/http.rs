use crate::service::Service;
use crate::sources::{BatteryLevel, GpsFix, SensorEvent};
use crate::stats::StatusSnapshot;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct HttpState {
    pub service: Arc<Service>,
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct IntervalRequest {
    interval_ms: u64,
}

#[derive(Debug, Deserialize)]
struct SensorRequest {
    sensor_type: String,
    values: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    accepted: bool,
}

type HttpResult<T> = Result<Json<T>, (StatusCode, String)>;

fn unavailable(err: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusSnapshot> {
    Json(state.service.status())
}

async fn post_logging(
    State(state): State<HttpState>,
    Json(payload): Json<ToggleRequest>,
) -> HttpResult<StatusSnapshot> {
    if payload.enabled {
        state.service.start_logging().await.map_err(unavailable)?;
    } else {
        state.service.stop_logging().await.map_err(unavailable)?;
    }
    Ok(Json(state.service.status()))
}

async fn post_gps(
    State(state): State<HttpState>,
    Json(payload): Json<ToggleRequest>,
) -> HttpResult<StatusSnapshot> {
    state
        .service
        .set_gps(payload.enabled)
        .await
        .map_err(unavailable)?;
    Ok(Json(state.service.status()))
}

async fn post_audio(
    State(state): State<HttpState>,
    Json(payload): Json<ToggleRequest>,
) -> HttpResult<StatusSnapshot> {
    state
        .service
        .set_audio(payload.enabled)
        .await
        .map_err(unavailable)?;
    Ok(Json(state.service.status()))
}

async fn post_interval(
    State(state): State<HttpState>,
    Json(payload): Json<IntervalRequest>,
) -> HttpResult<StatusSnapshot> {
    state
        .service
        .set_interval(Duration::from_millis(payload.interval_ms))
        .await
        .map_err(unavailable)?;
    Ok(Json(state.service.status()))
}

async fn post_upload(State(state): State<HttpState>) -> StatusCode {
    state.service.trigger_upload();
    StatusCode::ACCEPTED
}

async fn post_sensor(
    State(state): State<HttpState>,
    Json(payload): Json<SensorRequest>,
) -> Json<AcceptedResponse> {
    let event = SensorEvent::now(payload.sensor_type, payload.values);
    Json(AcceptedResponse {
        accepted: state.service.sources().sensor(event),
    })
}

async fn post_gps_fix(
    State(state): State<HttpState>,
    Json(payload): Json<GpsFix>,
) -> Json<AcceptedResponse> {
    Json(AcceptedResponse {
        accepted: state.service.sources().gps(payload),
    })
}

async fn post_battery(
    State(state): State<HttpState>,
    Json(payload): Json<BatteryLevel>,
) -> Json<AcceptedResponse> {
    Json(AcceptedResponse {
        accepted: state.service.sources().battery(payload),
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/logging", post(post_logging))
        .route("/v1/gps", post(post_gps))
        .route("/v1/audio", post(post_audio))
        .route("/v1/interval", post(post_interval))
        .route("/v1/upload", post(post_upload))
        .route("/v1/readings/sensor", post(post_sensor))
        .route("/v1/readings/gps", post(post_gps_fix))
        .route("/v1/readings/battery", post(post_battery))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use serde_json::{json, Value};

    async fn serve(service: Arc<Service>) -> String {
        let app = router(HttpState { service });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn control_and_ingress_routes_drive_the_service() {
        let service = Arc::new(Service::new(&test_config(), None).unwrap());
        let base = serve(service.clone()).await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{base}/healthz")).send().await.unwrap();
        assert_eq!(health.text().await.unwrap(), "ok");

        let status: Value = client
            .post(format!("{base}/v1/logging"))
            .json(&json!({ "enabled": true }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["logging"], true);

        let accepted: Value = client
            .post(format!("{base}/v1/readings/sensor"))
            .json(&json!({ "sensor_type": "android.sensor.pressure", "values": [1013.25] }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(accepted["accepted"], true);

        for _ in 0..200 {
            if service.status().sensor_readings == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status: Value = client
            .get(format!("{base}/v1/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["sensorReadings"], 1);
        assert_eq!(status["queueDepth"], 1);

        let bad = client
            .post(format!("{base}/v1/interval"))
            .json(&json!({ "interval": 10 }))
            .send()
            .await
            .unwrap();
        assert!(bad.status().is_client_error());

        let upload = client.post(format!("{base}/v1/upload")).send().await.unwrap();
        assert_eq!(upload.status(), reqwest::StatusCode::ACCEPTED);

        service.shutdown().await;
    }
}
