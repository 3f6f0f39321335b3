//! Wire protocol for the remote search index: URLs, the geo-point mapping and bulk NDJSON.

use crate::config::{ElasticConfig, UploadRoute};
use crate::error::{truncate_body, UploadError};
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const ALREADY_EXISTS: &str = "resource_already_exists_exception";

/// Resolved destination for one upload session.
#[derive(Debug, Clone)]
pub struct ElasticTarget {
    base: Url,
    index: String,
    doc_type: Option<String>,
    route: UploadRoute,
    credentials: Option<(String, String)>,
}

impl ElasticTarget {
    /// `today` feeds the optional `-YYYYMMDD` index suffix; it is fixed for the whole session.
    pub fn resolve(config: &ElasticConfig, today: NaiveDate) -> Result<Self, UploadError> {
        let host = config.host.trim().trim_end_matches('/');
        if host.is_empty() {
            return Err(UploadError::InvalidUrl("empty host".to_string()));
        }
        let raw = if host.contains("://") {
            host.to_string()
        } else {
            let scheme = if config.ssl { "https" } else { "http" };
            format!("{scheme}://{host}")
        };
        let mut base = Url::parse(&raw)?;
        if base.cannot_be_a_base() {
            return Err(UploadError::InvalidUrl(raw));
        }
        base.set_port(Some(config.port))
            .map_err(|_| UploadError::InvalidUrl(raw.clone()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let index = if config.index_date_suffix {
            format!("{}-{}", config.index, today.format("%Y%m%d"))
        } else {
            config.index.clone()
        };
        if index.trim().is_empty() {
            return Err(UploadError::InvalidUrl("empty index name".to_string()));
        }

        Ok(Self {
            base,
            index,
            doc_type: config.doc_type.clone(),
            route: config.route,
            credentials: config
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.doc_type.as_deref()
    }

    pub fn mapping_url(&self) -> Result<Url, UploadError> {
        Ok(self.base.join(&self.index)?)
    }

    pub fn bulk_url(&self) -> Result<Url, UploadError> {
        let path = match (self.route, self.doc_type.as_deref()) {
            (UploadRoute::Bulk, _) => "_bulk".to_string(),
            (UploadRoute::IndexType, Some(doc_type)) => format!("{}/{doc_type}", self.index),
            (UploadRoute::IndexType, None) => format!("{}/_bulk", self.index),
        };
        Ok(self.base.join(&path)?)
    }

    pub(crate) fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }
}

pub fn build_client(request_timeout: Duration) -> Result<Client, UploadError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .build()
        .map_err(|err| UploadError::Transport(err.to_string()))
}

/// Declares the two geo-point fields; everything else is left to dynamic mapping.
pub fn mapping_body() -> Value {
    json!({
        "mappings": {
            "properties": {
                "location": { "type": "geo_point" },
                "start_location": { "type": "geo_point" }
            }
        }
    })
}

/// One action line and one source line per payload, every line newline-terminated.
pub fn build_bulk_body<'a, I>(index: &str, doc_type: Option<&str>, payloads: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let action = match doc_type {
        Some(doc_type) => json!({ "index": { "_index": index, "_type": doc_type } }),
        None => json!({ "index": { "_index": index } }),
    }
    .to_string();

    let mut body = String::new();
    for payload in payloads {
        body.push_str(&action);
        body.push('\n');
        body.push_str(payload.trim_end());
        body.push('\n');
    }
    body
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOutcome {
    Created,
    AlreadyExists,
}

pub async fn put_mapping(
    client: &Client,
    target: &ElasticTarget,
) -> Result<MappingOutcome, UploadError> {
    let url = target.mapping_url()?;
    let response = target
        .authorize(client.put(url).json(&mapping_body()))
        .send()
        .await?;
    let status = response.status();
    if status.is_success() {
        return Ok(MappingOutcome::Created);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::BAD_REQUEST && body.contains(ALREADY_EXISTS) {
        return Ok(MappingOutcome::AlreadyExists);
    }
    Err(UploadError::Status {
        status: status.as_u16(),
        body: truncate_body(&body),
    })
}

/// Per-item result summary from a 2xx bulk response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub errors: bool,
    pub rejected_items: usize,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

fn summarize_bulk_response(raw: &str) -> BulkSummary {
    let Ok(parsed) = serde_json::from_str::<BulkResponse>(raw) else {
        return BulkSummary::default();
    };
    let rejected_items = parsed
        .items
        .iter()
        .filter(|item| {
            item.as_object()
                .and_then(|obj| obj.values().next())
                .map(|action| action.get("error").is_some())
                .unwrap_or(false)
        })
        .count();
    BulkSummary {
        errors: parsed.errors,
        rejected_items,
    }
}

pub async fn post_bulk(
    client: &Client,
    target: &ElasticTarget,
    body: String,
) -> Result<BulkSummary, UploadError> {
    let url = target.bulk_url()?;
    let response = target
        .authorize(
            client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                .body(body),
        )
        .send()
        .await?;
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(UploadError::Status {
            status: status.as_u16(),
            body: truncate_body(&text),
        });
    }
    Ok(summarize_bulk_response(&text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2017, 8, 14).unwrap()
    }

    #[test]
    fn resolve_picks_scheme_from_ssl_or_host() {
        let mut config = test_config().elastic;
        let target = ElasticTarget::resolve(&config, day()).unwrap();
        assert_eq!(target.base_url().as_str(), "http://127.0.0.1:9200/");

        config.ssl = true;
        config.host = "es.example.com".to_string();
        config.port = 9243;
        let target = ElasticTarget::resolve(&config, day()).unwrap();
        assert_eq!(target.base_url().as_str(), "https://es.example.com:9243/");

        config.ssl = false;
        config.host = "https://cloud.example.com/es/".to_string();
        let target = ElasticTarget::resolve(&config, day()).unwrap();
        assert_eq!(target.mapping_url().unwrap().as_str(), "https://cloud.example.com:9243/es/sensor_test");
    }

    #[test]
    fn resolve_rejects_empty_host() {
        let mut config = test_config().elastic;
        config.host = "  ".to_string();
        assert!(matches!(
            ElasticTarget::resolve(&config, day()),
            Err(UploadError::InvalidUrl(_))
        ));
    }

    #[test]
    fn date_suffix_uses_session_day() {
        let mut config = test_config().elastic;
        config.index_date_suffix = true;
        let target = ElasticTarget::resolve(&config, day()).unwrap();
        assert_eq!(target.index(), "sensor_test-20170814");
        assert_eq!(
            target.mapping_url().unwrap().as_str(),
            "http://127.0.0.1:9200/sensor_test-20170814"
        );
    }

    #[test]
    fn bulk_url_follows_route() {
        let mut config = test_config().elastic;
        let target = ElasticTarget::resolve(&config, day()).unwrap();
        assert_eq!(target.bulk_url().unwrap().as_str(), "http://127.0.0.1:9200/_bulk");

        config.route = UploadRoute::IndexType;
        let target = ElasticTarget::resolve(&config, day()).unwrap();
        assert_eq!(target.bulk_url().unwrap().as_str(), "http://127.0.0.1:9200/sensor_test/esd");

        config.doc_type = None;
        let target = ElasticTarget::resolve(&config, day()).unwrap();
        assert_eq!(
            target.bulk_url().unwrap().as_str(),
            "http://127.0.0.1:9200/sensor_test/_bulk"
        );
    }

    #[test]
    fn bulk_body_pairs_action_and_source_lines() {
        let body = build_bulk_body("idx", Some("esd"), ["{\"a\":1}", "{\"b\":2}\n"]);
        assert_eq!(
            body,
            "{\"index\":{\"_index\":\"idx\",\"_type\":\"esd\"}}\n{\"a\":1}\n\
             {\"index\":{\"_index\":\"idx\",\"_type\":\"esd\"}}\n{\"b\":2}\n"
        );
        let typeless = build_bulk_body("idx", None, ["{}"]);
        assert_eq!(typeless, "{\"index\":{\"_index\":\"idx\"}}\n{}\n");
        assert_eq!(build_bulk_body("idx", None, std::iter::empty()), "");
    }

    #[test]
    fn mapping_declares_both_geo_points() {
        let body = mapping_body();
        let props = &body["mappings"]["properties"];
        assert_eq!(props["location"]["type"], "geo_point");
        assert_eq!(props["start_location"]["type"], "geo_point");
    }

    #[test]
    fn bulk_summary_counts_rejected_items() {
        let raw = r#"{"took":3,"errors":true,"items":[
            {"index":{"status":201}},
            {"index":{"status":400,"error":{"type":"mapper_parsing_exception"}}}
        ]}"#;
        assert_eq!(
            summarize_bulk_response(raw),
            BulkSummary {
                errors: true,
                rejected_items: 1
            }
        );
        assert_eq!(summarize_bulk_response("not json"), BulkSummary::default());
    }
}
