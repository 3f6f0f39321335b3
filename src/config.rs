use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MIN_SAMPLE_INTERVAL_MS: u64 = 50;
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 250;
pub const MAX_UPLOAD_BATCH_SIZE: usize = 1000;

/// Where bulk documents are POSTed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadRoute {
    /// `POST scheme://host:port/_bulk`
    Bulk,
    /// `POST scheme://host:port/<index>/<type>`
    IndexType,
}

impl UploadRoute {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bulk" | "_bulk" => Ok(Self::Bulk),
            "type" | "index_type" => Ok(Self::IndexType),
            other => Err(anyhow!("invalid upload route {other:?} (expected bulk|type)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub index: String,
    pub index_date_suffix: bool,
    pub doc_type: Option<String>,
    pub route: UploadRoute,
}

impl ElasticConfig {
    /// Basic auth is only sent when both halves are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub min_backlog: u64,
    pub max_consecutive_failures: u32,
    pub stagnation_secs: u64,
    pub request_timeout_secs: u64,
    pub supervisor_interval_secs: u64,
    pub supervisor_max_backoff_secs: u64,
}

impl UploadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stagnation_window(&self) -> Duration {
        Duration::from_secs(self.stagnation_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor_interval_secs.max(1))
    }

    pub fn supervisor_max_backoff(&self) -> Duration {
        Duration::from_secs(self.supervisor_max_backoff_secs.max(self.supervisor_interval_secs))
    }
}

#[derive(Debug, Clone)]
pub struct SamplingConfig {
    pub interval_ms: u64,
    pub sensors_enabled: bool,
    pub gps_enabled: bool,
    pub audio_enabled: bool,
    pub audio_device: Option<PathBuf>,
    pub audio_sample_rate: u32,
    pub audio_frame_samples: usize,
}

impl SamplingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(clamp_interval_ms(self.interval_ms))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub elastic: ElasticConfig,
    pub upload: UploadConfig,
    pub sampling: SamplingConfig,
    pub queue_path: PathBuf,
    pub queue_max_entries: Option<u64>,
    pub http_bind: Option<String>,
}

/// Sampling faster than the floor burns battery for no useful resolution.
pub fn clamp_interval_ms(ms: u64) -> u64 {
    ms.max(MIN_SAMPLE_INTERVAL_MS)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SettingsOverrides {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    ssl: Option<bool>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    pass: Option<String>,
    #[serde(default)]
    index: Option<String>,
    #[serde(default)]
    index_date: Option<bool>,
    #[serde(default, rename = "type")]
    doc_type: Option<String>,
    #[serde(default)]
    sensor_interval_ms: Option<u64>,
    #[serde(default)]
    gps_enabled: Option<bool>,
    #[serde(default)]
    audio_enabled: Option<bool>,
}

fn load_settings_overrides() -> Option<SettingsOverrides> {
    let path = env_optional("SENSOR_DUMP_SETTINGS_PATH")?;
    read_settings_file(Path::new(&path))
}

fn read_settings_file(path: &Path) -> Option<SettingsOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read settings file; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse settings file; using env defaults"
            );
            None
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let mut config = Self::from_env_only()?;
        if let Some(overrides) = load_settings_overrides() {
            apply_settings_overrides(&mut config, &overrides, |key| env::var(key).is_err());
        }
        Ok(config)
    }

    fn from_env_only() -> Result<Self> {
        let host = env_string("SENSOR_DUMP_ES_HOST", Some("localhost".to_string()))?;
        let port = env_u64("SENSOR_DUMP_ES_PORT", Some(9200))?;
        let port = u16::try_from(port).context("SENSOR_DUMP_ES_PORT out of range")?;
        let ssl = env_bool("SENSOR_DUMP_ES_SSL", false)?;
        let username = env_optional("SENSOR_DUMP_ES_USERNAME");
        let password = env_optional("SENSOR_DUMP_ES_PASSWORD");
        let index = env_string("SENSOR_DUMP_ES_INDEX", Some("test_index".to_string()))?;
        let index_date_suffix = env_bool("SENSOR_DUMP_ES_INDEX_DATE_SUFFIX", false)?;
        let doc_type = match env::var("SENSOR_DUMP_ES_TYPE") {
            Ok(value) => Some(value.trim().to_string()).filter(|v| !v.is_empty()),
            Err(_) => Some("esd".to_string()),
        };
        let route = UploadRoute::parse(&env_string(
            "SENSOR_DUMP_ES_UPLOAD_ROUTE",
            Some("bulk".to_string()),
        )?)?;

        let queue_path = PathBuf::from(env_string(
            "SENSOR_DUMP_QUEUE_PATH",
            Some("./sensor-dump.sqlite3".to_string()),
        )?);
        let queue_max_entries = match env_optional("SENSOR_DUMP_QUEUE_MAX_ENTRIES") {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .context("invalid SENSOR_DUMP_QUEUE_MAX_ENTRIES")?,
            ),
            None => None,
        };

        let interval_ms = env_u64(
            "SENSOR_DUMP_SAMPLE_INTERVAL_MS",
            Some(DEFAULT_SAMPLE_INTERVAL_MS),
        )?;
        let sampling = SamplingConfig {
            interval_ms: clamp_interval_ms(interval_ms),
            sensors_enabled: env_bool("SENSOR_DUMP_SENSORS_ENABLED", true)?,
            gps_enabled: env_bool("SENSOR_DUMP_GPS_ENABLED", false)?,
            audio_enabled: env_bool("SENSOR_DUMP_AUDIO_ENABLED", false)?,
            audio_device: env_optional("SENSOR_DUMP_AUDIO_DEVICE").map(PathBuf::from),
            audio_sample_rate: env_u32("SENSOR_DUMP_AUDIO_SAMPLE_RATE", 44_100)?,
            audio_frame_samples: env_u64("SENSOR_DUMP_AUDIO_FRAME_SAMPLES", Some(2048))?.max(64)
                as usize,
        };

        let upload = UploadConfig {
            batch_size: (env_u64("SENSOR_DUMP_UPLOAD_BATCH_SIZE", Some(100))? as usize)
                .clamp(1, MAX_UPLOAD_BATCH_SIZE),
            poll_interval_ms: env_u64("SENSOR_DUMP_UPLOAD_POLL_INTERVAL_MS", Some(200))?,
            min_backlog: env_u64("SENSOR_DUMP_UPLOAD_MIN_BACKLOG", Some(1))?.max(1),
            max_consecutive_failures: env_u64("SENSOR_DUMP_UPLOAD_MAX_FAILURES", Some(10))?.max(1)
                as u32,
            stagnation_secs: env_u64("SENSOR_DUMP_UPLOAD_STAGNATION_SECS", Some(5))?,
            request_timeout_secs: env_u64("SENSOR_DUMP_UPLOAD_REQUEST_TIMEOUT_SECS", Some(10))?,
            supervisor_interval_secs: env_u64("SENSOR_DUMP_SUPERVISOR_INTERVAL_SECS", Some(30))?,
            supervisor_max_backoff_secs: env_u64(
                "SENSOR_DUMP_SUPERVISOR_MAX_BACKOFF_SECS",
                Some(300),
            )?,
        };

        let http_bind = match env::var("SENSOR_DUMP_HTTP_BIND") {
            Ok(value) => Some(value.trim().to_string()).filter(|v| !v.is_empty()),
            Err(_) => Some("127.0.0.1:9102".to_string()),
        };

        Ok(Self {
            elastic: ElasticConfig {
                host,
                port,
                ssl,
                username,
                password,
                index,
                index_date_suffix,
                doc_type,
                route,
            },
            upload,
            sampling,
            queue_path,
            queue_max_entries,
            http_bind,
        })
    }
}

fn apply_settings_overrides(
    config: &mut Config,
    overrides: &SettingsOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if env_allows("SENSOR_DUMP_ES_HOST") {
        if let Some(host) = non_empty(&overrides.host) {
            config.elastic.host = host;
        }
    }
    if env_allows("SENSOR_DUMP_ES_PORT") {
        if let Some(port) = overrides.port.filter(|v| *v != 0) {
            config.elastic.port = port;
        }
    }
    if env_allows("SENSOR_DUMP_ES_SSL") {
        if let Some(ssl) = overrides.ssl {
            config.elastic.ssl = ssl;
        }
    }
    if env_allows("SENSOR_DUMP_ES_USERNAME") && overrides.user.is_some() {
        config.elastic.username = non_empty(&overrides.user);
    }
    if env_allows("SENSOR_DUMP_ES_PASSWORD") && overrides.pass.is_some() {
        config.elastic.password = non_empty(&overrides.pass);
    }
    if env_allows("SENSOR_DUMP_ES_INDEX") {
        if let Some(index) = non_empty(&overrides.index) {
            config.elastic.index = index;
        }
    }
    if env_allows("SENSOR_DUMP_ES_INDEX_DATE_SUFFIX") {
        if let Some(value) = overrides.index_date {
            config.elastic.index_date_suffix = value;
        }
    }
    if env_allows("SENSOR_DUMP_ES_TYPE") && overrides.doc_type.is_some() {
        config.elastic.doc_type = non_empty(&overrides.doc_type);
    }
    if env_allows("SENSOR_DUMP_SAMPLE_INTERVAL_MS") {
        if let Some(ms) = overrides.sensor_interval_ms {
            config.sampling.interval_ms = clamp_interval_ms(ms);
        }
    }
    if env_allows("SENSOR_DUMP_GPS_ENABLED") {
        if let Some(value) = overrides.gps_enabled {
            config.sampling.gps_enabled = value;
        }
    }
    if env_allows("SENSOR_DUMP_AUDIO_ENABLED") {
        if let Some(value) = overrides.audio_enabled {
            config.sampling.audio_enabled = value;
        }
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    let value = env_u64(key, Some(u64::from(default)))?;
    u32::try_from(value).with_context(|| format!("{key} out of range"))
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => Err(anyhow!("invalid {key}: {other:?}")),
        },
        Err(_) => Ok(default),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        elastic: ElasticConfig {
            host: "127.0.0.1".to_string(),
            port: 9200,
            ssl: false,
            username: None,
            password: None,
            index: "sensor_test".to_string(),
            index_date_suffix: false,
            doc_type: Some("esd".to_string()),
            route: UploadRoute::Bulk,
        },
        upload: UploadConfig {
            batch_size: 100,
            poll_interval_ms: 5,
            min_backlog: 1,
            max_consecutive_failures: 10,
            stagnation_secs: 5,
            request_timeout_secs: 2,
            supervisor_interval_secs: 30,
            supervisor_max_backoff_secs: 300,
        },
        sampling: SamplingConfig {
            interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            sensors_enabled: true,
            gps_enabled: false,
            audio_enabled: false,
            audio_device: None,
            audio_sample_rate: 44_100,
            audio_frame_samples: 2048,
        },
        queue_path: PathBuf::from(":memory:"),
        queue_max_entries: None,
        http_bind: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn interval_is_clamped_to_floor() {
        assert_eq!(clamp_interval_ms(10), MIN_SAMPLE_INTERVAL_MS);
        assert_eq!(clamp_interval_ms(250), 250);
    }

    #[test]
    fn upload_route_parses_known_values() {
        assert_eq!(UploadRoute::parse("bulk").unwrap(), UploadRoute::Bulk);
        assert_eq!(UploadRoute::parse(" TYPE ").unwrap(), UploadRoute::IndexType);
        assert!(UploadRoute::parse("stream").is_err());
    }

    #[test]
    fn credentials_require_both_halves() {
        let mut config = test_config();
        config.elastic.username = Some("elastic".to_string());
        assert!(config.elastic.credentials().is_none());
        config.elastic.password = Some("changeme".to_string());
        assert_eq!(config.elastic.credentials(), Some(("elastic", "changeme")));
    }

    #[test]
    fn settings_file_overrides_unless_env_set() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"host":"https://es.local","port":9243,"index":"phone","type":"","sensor_interval_ms":20,"user":"  "}"#,
        )
        .unwrap();
        let overrides = read_settings_file(&path).unwrap();

        let mut config = test_config();
        config.elastic.username = Some("keep".to_string());
        apply_settings_overrides(&mut config, &overrides, |key| key != "SENSOR_DUMP_ES_PORT");

        assert_eq!(config.elastic.host, "https://es.local");
        assert_eq!(config.elastic.port, 9200);
        assert_eq!(config.elastic.index, "phone");
        assert_eq!(config.elastic.doc_type, None);
        assert_eq!(config.elastic.username, None);
        assert_eq!(config.sampling.interval_ms, MIN_SAMPLE_INTERVAL_MS);
    }

    #[test]
    fn oversized_u32_setting_is_rejected() {
        let key = "SENSOR_DUMP_TEST_U32_RANGE";
        env::set_var(key, "4294967296");
        let err = env_u32(key, 44_100).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");

        env::set_var(key, "48000");
        assert_eq!(env_u32(key, 44_100).unwrap(), 48_000);
        env::remove_var(key);
        assert_eq!(env_u32(key, 44_100).unwrap(), 44_100);
    }

    #[test]
    fn unreadable_settings_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(read_settings_file(&path).is_none());
        assert!(read_settings_file(&dir.path().join("missing.json")).is_none());
    }
}
