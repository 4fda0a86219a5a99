use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::{fs, path::Path, time::Duration};
use thiserror::Error;

use crate::models::IdentityError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 12; Pixel 6) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/104.0.0.0 Mobile Safari/537.36 com.chaoxing.mobile/ChaoXingStudy_3_5.1.4_android_phone_614_74";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("invalid config {origin}: {reason}")]
    Parse { origin: String, reason: String },
    #[error("course `{course}` references unknown user `{alias}`")]
    UnknownUser { course: String, alias: String },
    #[error("course `{course}` references unknown location `{alias}`")]
    UnknownLocation { course: String, alias: String },
    #[error("course `{0}` is declared more than once")]
    DuplicateCourse(String),
    #[error("user `{0}` is declared more than once")]
    DuplicateUser(String),
    #[error("location `{0}` is declared more than once")]
    DuplicateLocation(String),
    #[error("course `{course}` lists user `{alias}` more than once")]
    RepeatedCourseUser { course: String, alias: String },
    #[error("course `{0}` has no users")]
    NoUsers(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub course: CourseDefaults,
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub locations: Vec<LocationEntry>,
    #[serde(default)]
    pub courses: Vec<CourseEntry>,
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
    pub allow_origins: Vec<String>,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "request_timeout_secs")]
    pub request_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8081,
            allow_origins: vec!["*".into()],
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RemoteSettings {
    pub base_url: String,
    pub user_agent: String,
    pub fid: i64, // school id sent with stuSignajax
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "list_timeout_secs")]
    pub list_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "status_timeout_secs")]
    pub status_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "submit_timeout_secs")]
    pub submit_timeout: Duration,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: "https://mobilelearn.chaoxing.com".into(),
            user_agent: DEFAULT_USER_AGENT.into(),
            fid: 1731,
            list_timeout: Duration::from_secs(15),
            status_timeout: Duration::from_secs(5),
            submit_timeout: Duration::from_secs(10),
        }
    }
}

/// Cadence shared by every course that does not override it.
#[serde_as]
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CourseDefaults {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "interval_seconds")]
    pub interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "delay_seconds")]
    pub delay: Duration,
}

impl Default for CourseDefaults {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30), delay: Duration::from_secs(5) }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct UserEntry {
    pub alias: String,
    pub cookie: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LocationEntry {
    pub alias: String,
    pub address: String,
    pub longitude: f64,
    pub latitude: f64,
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct CourseEntry {
    pub alias: String,
    pub users: Vec<String>,
    pub location: String,
    pub course_id: i64,
    pub class_id: i64,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default, rename = "interval_seconds")]
    pub interval: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default, rename = "delay_seconds")]
    pub delay: Option<Duration>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let origin = path.display().to_string();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|e| ConfigError::Parse { origin, reason: e.to_string() }),
            Some("toml") => toml::from_str(&contents)
                .map_err(|e| ConfigError::Parse { origin, reason: e.to_string() }),
            _ => Self::parse_from_str(&contents, &origin),
        }
    }

    /// TOML first, then JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| ConfigError::Parse {
                origin: origin.to_string(),
                reason: format!("toml error: {toml_err}; json error: {json_err}"),
            })
        })
    }
}

impl CourseEntry {
    pub fn poll_interval(&self, defaults: &CourseDefaults) -> Duration {
        self.interval.unwrap_or(defaults.interval)
    }

    pub fn submit_delay(&self, defaults: &CourseDefaults) -> Duration {
        self.delay.unwrap_or(defaults.delay)
    }
}
