use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};
use std::{fmt, sync::OnceLock};
use thiserror::Error;

static UID_PATTERN: OnceLock<Regex> = OnceLock::new();

fn uid_pattern() -> &'static Regex {
    UID_PATTERN.get_or_init(|| Regex::new(r"_uid=(\d+)").expect("uid pattern is valid"))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Location {
    pub name: String,
    pub address: String, // place name sent with geolocation sign-in
    pub longitude: f64,
    pub latitude: f64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    #[error("credential for `{0}` carries no _uid cookie")]
    MissingUid(String),
    #[error("credential renewal is not implemented")]
    RenewalNotImplemented,
}

/// A credentialed user of the attendance platform.
#[derive(Clone)]
pub struct Identity {
    display_name: String,
    credential: String,
    uid: String,
}

impl Identity {
    pub fn new(display_name: impl Into<String>, credential: impl Into<String>) -> Result<Self, IdentityError> {
        let display_name = display_name.into();
        let credential = credential.into();
        let uid = uid_pattern()
            .captures(&credential)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| IdentityError::MissingUid(display_name.clone()))?;
        Ok(Self { display_name, credential, uid })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Raw cookie string, sent verbatim in the `Cookie` header.
    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Cookies expire server-side; refreshing them needs a login flow we do not have.
    pub fn renew_credential(&self) -> Result<(), IdentityError> {
        Err(IdentityError::RenewalNotImplemented)
    }
}

// keep cookies out of logs
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("display_name", &self.display_name)
            .field("uid", &self.uid)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "raw", rename_all = "snake_case")]
pub enum SignKind {
    General,
    Location,
    QrCode,
    Unsupported(String),
}

impl SignKind {
    pub fn from_remote_name(name: &str) -> Self {
        match name.trim() {
            "签到" => SignKind::General,
            "位置签到" => SignKind::Location,
            "二维码签到" => SignKind::QrCode,
            other => SignKind::Unsupported(other.to_string()),
        }
    }
}

impl fmt::Display for SignKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignKind::General => f.write_str("general"),
            SignKind::Location => f.write_str("location"),
            SignKind::QrCode => f.write_str("qr_code"),
            SignKind::Unsupported(raw) => write!(f, "unsupported({raw})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub sign_kind: SignKind,
    pub active_id: i64,
    pub attend_count: i64,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
}

/// One submission attempt, for one user, against one activity.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Outcome {
    pub course_name: String,
    pub user: String,
    pub sign_kind: SignKind,
    pub active_id: i64,
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// --- remote wire formats ---

#[derive(Deserialize, Debug, Clone)]
pub struct ActiveListResp {
    pub result: i64,
    #[serde(default)]
    pub data: Option<ActiveListData>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ActiveListData {
    #[serde(rename = "activeList", default)]
    pub active_list: Vec<ActiveEntry>,
}

// the remote sends explicit nulls for untimed activities
#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct ActiveEntry {
    #[serde_as(as = "DefaultOnNull")]
    #[serde(rename = "nameOne", default)]
    pub name_one: String,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(rename = "attendNum", default)]
    pub attend_num: i64,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(rename = "startTime", default)]
    pub start_time: i64,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(rename = "endTime", default)]
    pub end_time: i64,
    pub id: i64,
}

impl From<ActiveEntry> for Activity {
    fn from(e: ActiveEntry) -> Self {
        Activity {
            sign_kind: SignKind::from_remote_name(&e.name_one),
            active_id: e.id,
            attend_count: e.attend_num,
            start_time_ms: e.start_time,
            end_time_ms: e.end_time,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct AttendInfoResp {
    pub result: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<AttendInfoData>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AttendInfoData {
    pub status: Option<i64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SignInResp {
    pub result: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<SignInData>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SignInData {
    pub submittime: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PublishQrReq {
    pub course_name: String,
    pub enc: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}
