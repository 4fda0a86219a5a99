// Remote attendance service calls; listing and status failures degrade to "nothing this cycle"

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::COOKIE;
use std::time::Duration;
use thiserror::Error;

use crate::{
    config::RemoteSettings,
    models::{ActiveListResp, Activity, AttendInfoResp, Identity, Location, SignInResp},
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Rejected(String),
}

#[async_trait]
pub trait ActivityApi: Send + Sync {
    /// Activities still open for `identity` that it has not attended yet.
    async fn list_open_activities(&self, identity: &Identity, course_id: i64, class_id: i64) -> Vec<Activity>;

    async fn check_unsigned(&self, identity: &Identity, active_id: i64) -> bool;

    async fn submit_general(&self, identity: &Identity, active_id: i64) -> Result<String, ClientError>;

    async fn submit_location(
        &self,
        identity: &Identity,
        active_id: i64,
        location: &Location,
    ) -> Result<String, ClientError>;

    async fn submit_qr_code(&self, identity: &Identity, active_id: i64, encoding: &str) -> Result<String, ClientError>;
}

#[derive(Debug, Clone)]
pub struct ChaoxingClient {
    http: reqwest::Client,
    settings: RemoteSettings,
}

impl ChaoxingClient {
    pub fn new(settings: RemoteSettings) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()?;
        Ok(Self { http, settings })
    }

    fn get(&self, path: &str, identity: &Identity, timeout: Duration) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.settings.base_url.trim_end_matches('/'), path);
        self.http
            .get(url)
            .header(COOKIE, identity.credential())
            .timeout(timeout)
    }

    async fn fetch_active_list(
        &self,
        identity: &Identity,
        course_id: i64,
        class_id: i64,
    ) -> Result<Vec<Activity>, ClientError> {
        let body = self
            .get("/v2/apis/active/student/activelist", identity, self.settings.list_timeout)
            .query(&[
                ("fid", "0".to_string()),
                ("courseId", course_id.to_string()),
                ("classId", class_id.to_string()),
                ("_", Utc::now().timestamp_millis().to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let resp: ActiveListResp = serde_json::from_str(&body)?;
        if resp.result != 1 {
            return Err(ClientError::Rejected(format!("activelist returned result {}", resp.result)));
        }
        Ok(resp
            .data
            .map(|d| d.active_list)
            .unwrap_or_default()
            .into_iter()
            .map(Activity::from)
            .collect())
    }

    async fn fetch_attend_status(&self, identity: &Identity, active_id: i64) -> Result<Option<i64>, ClientError> {
        let body = self
            .get("/v2/apis/sign/getAttendInfo", identity, self.settings.status_timeout)
            .query(&[("activeId", active_id.to_string())])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let resp: AttendInfoResp = serde_json::from_str(&body)?;
        let status = resp.data.and_then(|d| d.status);
        if status.is_none() {
            tracing::debug!(active_id, result = resp.result, msg = ?resp.msg, "attend info without status");
        }
        Ok(status)
    }

    async fn stu_sign_ajax(&self, identity: &Identity, query: &[(&str, String)]) -> Result<String, ClientError> {
        let body = self
            .get("/pptSign/stuSignajax", identity, self.settings.submit_timeout)
            .query(query)
            .send()
            .await?
            .text()
            .await?;
        if body == "success" {
            Ok(body)
        } else {
            Err(ClientError::Rejected(body))
        }
    }
}

#[async_trait]
impl ActivityApi for ChaoxingClient {
    async fn list_open_activities(&self, identity: &Identity, course_id: i64, class_id: i64) -> Vec<Activity> {
        let activities = match self.fetch_active_list(identity, course_id, class_id).await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, course_id, class_id, user = identity.display_name(), "list activities failed");
                return Vec::new();
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        let mut open = Vec::new();
        for act in activities.into_iter().filter(|a| a.end_time_ms > now_ms) {
            if self.check_unsigned(identity, act.active_id).await {
                open.push(act);
            }
        }
        open
    }

    async fn check_unsigned(&self, identity: &Identity, active_id: i64) -> bool {
        match self.fetch_attend_status(identity, active_id).await {
            Ok(status) => status == Some(0),
            Err(e) => {
                tracing::warn!(error = %e, active_id, user = identity.display_name(), "attend status unknown");
                false
            }
        }
    }

    async fn submit_general(&self, identity: &Identity, active_id: i64) -> Result<String, ClientError> {
        let body = self
            .get("/v2/apis/sign/signIn", identity, self.settings.submit_timeout)
            .query(&[("activeId", active_id.to_string())])
            .send()
            .await?
            .text()
            .await?;
        let resp: SignInResp = serde_json::from_str(&body)?;
        if resp.result != 1 {
            return Err(ClientError::Rejected(resp.msg.unwrap_or_else(|| format!("result {}", resp.result))));
        }
        Ok(match resp.data.and_then(|d| d.submittime) {
            Some(at) => format!("success at {at}"),
            None => "success".to_string(),
        })
    }

    async fn submit_location(
        &self,
        identity: &Identity,
        active_id: i64,
        location: &Location,
    ) -> Result<String, ClientError> {
        self.stu_sign_ajax(
            identity,
            &[
                ("name", String::new()),
                ("address", location.address.clone()),
                ("activeId", active_id.to_string()),
                ("uid", identity.uid().to_string()),
                ("clientip", String::new()),
                ("latitude", location.latitude.to_string()),
                ("longitude", location.longitude.to_string()),
                ("fid", self.settings.fid.to_string()),
                ("appType", "15".to_string()),
                ("ifTiJiao", "1".to_string()),
            ],
        )
        .await
    }

    async fn submit_qr_code(&self, identity: &Identity, active_id: i64, encoding: &str) -> Result<String, ClientError> {
        self.stu_sign_ajax(
            identity,
            &[
                ("enc", encoding.to_string()),
                ("name", String::new()),
                ("activeId", active_id.to_string()),
                ("uid", identity.uid().to_string()),
                ("clientip", String::new()),
                ("useragent", String::new()),
                ("latitude", "-1".to_string()),
                ("longitude", "-1".to_string()),
                ("fid", self.settings.fid.to_string()),
                ("appType", "15".to_string()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const COOKIE_STR: &str = "_uid=1001; vc3=abc";

    fn identity() -> Identity {
        Identity::new("alice", COOKIE_STR).unwrap()
    }

    fn client(server: &MockServer) -> ChaoxingClient {
        ChaoxingClient::new(RemoteSettings { base_url: server.uri(), ..RemoteSettings::default() }).unwrap()
    }

    async fn mount_status(server: &MockServer, active_id: i64, status: i64) {
        Mock::given(method("GET"))
            .and(path("/v2/apis/sign/getAttendInfo"))
            .and(query_param("activeId", active_id.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 1, "msg": "", "data": {"status": status}
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn list_keeps_only_open_and_unsigned() {
        let server = MockServer::start().await;
        let now = Utc::now().timestamp_millis();
        Mock::given(method("GET"))
            .and(path("/v2/apis/active/student/activelist"))
            .and(query_param("courseId", "11"))
            .and(query_param("classId", "22"))
            .and(header("cookie", COOKIE_STR))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 1,
                "data": {"activeList": [
                    {"nameOne": "签到", "attendNum": 0, "startTime": now - 60_000, "endTime": now - 1_000, "id": 1},
                    {"nameOne": "签到", "attendNum": 0, "startTime": now - 60_000, "endTime": now + 600_000, "id": 2},
                    {"nameOne": "位置签到", "attendNum": 1, "startTime": now - 60_000, "endTime": now + 600_000, "id": 3}
                ]}
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_status(&server, 2, 0).await;
        mount_status(&server, 3, 1).await;

        let open = client(&server).list_open_activities(&identity(), 11, 22).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].active_id, 2);
        assert!(open.iter().all(|a| a.end_time_ms > now));
    }

    #[tokio::test]
    async fn list_failure_yields_empty() {
        let server = MockServer::start().await;
        Mock::given(path("/v2/apis/active/student/activelist"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        assert!(client(&server).list_open_activities(&identity(), 1, 2).await.is_empty());
    }

    #[tokio::test]
    async fn list_with_non_one_result_yields_empty() {
        let server = MockServer::start().await;
        let now = Utc::now().timestamp_millis();
        Mock::given(path("/v2/apis/active/student/activelist"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 0,
                "data": {"activeList": [
                    {"nameOne": "签到", "attendNum": 0, "startTime": now, "endTime": now + 600_000, "id": 2}
                ]}
            })))
            .mount(&server)
            .await;
        mount_status(&server, 2, 0).await;
        assert!(client(&server).list_open_activities(&identity(), 1, 2).await.is_empty());
    }

    #[tokio::test]
    async fn missing_status_counts_as_signed() {
        let server = MockServer::start().await;
        Mock::given(path("/v2/apis/sign/getAttendInfo"))
            .and(query_param("activeId", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 1, "msg": "", "data": null
            })))
            .mount(&server)
            .await;
        Mock::given(path("/v2/apis/sign/getAttendInfo"))
            .and(query_param("activeId", "4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 1, "msg": "", "data": {}
            })))
            .mount(&server)
            .await;
        let client = client(&server);
        assert!(!client.check_unsigned(&identity(), 3).await);
        assert!(!client.check_unsigned(&identity(), 4).await);
    }

    #[tokio::test]
    async fn undecodable_status_counts_as_signed() {
        let server = MockServer::start().await;
        Mock::given(path("/v2/apis/sign/getAttendInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;
        assert!(!client(&server).check_unsigned(&identity(), 9).await);
    }

    #[tokio::test]
    async fn general_sign_reports_remote_message() {
        let server = MockServer::start().await;
        Mock::given(path("/v2/apis/sign/signIn"))
            .and(query_param("activeId", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 0, "msg": "closed", "data": null
            })))
            .mount(&server)
            .await;
        let err = client(&server).submit_general(&identity(), 5).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(ref m) if m == "closed"));
    }

    #[tokio::test]
    async fn general_sign_success() {
        let server = MockServer::start().await;
        Mock::given(path("/v2/apis/sign/signIn"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 1, "msg": "", "data": {"id": 1, "name": "alice", "submittime": "10:00"}
            })))
            .mount(&server)
            .await;
        let msg = client(&server).submit_general(&identity(), 5).await.unwrap();
        assert_eq!(msg, "success at 10:00");
    }

    #[tokio::test]
    async fn location_sign_sends_coordinates_and_uid() {
        let server = MockServer::start().await;
        Mock::given(path("/pptSign/stuSignajax"))
            .and(query_param("activeId", "7"))
            .and(query_param("uid", "1001"))
            .and(query_param("address", "Main Building 301"))
            .and(query_param("ifTiJiao", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("success"))
            .expect(1)
            .mount(&server)
            .await;
        let loc = Location {
            name: "lab".into(),
            address: "Main Building 301".into(),
            longitude: 114.36,
            latitude: 30.54,
        };
        assert_eq!(client(&server).submit_location(&identity(), 7, &loc).await.unwrap(), "success");
    }

    #[tokio::test]
    async fn qr_sign_requires_literal_success() {
        let server = MockServer::start().await;
        Mock::given(path("/pptSign/stuSignajax"))
            .and(query_param("enc", "ABC123"))
            .and(query_param("uid", "1001"))
            .respond_with(ResponseTemplate::new(200).set_body_string("签到过期"))
            .expect(1)
            .mount(&server)
            .await;
        let err = client(&server).submit_qr_code(&identity(), 8, "ABC123").await.unwrap_err();
        assert_eq!(err.to_string(), "签到过期");
    }
}
