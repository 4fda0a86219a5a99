// Per-course polling loop: discover open activities, submit, emit one outcome per attempt

use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::{ActivityApi, ClientError},
    models::{Activity, Identity, Location, Outcome, SignKind},
    policy,
    qr::QrCache,
};

#[derive(Debug)]
pub struct Course {
    pub name: String,
    pub identities: Vec<Arc<Identity>>,
    pub location: Arc<Location>,
    pub course_id: i64,
    pub class_id: i64,
    pub poll_interval: Duration,
    pub submit_delay: Duration,
    pub qr: Arc<QrCache>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug, Clone, Copy)]
enum Plan {
    General,
    Location,
    QrCode,
}

pub struct CourseEngine {
    course: Course,
    api: Arc<dyn ActivityApi>,
    outcomes: mpsc::Sender<Outcome>,
}

impl CourseEngine {
    pub fn new(course: Course, api: Arc<dyn ActivityApi>, outcomes: mpsc::Sender<Outcome>) -> Self {
        Self { course, api, outcomes }
    }

    #[cfg(test)]
    pub fn course(&self) -> &Course {
        &self.course
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(course = %self.course.name, users = self.course.identities.len(), "auto sign started");
        loop {
            if sleep_or_cancel(self.course.poll_interval, &cancel).await.is_err() {
                break;
            }
            if self.run_cycle(&cancel).await.is_err() {
                break;
            }
        }
        info!(course = %self.course.name, "auto sign stopped");
    }

    /// One poll: discover, then process every discovered activity.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let pending = tokio::select! {
            pending = self.discover() => pending,
            _ = cancel.cancelled() => return Err(Cancelled),
        };
        if !pending.is_empty() {
            debug!(course = %self.course.name, count = pending.len(), "open activities");
        }
        for (activity, users) in pending {
            debug!(
                course = %self.course.name,
                active_id = activity.active_id,
                kind = %activity.sign_kind,
                attended = activity.attend_count,
                pending = users.len(),
                "processing activity"
            );
            self.process(&activity, &users, cancel).await?;
        }
        Ok(())
    }

    /// Open activities merged across users, in the order the service first listed them.
    async fn discover(&self) -> Vec<(Activity, Vec<Arc<Identity>>)> {
        let mut merged: Vec<(Activity, Vec<Arc<Identity>>)> = Vec::new();
        for identity in &self.course.identities {
            let listed = self
                .api
                .list_open_activities(identity, self.course.course_id, self.course.class_id)
                .await;
            for activity in listed {
                match merged.iter_mut().find(|(a, _)| a.active_id == activity.active_id) {
                    Some((_, users)) => users.push(Arc::clone(identity)),
                    None => merged.push((activity, vec![Arc::clone(identity)])),
                }
            }
        }
        merged
    }

    async fn process(
        &self,
        activity: &Activity,
        users: &[Arc<Identity>],
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        let plan = match &activity.sign_kind {
            SignKind::General => Plan::General,
            SignKind::Location => Plan::Location,
            SignKind::QrCode => Plan::QrCode,
            SignKind::Unsupported(raw) => {
                let message = policy::unsupported_message(raw);
                for identity in users {
                    self.emit(activity, identity, false, message.clone()).await;
                }
                return Ok(());
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        if policy::should_delay(activity.end_time_ms, now_ms, self.course.submit_delay) {
            debug!(course = %self.course.name, active_id = activity.active_id, "delaying submission");
            sleep_or_cancel(self.course.submit_delay, cancel).await?;
        }

        for identity in users {
            let submitted = tokio::select! {
                r = self.submit(plan, activity, identity) => r,
                _ = cancel.cancelled() => return Err(Cancelled),
            };
            let Some(result) = submitted else {
                debug!(
                    course = %self.course.name,
                    active_id = activity.active_id,
                    "no qr code published since activity start, skipping"
                );
                return Ok(());
            };
            match result {
                Ok(message) => self.emit(activity, identity, true, message).await,
                Err(e) => self.emit(activity, identity, false, e.to_string()).await,
            }
        }
        Ok(())
    }

    /// `None` when a QR activity has no fresh encoding to submit.
    async fn submit(&self, plan: Plan, activity: &Activity, identity: &Identity) -> Option<Result<String, ClientError>> {
        let id = activity.active_id;
        let result = match plan {
            Plan::General => self.api.submit_general(identity, id).await,
            Plan::Location => {
                debug!(location = %self.course.location.name, active_id = id, "location sign");
                self.api.submit_location(identity, id, &self.course.location).await
            }
            Plan::QrCode => {
                let entry = self.course.qr.fresh_for(activity.start_time_ms)?;
                self.api.submit_qr_code(identity, id, &entry.encoding).await
            }
        };
        Some(result)
    }

    async fn emit(&self, activity: &Activity, identity: &Identity, success: bool, message: String) {
        let outcome = Outcome {
            course_name: self.course.name.clone(),
            user: identity.display_name().to_string(),
            sign_kind: activity.sign_kind.clone(),
            active_id: activity.active_id,
            success,
            message,
            timestamp: Utc::now(),
        };
        if self.outcomes.send(outcome).await.is_err() {
            warn!(course = %self.course.name, "outcome consumer is gone");
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(Cancelled),
    }
}
