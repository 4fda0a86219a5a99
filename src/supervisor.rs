use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    client::ActivityApi,
    config::{ConfigError, Settings},
    engine::{Course, CourseEngine},
    models::{ApiResponse, Identity, Location, Outcome},
    qr::QrCache,
};

const OUTCOME_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("course `{0}` is not configured")]
    UnknownCourse(String),
}

impl IntoResponse for PublishError {
    fn into_response(self) -> Response {
        let status = match self {
            PublishError::UnknownCourse(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(ApiResponse { success: false, data: self.to_string() })).into_response()
    }
}

/// Course name to QR cache, handed to whatever publishes scanned codes.
#[derive(Debug, Clone, Default)]
pub struct CourseRegistry {
    names: Arc<Vec<String>>,
    caches: Arc<HashMap<String, Arc<QrCache>>>,
}

impl CourseRegistry {
    pub fn course_names(&self) -> &[String] {
        &self.names
    }

    #[cfg(test)]
    pub fn qr_cache(&self, course_name: &str) -> Option<Arc<QrCache>> {
        self.caches.get(course_name).cloned()
    }

    pub fn publish(&self, course_name: &str, encoding: impl Into<String>) -> Result<(), PublishError> {
        let cache = self
            .caches
            .get(course_name)
            .ok_or_else(|| PublishError::UnknownCourse(course_name.to_string()))?;
        cache.publish(encoding, Utc::now());
        info!(course = course_name, "qr code published");
        Ok(())
    }
}

/// Receives every outcome produced by the engines.
pub trait OutcomeConsumer: Send + 'static {
    fn consume(&mut self, outcome: Outcome);
}

#[derive(Debug, Default)]
pub struct LogConsumer;

impl OutcomeConsumer for LogConsumer {
    fn consume(&mut self, o: Outcome) {
        if o.success {
            info!(course = %o.course_name, user = %o.user, kind = %o.sign_kind, active_id = o.active_id, message = %o.message, "signed in");
        } else {
            warn!(course = %o.course_name, user = %o.user, kind = %o.sign_kind, active_id = o.active_id, message = %o.message, "sign in failed");
        }
    }
}

pub struct Supervisor {
    engines: Vec<CourseEngine>,
    registry: CourseRegistry,
    outcomes: mpsc::Receiver<Outcome>,
}

impl Supervisor {
    /// Resolves every alias up front; the first bad reference aborts the whole build.
    pub fn build(settings: &Settings, api: Arc<dyn ActivityApi>) -> Result<Self, ConfigError> {
        let mut users: HashMap<&str, Arc<Identity>> = HashMap::new();
        for u in &settings.users {
            let identity = Arc::new(Identity::new(u.alias.clone(), u.cookie.clone())?);
            if users.insert(u.alias.as_str(), identity).is_some() {
                return Err(ConfigError::DuplicateUser(u.alias.clone()));
            }
        }
        let mut locations: HashMap<&str, Arc<Location>> = HashMap::new();
        for l in &settings.locations {
            let loc = Location {
                name: l.alias.clone(),
                address: l.address.clone(),
                longitude: l.longitude,
                latitude: l.latitude,
            };
            if locations.insert(l.alias.as_str(), Arc::new(loc)).is_some() {
                return Err(ConfigError::DuplicateLocation(l.alias.clone()));
            }
        }

        let (tx, rx) = mpsc::channel(OUTCOME_BUFFER);
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        let mut caches = HashMap::new();
        let mut engines = Vec::new();

        for c in &settings.courses {
            if !seen.insert(c.alias.as_str()) {
                return Err(ConfigError::DuplicateCourse(c.alias.clone()));
            }
            if c.users.is_empty() {
                return Err(ConfigError::NoUsers(c.alias.clone()));
            }
            let location = locations.get(c.location.as_str()).cloned().ok_or_else(|| ConfigError::UnknownLocation {
                course: c.alias.clone(),
                alias: c.location.clone(),
            })?;
            let mut course_users = HashSet::new();
            let mut identities = Vec::with_capacity(c.users.len());
            for alias in &c.users {
                if !course_users.insert(alias.as_str()) {
                    return Err(ConfigError::RepeatedCourseUser { course: c.alias.clone(), alias: alias.clone() });
                }
                let identity = users.get(alias.as_str()).cloned().ok_or_else(|| ConfigError::UnknownUser {
                    course: c.alias.clone(),
                    alias: alias.clone(),
                })?;
                identities.push(identity);
            }

            let qr = Arc::new(QrCache::new());
            names.push(c.alias.clone());
            caches.insert(c.alias.clone(), Arc::clone(&qr));

            let course = Course {
                name: c.alias.clone(),
                identities,
                location,
                course_id: c.course_id,
                class_id: c.class_id,
                poll_interval: c.poll_interval(&settings.course),
                submit_delay: c.submit_delay(&settings.course),
                qr,
            };
            engines.push(CourseEngine::new(course, Arc::clone(&api), tx.clone()));
        }

        let registry = CourseRegistry { names: Arc::new(names), caches: Arc::new(caches) };
        Ok(Self { engines, registry, outcomes: rx })
    }

    pub fn registry(&self) -> &CourseRegistry {
        &self.registry
    }

    /// Spawns one task per engine plus the consumer task.
    pub fn start<C: OutcomeConsumer>(self, mut consumer: C) -> SupervisorHandle {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(self.engines.len() + 1);

        for engine in self.engines {
            tasks.push(tokio::spawn(engine.run(cancel.clone())));
        }

        // ends once every engine (and its sender) is gone
        let mut outcomes = self.outcomes;
        tasks.push(tokio::spawn(async move {
            while let Some(outcome) = outcomes.recv().await {
                consumer.consume(outcome);
            }
        }));

        info!(courses = self.registry.course_names().len(), "engines started");
        SupervisorHandle { registry: self.registry, cancel, tasks }
    }
}

pub struct SupervisorHandle {
    registry: CourseRegistry,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn registry(&self) -> CourseRegistry {
        self.registry.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        info!("engines stopped");
    }
}
