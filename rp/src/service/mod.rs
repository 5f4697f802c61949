//! # Trigger Endpoint
//!
//! Exposes the coordinator over HTTP:
//!
//! - `GET /rp?mode=1,2` runs one capture and answers once every requested
//!   artifact is closed
//! - anything else answers `404 page not found`
//!
//! Both answers of the trigger are `200 text/plain`; a rejected trigger is a
//! normal outcome, not an error.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::{error, info};
use rp_common::{ModeSet, BODY_ALREADY_RUNNING, BODY_FINISHED, BODY_NOT_FOUND, MODE_PARAM, TRIGGER_PATH};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::StopSource;
use crate::coordinator::{CaptureRequest, Coordinator, TriggerOutcome};
use crate::domain::{ProfileSettings, ServiceError};

/// Router serving the trigger endpoint for `coordinator`
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route(TRIGGER_PATH, get(trigger))
        .fallback(not_found)
        .with_state(coordinator)
}

/// First `mode` value of the query; repeats and unrelated pairs are ignored
fn mode_selectors(params: &[(String, String)]) -> &str {
    params.iter().find(|(key, _)| key == MODE_PARAM).map_or("", |(_, value)| value.as_str())
}

async fn trigger(State(coordinator): State<Arc<Coordinator>>, Query(params): Query<Vec<(String, String)>>) -> Response {
    let modes = ModeSet::parse(mode_selectors(&params));
    match coordinator.trigger(CaptureRequest::new(modes)).await {
        TriggerOutcome::Finished(report) => {
            for artifact in report.artifacts() {
                info!("{artifact}");
            }
            BODY_FINISHED.into_response()
        }
        TriggerOutcome::AlreadyRunning => BODY_ALREADY_RUNNING.into_response(),
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, BODY_NOT_FOUND).into_response()
}

/// A running profile service
pub struct ProfileService {
    local_addr: SocketAddr,
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ProfileService {
    /// Bind `0.0.0.0:<settings.port>` and serve in the background
    ///
    /// Port 0 binds an ephemeral port; see [`ProfileService::local_addr`].
    ///
    /// # Errors
    /// Returns [`ServiceError::Bind`] if the port cannot be bound
    pub async fn start(settings: ProfileSettings, stop: StopSource) -> Result<Self, ServiceError> {
        let coordinator = Coordinator::new(settings.paths, stop);
        Self::serve(coordinator, settings.port).await
    }

    /// Serve an already configured coordinator on `port`
    ///
    /// # Errors
    /// Returns [`ServiceError::Bind`] if the port cannot be bound
    pub async fn serve(coordinator: Coordinator, port: u16) -> Result<Self, ServiceError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|source| ServiceError::Bind { port, source })?;
        let local_addr = listener.local_addr()?;
        info!("debug profile call : http://127.0.0.1:{}{TRIGGER_PATH}?mode=1", local_addr.port());

        let coordinator = Arc::new(coordinator);
        let shutdown = CancellationToken::new();
        let app = router(Arc::clone(&coordinator));
        let stopped = shutdown.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stopped.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("profile service stopped: {e}");
            }
        });

        Ok(Self { local_addr, coordinator, shutdown, server })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Stop accepting connections and wait for in-flight triggers to answer
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            error!("profile service task failed: {e}");
        }
    }
}

/// Serve captures that stop after `settings.duration`
///
/// # Errors
/// Returns [`ServiceError::Bind`] if the port cannot be bound
pub async fn start_profile(settings: ProfileSettings) -> Result<ProfileService, ServiceError> {
    let stop = StopSource::After(settings.duration);
    ProfileService::start(settings, stop).await
}

/// Serve captures that stop when `token` is cancelled
///
/// A capture triggered after `token` is already cancelled finishes at once
/// with (nearly) empty artifacts.
///
/// # Errors
/// Returns [`ServiceError::Bind`] if the port cannot be bound
pub async fn start_profile_with_cancel(
    settings: ProfileSettings,
    token: CancellationToken,
) -> Result<ProfileService, ServiceError> {
    ProfileService::start(settings, StopSource::Cancelled(token)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ArtifactFailurePolicy, Collector};
    use crate::domain::{ArtifactPaths, CaptureError};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use std::io::Write;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoopCollector;

    impl Collector for NoopCollector {
        fn start(&mut self) -> Result<(), CaptureError> {
            Ok(())
        }

        fn stop(&mut self, out: &mut dyn Write) -> Result<(), CaptureError> {
            out.write_all(b"ok\n").map_err(CaptureError::write(rp_common::Modality::Cpu))
        }
    }

    fn app(dir: &std::path::Path, stop: StopSource) -> (Router, Arc<Coordinator>) {
        let coordinator = Arc::new(
            Coordinator::new(ArtifactPaths::in_working_dir(dir), stop)
                .with_failure_policy(ArtifactFailurePolicy::Skip)
                .with_collectors(Arc::new(|_| Box::new(NoopCollector) as Box<dyn Collector>)),
        );
        (router(Arc::clone(&coordinator)), coordinator)
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String, String) {
        let response = app.oneshot(Request::get(uri).body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_trigger_answers_profile_finish() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path(), StopSource::After(Duration::from_millis(20)));

        let (status, content_type, body) = get_body(app, "/rp?mode=1,3").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.starts_with("text/plain"), "{content_type}");
        assert_eq!(body, BODY_FINISHED);
        assert!(dir.path().join("debug_profile.cpu").exists());
        assert!(dir.path().join("debug_profile.block").exists());
        assert!(!dir.path().join("debug_profile.mem").exists());
    }

    #[tokio::test]
    async fn test_missing_mode_finishes_without_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path(), StopSource::After(Duration::from_secs(3600)));

        let (_, _, body) = get_body(app, "/rp").await;
        assert_eq!(body, BODY_FINISHED);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_second_trigger_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let (app, coordinator) = app(dir.path(), StopSource::Cancelled(token.clone()));

        let first = tokio::spawn(get_body(app.clone(), "/rp?mode=0"));
        while !coordinator.is_capturing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (status, _, body) = get_body(app, "/rp?mode=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, BODY_ALREADY_RUNNING);

        token.cancel();
        let (_, _, body) = first.await.unwrap();
        assert_eq!(body, BODY_FINISHED);
    }

    #[tokio::test]
    async fn test_repeated_mode_takes_first_value() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path(), StopSource::After(Duration::from_millis(10)));

        let (status, _, body) = get_body(app.clone(), "/rp?mode=1&mode=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, BODY_FINISHED);
        assert!(dir.path().join("debug_profile.cpu").exists());
        assert!(!dir.path().join("debug_profile.mem").exists());

        let (status, _, body) = get_body(app, "/rp?mode=%FF&x=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, BODY_FINISHED);
    }

    #[test]
    fn test_mode_selectors() {
        let pairs = |list: &[(&str, &str)]| -> Vec<(String, String)> {
            list.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
        };
        assert_eq!(mode_selectors(&pairs(&[("x", "9"), ("mode", "3,4"), ("mode", "1")])), "3,4");
        assert_eq!(mode_selectors(&pairs(&[("x", "9")])), "");
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path(), StopSource::After(Duration::ZERO));

        let (status, _, body) = get_body(app, "/debug/pprof").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, BODY_NOT_FOUND);
    }
}
