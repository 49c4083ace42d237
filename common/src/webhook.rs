// Webhook triggers: vendor signature verification, event mapping and the HTTP listener
//
// A verified, subscribed event runs the backup pipeline for one repository as a
// detached task, bypassing its schedule entirely.

use crate::errors::{ApiError, WebhookError};
use crate::models::TriggerSource;
use crate::pipeline::BackupRunner;
use crate::registry::RepositoryRegistry;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_ROUTE: &str = "/api/v1/webhooks/:repository";

/// Supported Git hosting vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookVendor {
    Github,
    Gitea,
    Gitlab,
}

impl WebhookVendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookVendor::Github => "github",
            WebhookVendor::Gitea => "gitea",
            WebhookVendor::Gitlab => "gitlab",
        }
    }

    fn event_header(&self) -> &'static str {
        match self {
            WebhookVendor::Github => "X-GitHub-Event",
            WebhookVendor::Gitea => "X-Gitea-Event",
            WebhookVendor::Gitlab => "X-Gitlab-Event",
        }
    }

    /// Check the request came from the vendor. An empty secret disables the check.
    pub fn verify(&self, headers: &HeaderMap, body: &[u8], secret: &str) -> Result<(), WebhookError> {
        if secret.is_empty() {
            return Ok(());
        }

        match self {
            WebhookVendor::Github => {
                let header = required_header(headers, "X-Hub-Signature-256")?;
                let signature = header
                    .strip_prefix("sha256=")
                    .ok_or(WebhookError::InvalidSignature)?;
                verify_hmac_sha256(body, signature, secret)
            }
            WebhookVendor::Gitea => {
                let signature = required_header(headers, "X-Gitea-Signature")?;
                verify_hmac_sha256(body, signature, secret)
            }
            WebhookVendor::Gitlab => {
                let token = required_header(headers, "X-Gitlab-Token")?;
                if constant_time_eq(token.as_bytes(), secret.as_bytes()) {
                    Ok(())
                } else {
                    Err(WebhookError::InvalidSignature)
                }
            }
        }
    }

    /// Canonical event carried by the request, if the vendor sent a known one
    pub fn event(&self, headers: &HeaderMap) -> Option<WebhookEvent> {
        let raw = headers.get(self.event_header())?.to_str().ok()?;
        match self {
            WebhookVendor::Github | WebhookVendor::Gitea => match raw {
                "push" => Some(WebhookEvent::Push),
                "create" => Some(WebhookEvent::Create),
                "pull_request" => Some(WebhookEvent::PullRequest),
                "release" => Some(WebhookEvent::Release),
                _ => None,
            },
            WebhookVendor::Gitlab => match raw {
                "Push Hook" => Some(WebhookEvent::Push),
                "Tag Push Hook" => Some(WebhookEvent::TagPush),
                "Merge Request Hook" => Some(WebhookEvent::MergeRequest),
                "Release Hook" => Some(WebhookEvent::Release),
                _ => None,
            },
        }
    }
}

impl fmt::Display for WebhookVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor-neutral event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WebhookEvent {
    Push,
    TagPush,
    Create,
    PullRequest,
    MergeRequest,
    Release,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::Push => "push",
            WebhookEvent::TagPush => "tag_push",
            WebhookEvent::Create => "create",
            WebhookEvent::PullRequest => "pull_request",
            WebhookEvent::MergeRequest => "merge_request",
            WebhookEvent::Release => "release",
        }
    }
}

impl FromStr for WebhookEvent {
    type Err = String;

    /// Accepts canonical names and GitLab's hook names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "push" | "Push Hook" => Ok(WebhookEvent::Push),
            "tag_push" | "Tag Push Hook" => Ok(WebhookEvent::TagPush),
            "create" => Ok(WebhookEvent::Create),
            "pull_request" => Ok(WebhookEvent::PullRequest),
            "merge_request" | "Merge Request Hook" => Ok(WebhookEvent::MergeRequest),
            "release" | "Release Hook" => Ok(WebhookEvent::Release),
            other => Err(format!("unknown webhook event '{}'", other)),
        }
    }
}

impl TryFrom<String> for WebhookEvent {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WebhookEvent> for String {
    fn from(event: WebhookEvent) -> Self {
        event.as_str().to_string()
    }
}

impl fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-repository webhook configuration. `secret` is encrypted at rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub vendor: WebhookVendor,
    #[serde(default)]
    pub secret: String,
    /// Subscribed events; empty means push only
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

impl WebhookConfig {
    pub fn subscribes_to(&self, event: WebhookEvent) -> bool {
        if self.events.is_empty() {
            event == WebhookEvent::Push
        } else {
            self.events.contains(&event)
        }
    }
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| WebhookError::MissingHeader(name.to_string()))
}

/// Validate a hex-encoded HMAC-SHA256 of `payload`
pub fn verify_hmac_sha256(payload: &[u8], signature: &str, secret: &str) -> Result<(), WebhookError> {
    let expected = hex::decode(signature.trim()).map_err(|_| WebhookError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::InvalidSecret(e.to_string()))?;
    mac.update(payload);

    // Constant-time comparison
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)
}

/// Hex-encoded HMAC-SHA256, as vendors send it
pub fn sign_hmac_sha256(payload: &[u8], secret: &str) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::InvalidSecret(e.to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ============================================================================
// HTTP listener
// ============================================================================

/// Shared state of the webhook router
#[derive(Clone)]
pub struct WebhookState {
    pub registry: Arc<RepositoryRegistry>,
    pub runner: Arc<dyn BackupRunner>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

type HandlerError = (StatusCode, Json<ApiError>);

fn reject(err: WebhookError) -> HandlerError {
    let status = match err {
        WebhookError::RepositoryNotFound(_) | WebhookError::NotConfigured(_) => StatusCode::NOT_FOUND,
        WebhookError::MissingHeader(_) | WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
        WebhookError::InvalidSecret(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiError::from(err)))
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(WEBHOOK_ROUTE, post(handle_webhook))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Handle `POST /api/v1/webhooks/{repository}`
#[tracing::instrument(skip_all, fields(repository = %repository))]
pub async fn handle_webhook(
    State(state): State<WebhookState>,
    Path(repository): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), HandlerError> {
    let record = state.registry.get(&repository).ok_or_else(|| {
        warn!("Webhook for unknown repository");
        reject(WebhookError::RepositoryNotFound(repository.clone()))
    })?;

    let config = record.webhook.as_ref().ok_or_else(|| {
        warn!("Webhook received but none configured");
        reject(WebhookError::NotConfigured(repository.clone()))
    })?;

    config
        .vendor
        .verify(&headers, &body, &config.secret)
        .map_err(|e| {
            warn!(vendor = %config.vendor, error = %e, "Webhook verification failed");
            reject(e)
        })?;

    let event = match config.vendor.event(&headers) {
        Some(event) if config.subscribes_to(event) => event,
        other => {
            debug!(event = ?other, "Event not subscribed, ignoring");
            return Ok((
                StatusCode::OK,
                Json(WebhookResponse {
                    status: "ignored".to_string(),
                    repository,
                    event: other.map(|e| e.to_string()),
                }),
            ));
        }
    };

    info!(vendor = %config.vendor, event = %event, "Webhook accepted, starting backup");

    let runner = Arc::clone(&state.runner);
    let name = repository.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run_backup(&name, TriggerSource::Webhook).await {
            debug!(repository = %name, error = %e, "Webhook-triggered backup failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            status: "accepted".to_string(),
            repository,
            event: Some(event.to_string()),
        }),
    ))
}

/// Bind the webhook listener. Called before anything else starts so a
/// taken port fails startup.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind webhook listener on {}: {}", addr, e))?;
    info!(addr = %addr, "Webhook listener bound");
    Ok(listener)
}

/// Serve webhooks on an already-bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: WebhookState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!(error = %e, "Webhook listener failed");
            anyhow::anyhow!("Webhook listener failed: {}", e)
        })?;

    info!("Webhook listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;
    use crate::git::PullOutcome;
    use crate::models::BackupRepository;
    use crate::pipeline::BackupReport;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "It's a Secret to Everybody";
    const PAYLOAD: &[u8] = b"Hello, World!";

    /// Records which repositories were triggered
    #[derive(Default)]
    struct MockRunner {
        runs: tokio::sync::Mutex<Vec<(String, TriggerSource)>>,
    }

    #[async_trait]
    impl BackupRunner for MockRunner {
        async fn run_backup(
            &self,
            repository: &str,
            trigger: TriggerSource,
        ) -> Result<BackupReport, PipelineError> {
            self.runs.lock().await.push((repository.to_string(), trigger));
            Ok(BackupReport {
                repository: repository.to_string(),
                pull: PullOutcome::UpToDate,
                uploads: Vec::new(),
                duration: Duration::ZERO,
            })
        }
    }

    fn state_with(webhook: Option<WebhookConfig>) -> (WebhookState, Arc<MockRunner>) {
        let registry = Arc::new(RepositoryRegistry::new());
        let mut repo =
            BackupRepository::new("demo", "https://example.com/demo.git", std::path::Path::new("/data"))
                .unwrap();
        repo.webhook = webhook;
        registry.add(repo).unwrap();

        let runner = Arc::new(MockRunner::default());
        (
            WebhookState {
                registry,
                runner: runner.clone(),
            },
            runner,
        )
    }

    fn github(events: Vec<WebhookEvent>) -> Option<WebhookConfig> {
        Some(WebhookConfig {
            vendor: WebhookVendor::Github,
            secret: SECRET.to_string(),
            events,
        })
    }

    fn github_request(path: &str, event: &str, signature: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("X-GitHub-Event", event)
            .header("X-Hub-Signature-256", signature)
            .body(Body::from(PAYLOAD))
            .unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_github_signature_known_vector() {
        // Example published in GitHub's webhook documentation
        let signature = sign_hmac_sha256(PAYLOAD, SECRET).unwrap();
        assert_eq!(
            signature,
            "757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
        assert!(verify_hmac_sha256(PAYLOAD, &signature, SECRET).is_ok());
        assert_eq!(
            verify_hmac_sha256(b"tampered", &signature, SECRET),
            Err(WebhookError::InvalidSignature)
        );
        assert_eq!(
            verify_hmac_sha256(PAYLOAD, "not-hex", SECRET),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn test_vendor_verification() {
        let signature = sign_hmac_sha256(PAYLOAD, SECRET).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-gitea-signature", signature.parse().unwrap());
        assert!(WebhookVendor::Gitea.verify(&headers, PAYLOAD, SECRET).is_ok());
        assert_eq!(
            WebhookVendor::Github.verify(&headers, PAYLOAD, SECRET),
            Err(WebhookError::MissingHeader("X-Hub-Signature-256".to_string()))
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-token", SECRET.parse().unwrap());
        assert!(WebhookVendor::Gitlab.verify(&headers, PAYLOAD, SECRET).is_ok());
        headers.insert("x-gitlab-token", "wrong".parse().unwrap());
        assert_eq!(
            WebhookVendor::Gitlab.verify(&headers, PAYLOAD, SECRET),
            Err(WebhookError::InvalidSignature)
        );

        // No secret configured: nothing to verify
        assert!(WebhookVendor::Github.verify(&HeaderMap::new(), PAYLOAD, "").is_ok());
    }

    #[test]
    fn test_event_mapping() {
        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-event", "Tag Push Hook".parse().unwrap());
        assert_eq!(WebhookVendor::Gitlab.event(&headers), Some(WebhookEvent::TagPush));
        assert_eq!(WebhookVendor::Github.event(&headers), None);

        headers.insert("x-github-event", "pull_request".parse().unwrap());
        assert_eq!(WebhookVendor::Github.event(&headers), Some(WebhookEvent::PullRequest));

        headers.insert("x-gitea-event", "ping".parse().unwrap());
        assert_eq!(WebhookVendor::Gitea.event(&headers), None);
    }

    #[test]
    fn test_config_events_parse_canonical_and_gitlab_names() {
        let config: WebhookConfig = serde_json::from_value(serde_json::json!({
            "vendor": "gitlab",
            "secret": "",
            "events": ["Push Hook", "merge_request"]
        }))
        .unwrap();
        assert_eq!(config.events, vec![WebhookEvent::Push, WebhookEvent::MergeRequest]);

        let bad = serde_json::from_value::<WebhookConfig>(serde_json::json!({
            "vendor": "github",
            "events": ["deploy"]
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_empty_event_list_means_push_only() {
        let config = WebhookConfig {
            vendor: WebhookVendor::Github,
            secret: String::new(),
            events: Vec::new(),
        };
        assert!(config.subscribes_to(WebhookEvent::Push));
        assert!(!config.subscribes_to(WebhookEvent::Release));
    }

    #[tokio::test]
    async fn test_valid_push_is_accepted_and_runs_backup() {
        let (state, runner) = state_with(github(vec![]));
        let signature = format!("sha256={}", sign_hmac_sha256(PAYLOAD, SECRET).unwrap());

        let response = router(state)
            .oneshot(github_request("/api/v1/webhooks/demo", "push", &signature))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        settle().await;
        let runs = runner.runs.lock().await;
        assert_eq!(runs.as_slice(), &[("demo".to_string(), TriggerSource::Webhook)]);
    }

    #[tokio::test]
    async fn test_bad_signature_is_unauthorized() {
        let (state, runner) = state_with(github(vec![]));

        let response = router(state)
            .oneshot(github_request("/api/v1/webhooks/demo", "push", "sha256=00ff"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        settle().await;
        assert!(runner.runs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribed_event_is_ignored() {
        let (state, runner) = state_with(github(vec![WebhookEvent::Release]));
        let signature = format!("sha256={}", sign_hmac_sha256(PAYLOAD, SECRET).unwrap());

        let response = router(state)
            .oneshot(github_request("/api/v1/webhooks/demo", "push", &signature))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        settle().await;
        assert!(runner.runs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_repository_and_missing_config_are_not_found() {
        let (state, _) = state_with(None);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(github_request("/api/v1/webhooks/ghost", "push", "sha256=00"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(github_request("/api/v1/webhooks/demo", "push", "sha256=00"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = state_with(None);
        let response = router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bind_fails_when_port_is_taken() {
        let first = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let taken = first.local_addr().unwrap();

        let err = bind(taken).await.unwrap_err();
        assert!(err.to_string().contains("Failed to bind webhook listener"));
    }
}
