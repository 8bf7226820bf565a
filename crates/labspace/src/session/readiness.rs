//! Readiness probing for freshly started session containers.

use async_trait::async_trait;
use log::{debug, info};
use std::time::Duration;

use super::error::{SessionError, SessionResult};

/// Upper bound for a single readiness request.
const READINESS_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessSettings {
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Waits until the app inside a session container answers.
#[async_trait]
pub trait SessionReadiness: Send + Sync {
    /// `target` is the `host:port` the proxy will forward to.
    async fn wait_until_ready(&self, access_code: &str, target: &str) -> SessionResult<()>;
}

/// Unauthenticated HTTP liveness check. Any HTTP response counts, including
/// redirects to a login page or 401/404 answers; only transport failures retry.
#[derive(Debug, Clone)]
pub struct HttpSessionReadiness {
    client: reqwest::Client,
    settings: ReadinessSettings,
}

impl HttpSessionReadiness {
    pub fn new(settings: ReadinessSettings) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { client, settings }
    }
}

impl Default for HttpSessionReadiness {
    fn default() -> Self {
        Self::new(ReadinessSettings::default())
    }
}

#[async_trait]
impl SessionReadiness for HttpSessionReadiness {
    async fn wait_until_ready(&self, access_code: &str, target: &str) -> SessionResult<()> {
        let url = format!("http://{}/", target);
        let timeout = self.settings.timeout;
        let start = tokio::time::Instant::now();
        let mut backoff = self.settings.initial_backoff;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let remaining = timeout.saturating_sub(start.elapsed());
            let request_timeout = remaining
                .min(READINESS_REQUEST_TIMEOUT)
                .max(Duration::from_millis(50));

            match self
                .client
                .get(&url)
                .timeout(request_timeout)
                .send()
                .await
            {
                Ok(response) => {
                    info!(
                        "Session {} ready at {} after {} attempt(s) (status {})",
                        access_code,
                        target,
                        attempts,
                        response.status()
                    );
                    return Ok(());
                }
                Err(err) => {
                    debug!(
                        "Session {} not ready yet (attempt {}): {}",
                        access_code, attempts, err
                    );
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(SessionError::ReadinessTimeout {
                    access_code: access_code.to_string(),
                    attempts,
                    elapsed,
                });
            }

            tokio::time::sleep(backoff.min(timeout - elapsed)).await;
            backoff = (backoff * 2).min(self.settings.max_backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::response::Redirect;
    use axum::routing::get;

    fn fast_settings(timeout_ms: u64) -> ReadinessSettings {
        ReadinessSettings {
            timeout: Duration::from_millis(timeout_ms),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn redirect_counts_as_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/", get(|| async { Redirect::temporary("/auth-sign-in") }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let readiness = HttpSessionReadiness::new(fast_settings(2_000));
        readiness
            .wait_until_ready("code1", &addr.to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn error_status_counts_as_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/", get(|| async { StatusCode::FORBIDDEN }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let readiness = HttpSessionReadiness::new(fast_settings(2_000));
        assert!(
            readiness
                .wait_until_ready("code2", &addr.to_string())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn unreachable_target_times_out_with_typed_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let readiness = HttpSessionReadiness::new(fast_settings(300));
        let err = readiness
            .wait_until_ready("code3", &addr.to_string())
            .await
            .unwrap_err();

        match err {
            SessionError::ReadinessTimeout {
                access_code,
                attempts,
                elapsed,
            } => {
                assert_eq!(access_code, "code3");
                assert!(attempts >= 2);
                assert!(elapsed >= Duration::from_millis(300));
            }
            other => panic!("expected readiness timeout, got {other:?}"),
        }
    }
}
