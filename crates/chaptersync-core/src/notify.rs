//! New-chapter notifiers.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::store::{NewChapterNotice, Notifier, NotifyError};

/// Writes each notice to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_new_chapter<'a>(
        &'a self,
        notice: &'a NewChapterNotice,
    ) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            tracing::info!(
                work_id = %notice.work_id,
                work = %notice.work_name,
                chapter_id = %notice.chapter_id,
                chapter = %notice.identifier,
                "new chapter available"
            );
            Ok(())
        })
    }
}

/// POSTs each notice as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify_new_chapter<'a>(
        &'a self,
        notice: &'a NewChapterNotice,
    ) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(&self.url)
                .json(notice)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| NotifyError(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(NotifyError(format!("webhook returned HTTP {}", resp.status())));
            }
            Ok(())
        })
    }
}

/// Fan a notice out to several notifiers.
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

impl Notifier for FanoutNotifier {
    fn notify_new_chapter<'a>(
        &'a self,
        notice: &'a NewChapterNotice,
    ) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            let mut failures = Vec::new();
            for notifier in &self.notifiers {
                if let Err(e) = notifier.notify_new_chapter(notice).await {
                    failures.push(e.0);
                }
            }
            if failures.is_empty() {
                Ok(())
            } else {
                Err(NotifyError(failures.join("; ")))
            }
        })
    }
}

/// Announce a notice in the background. Failures are logged, never returned.
pub fn spawn_notify(notifier: Arc<dyn Notifier>, notice: NewChapterNotice) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify_new_chapter(&notice).await {
            tracing::warn!(
                work_id = %notice.work_id,
                chapter_id = %notice.chapter_id,
                error = %e,
                "new-chapter notification failed"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ChapterKey;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notice() -> NewChapterNotice {
        NewChapterNotice {
            work_id: "w1".into(),
            chapter_id: "c1".into(),
            identifier: ChapterKey::Number(12.5),
            work_name: "Tower".into(),
        }
    }

    #[tokio::test]
    async fn webhook_posts_notice_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "work_id": "w1",
                "chapter_id": "c1",
                "identifier": 12.5,
                "work_name": "Tower"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            reqwest::Client::new(),
            format!("{}/hook", server.uri()),
            Duration::from_secs(5),
        );
        notifier.notify_new_chapter(&notice()).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(reqwest::Client::new(), server.uri(), Duration::from_secs(5));
        let err = notifier.notify_new_chapter(&notice()).await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn fanout_collects_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let fanout = FanoutNotifier::new(vec![
            Arc::new(LogNotifier),
            Arc::new(WebhookNotifier::new(
                reqwest::Client::new(),
                server.uri(),
                Duration::from_secs(5),
            )),
        ]);
        assert!(fanout.notify_new_chapter(&notice()).await.is_err());
    }
}
