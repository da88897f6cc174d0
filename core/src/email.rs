//! `EmailSender` — the abstract collaborator named in spec.md §1. The
//! concrete third-party vendor is out of scope; this crate ships an
//! in-process test double plus a thin `reqwest`-backed HTTP vendor
//! implementation, matching the "abstract collaborator, real stack
//! underneath" treatment the spec gives to out-of-scope pieces.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), crate::error::CoreError>;
}

/// In-process double used by tests and local development. Records every
/// message sent so tests can assert on OTP delivery without a vendor.
#[derive(Default)]
pub struct InMemoryEmailSender {
    sent: DashMap<String, Vec<EmailMessage>>,
    fail_next: std::sync::atomic::AtomicBool,
}

impl InMemoryEmailSender {
    pub fn new() -> Self {
        InMemoryEmailSender {
            sent: DashMap::new(),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Makes the next `send` call fail, to exercise the
    /// `EmailDeliveryFailed` rollback path.
    pub fn fail_next_send(&self) {
        self.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn messages_to(&self, to: &str) -> Vec<EmailMessage> {
        self.sent.get(to).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn last_message_to(&self, to: &str) -> Option<EmailMessage> {
        self.messages_to(to).into_iter().last()
    }
}

#[async_trait]
impl EmailSender for InMemoryEmailSender {
    async fn send(&self, message: EmailMessage) -> Result<(), crate::error::CoreError> {
        if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
            warn!(to = %message.to, "simulated email delivery failure");
            return Err(crate::error::CoreError::EmailDeliveryFailed);
        }
        info!(to = %message.to, subject = %message.subject, "email queued (test double)");
        self.sent.entry(message.to.clone()).or_default().push(message);
        Ok(())
    }
}

/// HTTP-backed vendor implementation. Never leaks the vendor's status
/// code or body to callers — any non-2xx collapses to
/// `EmailDeliveryFailed` (spec.md §4.5: "do not leak vendor status").
pub struct HttpEmailSender {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    from: String,
}

impl HttpEmailSender {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>, from: impl Into<String>) -> Self {
        HttpEmailSender {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, message: EmailMessage) -> Result<(), crate::error::CoreError> {
        let body = serde_json::json!({
            "from": self.from,
            "to": message.to,
            "subject": message.subject,
            "html": message.html,
        });
        let resp = self
            .client
            .post(format!("{}/send", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "email vendor unreachable");
                crate::error::CoreError::EmailDeliveryFailed
            })?;

        if !resp.status().is_success() {
            warn!(status = %resp.status(), "email vendor rejected send");
            return Err(crate::error::CoreError::EmailDeliveryFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_sender_records_messages() {
        let sender = InMemoryEmailSender::new();
        sender
            .send(EmailMessage {
                to: "a@b.com".into(),
                subject: "code".into(),
                html: "<b>123456789</b>".into(),
            })
            .await
            .unwrap();
        assert_eq!(sender.messages_to("a@b.com").len(), 1);
    }

    #[tokio::test]
    async fn fail_next_send_fails_once() {
        let sender = InMemoryEmailSender::new();
        sender.fail_next_send();
        let msg = EmailMessage {
            to: "a@b.com".into(),
            subject: "s".into(),
            html: "h".into(),
        };
        assert!(sender.send(msg.clone()).await.is_err());
        assert!(sender.send(msg).await.is_ok());
    }
}
