//! Mail transport interface.
//!
//! The actual provider call (Gmail API, SMTP relay, ...) lives outside this
//! core; the dispatcher only sees this trait. The in-memory implementation
//! is the test double.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use mailroom_core::OrganizationId;
use mailroom_delivery::Job;

/// Mail transport failure. Routed through the retry manager.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("provider rejected message: {0}")]
    Rejected(String),
    #[error("transport timeout")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
}

/// A fully personalized outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
}

impl OutgoingEmail {
    pub fn from_job(job: &Job) -> Self {
        Self {
            to: job.recipient_email.clone(),
            to_name: job.recipient_name.clone(),
            subject: job.subject.clone(),
            body_html: job.body_html.clone(),
            body_text: job.body_text.clone(),
        }
    }
}

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    pub thread_id: Option<String>,
}

/// Outbound mail transport, keyed by the sending organization's account.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(
        &self,
        organization_id: OrganizationId,
        email: &OutgoingEmail,
    ) -> Result<SendReceipt, TransportError>;
}

/// In-memory transport for tests/dev: records accepted messages and can be
/// scripted to fail.
#[derive(Debug, Default)]
pub struct InMemoryMailSender {
    sent: Mutex<Vec<(OrganizationId, OutgoingEmail)>>,
    failures: Mutex<VecDeque<TransportError>>,
}

impl InMemoryMailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `count` transport failures ahead of any successful send.
    pub fn fail_times(&self, count: usize, error: TransportError) {
        let mut failures = self.failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    /// Messages accepted so far, in send order.
    pub fn sent(&self) -> Vec<(OrganizationId, OutgoingEmail)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl MailSender for InMemoryMailSender {
    async fn send(
        &self,
        organization_id: OrganizationId,
        email: &OutgoingEmail,
    ) -> Result<SendReceipt, TransportError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((organization_id, email.clone()));
        Ok(SendReceipt {
            message_id: format!("msg-{}", sent.len()),
            thread_id: None,
        })
    }
}

/// Transport that only logs; the worker binary's default until a real
/// provider adapter is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMailSender;

#[async_trait]
impl MailSender for LoggingMailSender {
    async fn send(
        &self,
        organization_id: OrganizationId,
        email: &OutgoingEmail,
    ) -> Result<SendReceipt, TransportError> {
        tracing::info!(
            organization_id = %organization_id,
            to = %email.to,
            subject = %email.subject,
            "delivering message (logging transport)"
        );
        Ok(SendReceipt {
            message_id: format!("log-{}", uuid::Uuid::now_v7()),
            thread_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_sends_in_order() {
        let sender = InMemoryMailSender::new();
        let org = OrganizationId::new();
        let email = OutgoingEmail {
            to: "lead@example.com".to_string(),
            to_name: None,
            subject: "Hello".to_string(),
            body_html: None,
            body_text: Some("hi".to_string()),
        };

        let receipt = sender.send(org, &email).await.unwrap();
        assert_eq!(receipt.message_id, "msg-1");
        assert_eq!(sender.sent_count(), 1);
        assert_eq!(sender.sent()[0].1.to, "lead@example.com");
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let sender = InMemoryMailSender::new();
        let org = OrganizationId::new();
        let email = OutgoingEmail {
            to: "lead@example.com".to_string(),
            to_name: None,
            subject: "Hello".to_string(),
            body_html: None,
            body_text: None,
        };

        sender.fail_times(2, TransportError::Timeout);
        assert!(sender.send(org, &email).await.is_err());
        assert!(sender.send(org, &email).await.is_err());
        assert!(sender.send(org, &email).await.is_ok());
        assert_eq!(sender.sent_count(), 1);
    }
}
