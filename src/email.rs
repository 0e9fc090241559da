//! Outbound mail.
//!
//! Requests never talk to the mail server themselves. They render a message
//! and push it onto a bounded queue; a background worker delivers it through
//! a `lettre` transport and retries failed sends with exponential backoff.
//! Delivery is best-effort: once the retries are spent the message is logged
//! and dropped, and the requester is never told.

use std::fmt::Display;
use std::time::{Duration, SystemTime};

use html_escape::encode_text;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use retry_policies::policies::ExponentialBackoff;
use retry_policies::{RetryDecision, RetryPolicy};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::get_password_reset_token;
use crate::config::MailConfig;
use crate::core::errors::ApiError;
use crate::models::models::User;
use crate::AppState;

const QUEUE_CAPACITY: usize = 256;
const MAX_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum MailError {
    #[error(transparent)]
    Address(#[from] lettre::address::AddressError),

    #[error(transparent)]
    Lettre(#[from] lettre::error::Error),

    #[error(transparent)]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("mail queue is full")]
    QueueFull,

    #[error("mail worker has stopped")]
    QueueClosed,
}

#[derive(Debug)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
    pub plain_text: String,
}

/// A message waiting for delivery.
#[derive(Debug, Clone)]
pub struct OutboundMail {
    pub subject: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub text_body: String,
    pub html_body: String,
}

impl OutboundMail {
    pub fn new(sender: &str, recipients: Vec<String>, rendered: RenderedEmail) -> Self {
        OutboundMail {
            subject: rendered.subject,
            sender: sender.to_string(),
            recipients,
            text_body: rendered.plain_text,
            html_body: rendered.body,
        }
    }

    pub fn to_message(&self) -> Result<Message, MailError> {
        let mut builder = Message::builder()
            .from(self.sender.parse::<Mailbox>()?)
            .subject(self.subject.as_str());
        for recipient in &self.recipients {
            builder = builder.to(recipient.parse::<Mailbox>()?);
        }

        Ok(builder.multipart(MultiPart::alternative_plain_html(
            self.text_body.clone(),
            self.html_body.clone(),
        ))?)
    }
}

/// Producer side of the mail queue. Cheap to clone.
#[derive(Clone)]
pub struct MailQueue {
    tx: mpsc::Sender<OutboundMail>,
}

impl MailQueue {
    /// Spawns the delivery worker on the current tokio runtime.
    pub fn start<B>(backend: B, policy: ExponentialBackoff) -> (Self, JoinHandle<()>)
    where
        B: AsyncTransport + Send + Sync + 'static,
        B::Error: Display,
    {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(run_worker(backend, rx, policy));
        (MailQueue { tx }, handle)
    }

    /// Queues `mail` without waiting for delivery.
    pub fn enqueue(&self, mail: OutboundMail) -> Result<(), MailError> {
        self.tx.try_send(mail).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MailError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => MailError::QueueClosed,
        })
    }
}

pub fn default_backoff() -> ExponentialBackoff {
    ExponentialBackoff::builder()
        .retry_bounds(Duration::from_secs(1), Duration::from_secs(60))
        .build_with_max_retries(MAX_RETRIES)
}

pub fn smtp_transport(config: &MailConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailError> {
    let builder = if config.use_tls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.server)
    };

    let mut builder = builder.port(config.port);
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Ok(builder.build())
}

async fn run_worker<B>(backend: B, mut rx: mpsc::Receiver<OutboundMail>, policy: ExponentialBackoff)
where
    B: AsyncTransport + Send + Sync,
    B::Error: Display,
{
    while let Some(mail) = rx.recv().await {
        let message = match mail.to_message() {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, subject = %mail.subject, "dropping unbuildable mail");
                continue;
            }
        };

        tracing::debug!(subject = %mail.subject, recipients = ?mail.recipients, body = %mail.text_body, "sending mail");
        deliver(&backend, message, &mail, &policy).await;
    }
    tracing::debug!("mail queue closed, worker exiting");
}

async fn deliver<B>(backend: &B, message: Message, mail: &OutboundMail, policy: &ExponentialBackoff)
where
    B: AsyncTransport + Sync,
    B::Error: Display,
{
    let started = SystemTime::now();
    let mut attempts: u32 = 0;

    loop {
        let err = match backend.send(message.clone()).await {
            Ok(_) => {
                tracing::info!(subject = %mail.subject, recipients = ?mail.recipients, "mail sent");
                return;
            }
            Err(e) => e.to_string(),
        };

        match policy.should_retry(started, attempts) {
            RetryDecision::Retry { execute_after } => {
                attempts += 1;
                let wait = execute_after
                    .duration_since(SystemTime::now())
                    .unwrap_or_default();
                tracing::warn!(error = %err, attempt = attempts, ?wait, "mail delivery failed, retrying");
                tokio::time::sleep(wait).await;
            }
            RetryDecision::DoNotRetry => {
                tracing::error!(error = %err, subject = %mail.subject, recipients = ?mail.recipients, "giving up on mail delivery");
                return;
            }
        }
    }
}

pub fn render_reset_password(user: &User, reset_link: &str, source: &str) -> RenderedEmail {
    let plain_text = format!(
        "Dear {username},\n\n\
         To reset your password click on the following link:\n\n\
         {link}\n\n\
         This request came from {source}.\n\
         If you have not requested a password reset simply ignore this message.\n\n\
         Sincerely,\n\nThe Microblog Team\n",
        username = user.username,
        link = reset_link,
        source = source,
    );

    let body = format!(
        "<p>Dear {username},</p>\
         <p>To reset your password <a href=\"{link}\">click here</a>.</p>\
         <p>Alternatively, you can paste the following link in your browser's address bar:</p>\
         <p>{link}</p>\
         <p>This request came from {source}.</p>\
         <p>If you have not requested a password reset simply ignore this message.</p>\
         <p>Sincerely,</p><p>The Microblog Team</p>",
        username = encode_text(&user.username),
        link = html_escape::encode_double_quoted_attribute(reset_link),
        source = encode_text(source),
    );

    RenderedEmail {
        subject: "[Microblog] Reset Your Password".to_string(),
        body,
        plain_text,
    }
}

/// Issues a reset token for `user` and queues the email carrying it.
pub fn send_password_reset_email(state: &AppState, user: &User, source: &str) -> Result<(), ApiError> {
    let token = get_password_reset_token(user, &state.config.secret_key, state.config.reset_token_expires_in)
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    let link = format!("{}/reset_password/{}", state.config.base_url, token);

    let mail = OutboundMail::new(
        state.config.mail_sender(),
        vec![user.email.clone()],
        render_reset_password(user, &link, source),
    );

    if let Err(e) = state.mail.enqueue(mail) {
        tracing::error!(error = %e, user_id = user.id, "could not queue password reset email");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lettre::address::Envelope;
    use lettre::transport::stub::AsyncStubTransport;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn user() -> User {
        User {
            id: 1,
            username: "susan<b>".to_string(),
            email: "susan@example.com".to_string(),
            password_hash: String::new(),
            about_me: None,
            last_seen: Utc::now(),
        }
    }

    fn mail() -> OutboundMail {
        OutboundMail::new(
            "admin@microblog.local",
            vec!["susan@example.com".to_string()],
            render_reset_password(&user(), "http://localhost:5000/reset_password/abc", "127.0.0.1"),
        )
    }

    fn fast_policy(max_retries: u32) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(1), Duration::from_millis(5))
            .build_with_max_retries(max_retries)
    }

    /// Fails the first `failures` sends, then succeeds.
    struct FlakyTransport {
        failures: u32,
        attempts: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl AsyncTransport for FlakyTransport {
        type Ok = ();
        type Error = std::io::Error;

        async fn send_raw(&self, _envelope: &Envelope, _email: &[u8]) -> Result<(), std::io::Error> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "connection refused"))
            } else {
                Ok(())
            }
        }
    }

    async fn wait_for(attempts: &AtomicU32, expected: u32) {
        for _ in 0..200 {
            if attempts.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn reset_email_mentions_link_and_escapes_html() {
        let rendered = render_reset_password(&user(), "http://x/reset_password/tok", "10.0.0.1");
        assert_eq!(rendered.subject, "[Microblog] Reset Your Password");
        assert!(rendered.plain_text.contains("http://x/reset_password/tok"));
        assert!(rendered.plain_text.contains("10.0.0.1"));
        assert!(rendered.body.contains("susan&lt;b&gt;"));
        assert!(!rendered.body.contains("susan<b>"));
    }

    #[test]
    fn message_builds_with_all_recipients() {
        let mut m = mail();
        m.recipients.push("john@example.com".to_string());
        let message = m.to_message().unwrap();
        assert_eq!(message.envelope().to().len(), 2);

        m.sender = "not an address".to_string();
        assert!(matches!(m.to_message(), Err(MailError::Address(_))));
    }

    #[tokio::test]
    async fn queued_mail_is_delivered() {
        let stub = AsyncStubTransport::new_ok();
        let (queue, _worker) = MailQueue::start(stub.clone(), fast_policy(0));
        queue.enqueue(mail()).unwrap();

        for _ in 0..200 {
            if !stub.messages().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(stub.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_sends_are_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let transport = FlakyTransport {
            failures: 2,
            attempts: attempts.clone(),
        };
        let (queue, _worker) = MailQueue::start(transport, fast_policy(3));
        queue.enqueue(mail()).unwrap();

        wait_for(&attempts, 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn worker_gives_up_and_keeps_serving() {
        let attempts = Arc::new(AtomicU32::new(0));
        let transport = FlakyTransport {
            failures: 3,
            attempts: attempts.clone(),
        };
        let (queue, _worker) = MailQueue::start(transport, fast_policy(2));

        queue.enqueue(mail()).unwrap();
        wait_for(&attempts, 3).await;
        queue.enqueue(mail()).unwrap();
        wait_for(&attempts, 4).await;

        // Three failed tries for the first mail, then the second one goes through at once.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
