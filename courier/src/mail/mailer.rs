//! Mailer trait and SMTP implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::PoolConfig;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Email, EmailBody, MailError};
use crate::config::EnvConfig;

/// Acknowledgement from the transport that a message was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub message_id: String,
}

/// Async email sending trait.
///
/// This is the only capability the queue needs from a mail provider.
/// Implement it to plug in alternative backends (SES, Mailgun, ...).
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    /// Send a fully composed email.
    async fn send(&self, email: &Email) -> Result<Delivery, MailError>;
}

#[async_trait]
impl<M: Mailer + ?Sized> Mailer for Arc<M> {
    async fn send(&self, email: &Email) -> Result<Delivery, MailError> {
        (**self).send(email).await
    }
}

/// Configuration for SMTP mailer.
#[derive(Debug, Clone, Deserialize)]
pub struct MailerConfig {
    /// SMTP server hostname.
    #[serde(rename = "smtp_host")]
    pub host: String,

    /// SMTP server port (default: 587).
    #[serde(rename = "smtp_port", default = "default_port")]
    pub port: u16,

    /// SMTP username for authentication.
    #[serde(rename = "smtp_username")]
    pub username: Option<String>,

    /// SMTP password for authentication.
    #[serde(rename = "smtp_password")]
    pub password: Option<String>,

    /// Default sender address.
    #[serde(rename = "smtp_from")]
    pub from: String,

    /// TLS mode: "starttls" (default), "tls", or "none".
    #[serde(rename = "smtp_tls", default = "default_tls")]
    pub tls: String,

    /// Connection timeout in seconds (default: 10).
    #[serde(rename = "smtp_timeout", default = "default_timeout")]
    pub timeout: u64,
}

fn default_port() -> u16 {
    587
}

fn default_tls() -> String {
    "starttls".to_string()
}

fn default_timeout() -> u64 {
    10
}

/// SMTP-based mailer using lettre.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Create a mailer from environment variables.
    ///
    /// Reads `SMTP_HOST`, `SMTP_PORT`, `SMTP_USERNAME`, `SMTP_PASSWORD`,
    /// `SMTP_FROM`, `SMTP_TLS`, `SMTP_TIMEOUT`.
    pub fn from_env(max_connections: u32) -> Result<Self, MailError> {
        dotenvy::dotenv().ok();

        let config =
            MailerConfig::from_env().map_err(|e| MailError::MissingConfig(e.to_string()))?;

        Self::from_config(config, max_connections)
    }

    /// Create a mailer from explicit configuration. The connection pool holds
    /// at most `max_connections` open SMTP connections.
    pub fn from_config(config: MailerConfig, max_connections: u32) -> Result<Self, MailError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|_| MailError::InvalidAddress(config.from.clone()))?;

        let mut builder = match config.tls.as_str() {
            "none" => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
            "tls" => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| MailError::Smtp(e.to_string()))?,
            _ => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| MailError::Smtp(e.to_string()))?,
        };

        builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout)))
            .pool_config(PoolConfig::new().max_size(max_connections.max(1)));

        if let (Some(username), Some(password)) = (config.username, config.password) {
            builder = builder.credentials(Credentials::new(username, password));
        }

        let transport = builder.build();

        Ok(Self {
            transport: Arc::new(transport),
            from,
        })
    }

    /// Build a lettre Message from our Email type.
    fn build_message(&self, email: &Email, message_id: &str) -> Result<Message, MailError> {
        let from_mailbox = if email.from.is_empty() {
            self.from.clone()
        } else {
            parse_mailbox(&email.from)?
        };

        let mut builder = Message::builder()
            .from(from_mailbox)
            .message_id(Some(message_id.to_string()));

        for to in &email.to {
            builder = builder.to(parse_mailbox(to)?);
        }
        for cc in &email.cc {
            builder = builder.cc(parse_mailbox(cc)?);
        }
        for bcc in &email.bcc {
            builder = builder.bcc(parse_mailbox(bcc)?);
        }
        if let Some(reply_to) = &email.reply_to {
            builder = builder.reply_to(parse_mailbox(reply_to)?);
        }

        for (name, value) in &email.headers {
            let name = HeaderName::new_from_ascii(name.clone())
                .map_err(|_| MailError::Build(format!("invalid header name: {name}")))?;
            builder = builder.raw_header(HeaderValue::new(name, value.clone()));
        }

        builder = builder.subject(&email.subject);

        let content = match &email.body {
            EmailBody::Text(text) => MultiPart::mixed().singlepart(SinglePart::plain(text.clone())),
            EmailBody::Html(html) => MultiPart::mixed().singlepart(SinglePart::html(html.clone())),
            EmailBody::Multipart { text, html } => MultiPart::mixed()
                .multipart(MultiPart::alternative_plain_html(text.clone(), html.clone())),
        };

        let content = email.attachments.iter().try_fold(content, |parts, file| {
            let content_type = ContentType::parse(&file.content_type)
                .map_err(|_| MailError::Build(format!("invalid content type: {}", file.content_type)))?;
            let part = lettre::message::Attachment::new(file.filename.clone())
                .body(file.content.clone(), content_type);
            Ok::<_, MailError>(parts.singlepart(part))
        })?;

        builder
            .multipart(content)
            .map_err(|e| MailError::Build(e.to_string()))
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address
        .parse()
        .map_err(|_| MailError::InvalidAddress(address.to_string()))
}

/// `<uuid@domain>` using the sender's domain.
pub(crate) fn new_message_id(from: &str) -> String {
    let domain = from
        .rsplit_once('@')
        .map(|(_, d)| d.trim_end_matches('>'))
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost");
    format!("<{}@{}>", Uuid::new_v4(), domain)
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &Email) -> Result<Delivery, MailError> {
        let sender = if email.from.is_empty() {
            self.from.email.to_string()
        } else {
            email.from.clone()
        };
        let message_id = new_message_id(&sender);
        let message = self.build_message(email, &message_id)?;

        self.transport.send(message).await.map_err(|e| {
            if e.is_permanent() {
                MailError::Rejected(e.to_string())
            } else {
                MailError::Smtp(e.to_string())
            }
        })?;

        Ok(Delivery { message_id })
    }
}

/// Development mailer that logs messages instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> Result<Delivery, MailError> {
        let message_id = new_message_id(&email.from);
        let body = match &email.body {
            EmailBody::Text(text) | EmailBody::Multipart { text, .. } => text.as_str(),
            EmailBody::Html(html) => html.as_str(),
        };
        tracing::info!(
            to = ?email.to,
            subject = %email.subject,
            %message_id,
            attachments = email.attachments.len(),
            "email send stub\n{body}"
        );
        Ok(Delivery { message_id })
    }
}
