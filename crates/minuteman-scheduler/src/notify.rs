//! Failure notifications by email.

use std::sync::Arc;

use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Address, SendmailTransport, SmtpTransport, Transport as _,
};
use minuteman_core::{JobConfig, MailSettings, MailerKind, SmtpSecurity};
use tracing::debug;

use crate::{
    error::{Result, SchedulerError},
    launcher::null_device,
};

pub use lettre::Message;

/// Delivers a composed message.
pub trait MailTransport: Send + Sync {
    fn send(&self, message: &Message) -> Result<()>;
}

/// SMTP delivery via lettre.
pub struct SmtpMailer {
    transport: SmtpTransport,
}

impl SmtpMailer {
    pub fn new(transport: SmtpTransport) -> Self {
        Self { transport }
    }
}

impl MailTransport for SmtpMailer {
    fn send(&self, message: &Message) -> Result<()> {
        self.transport
            .send(message)
            .map(|_| ())
            .map_err(|e| SchedulerError::Mail(e.to_string()))
    }
}

/// Local `sendmail` delivery.
pub struct SendmailMailer {
    transport: SendmailTransport,
}

impl Default for SendmailMailer {
    fn default() -> Self {
        Self {
            transport: SendmailTransport::new(),
        }
    }
}

impl MailTransport for SendmailMailer {
    fn send(&self, message: &Message) -> Result<()> {
        self.transport
            .send(message)
            .map_err(|e| SchedulerError::Mail(e.to_string()))
    }
}

/// Which transport a configuration resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Supplied to the notifier by the host application.
    External,
    /// Built from `mailer_dsn`.
    Dsn,
    /// Built from the explicit `smtp_*` settings.
    Smtp,
    /// The local sendmail binary.
    Sendmail,
}

/// Composes failure messages and hands them to the selected transport.
#[derive(Clone)]
pub struct Notifier {
    transport: Option<Arc<dyn MailTransport>>,
    hostname: String,
}

impl Notifier {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            transport: None,
            hostname: hostname.into(),
        }
    }

    /// Use `transport` for every job, overriding per-job mailer settings.
    pub fn with_transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Transport selection; depends on configuration only.
    pub fn transport_kind(&self, mail: &MailSettings) -> TransportKind {
        if self.transport.is_some() {
            TransportKind::External
        } else if mail.dsn.is_some() {
            TransportKind::Dsn
        } else if mail.mailer == MailerKind::Smtp {
            TransportKind::Smtp
        } else {
            TransportKind::Sendmail
        }
    }

    pub fn transport_for(&self, mail: &MailSettings) -> Result<Arc<dyn MailTransport>> {
        if let Some(transport) = &self.transport {
            return Ok(Arc::clone(transport));
        }
        let transport: Arc<dyn MailTransport> = match self.transport_kind(mail) {
            TransportKind::Dsn => {
                let dsn = mail.dsn.as_deref().unwrap_or_default();
                let transport = SmtpTransport::from_url(dsn)
                    .map_err(|e| SchedulerError::Mail(format!("invalid mailer_dsn: {e}")))?
                    .build();
                Arc::new(SmtpMailer::new(transport))
            }
            TransportKind::Smtp => Arc::new(SmtpMailer::new(smtp_transport(mail)?)),
            TransportKind::External | TransportKind::Sendmail => {
                Arc::new(SendmailMailer::default())
            }
        };
        Ok(transport)
    }

    /// Build the plaintext failure message for `job`.
    pub fn compose(&self, job: &str, config: &JobConfig, message: &str) -> Result<Message> {
        let host = &self.hostname;
        let sender = config
            .mail
            .sender
            .clone()
            .unwrap_or_else(|| format!("minuteman@{host}"));
        let address: Address = sender
            .parse()
            .map_err(|e| SchedulerError::Mail(format!("invalid sender '{sender}': {e}")))?;

        let mut builder = Message::builder()
            .from(Mailbox::new(
                Some(config.mail.sender_name.clone()),
                address.clone(),
            ))
            .sender(Mailbox::new(None, address))
            .subject(format!("[{host}] '{job}' needs some attention!"))
            .header(ContentType::TEXT_PLAIN);

        for recipient in &config.recipients {
            let mailbox: Mailbox = recipient.parse().map_err(|e| {
                SchedulerError::Mail(format!("invalid recipient '{recipient}': {e}"))
            })?;
            builder = builder.to(mailbox);
        }

        let body = format!(
            "{message}\n\nYou can find its output in {output} on {host}.\n\nBest,\nminuteman@{host}\n",
            output = config.output_description(null_device()),
        );

        builder
            .body(body)
            .map_err(|e| SchedulerError::Mail(e.to_string()))
    }

    /// Send a failure notification to every recipient of `config`.
    ///
    /// Returns `Ok(None)` without touching any transport when the recipient
    /// list is empty.
    pub fn notify(&self, job: &str, config: &JobConfig, message: &str) -> Result<Option<Message>> {
        if config.recipients.is_empty() {
            return Ok(None);
        }
        let email = self.compose(job, config, message)?;
        let transport = self.transport_for(&config.mail)?;
        transport.send(&email)?;
        debug!(job, recipients = config.recipients.len(), "notification sent");
        Ok(Some(email))
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("hostname", &self.hostname)
            .field("external_transport", &self.transport.is_some())
            .finish()
    }
}

fn smtp_transport(mail: &MailSettings) -> Result<SmtpTransport> {
    let host = mail.smtp_host.as_deref().ok_or_else(|| {
        SchedulerError::Mail("smtp mailer selected but smtp_host is not set".to_string())
    })?;

    let builder = match mail.smtp_security {
        Some(SmtpSecurity::Ssl) => SmtpTransport::relay(host),
        Some(SmtpSecurity::Tls) => SmtpTransport::starttls_relay(host),
        None => Ok(SmtpTransport::builder_dangerous(host)),
    }
    .map_err(|e| SchedulerError::Mail(e.to_string()))?;

    let mut builder = builder.port(mail.smtp_port);
    if let (Some(user), Some(password)) = (&mail.smtp_username, &mail.smtp_password) {
        builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
    }
    Ok(builder.build())
}
