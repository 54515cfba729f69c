//! Async SMTP delivery via lettre.
//!
//! A transport is built per send from the account's relay settings —
//! campaigns span accounts with different credentials, so there is no
//! shared mailer to pool.

use async_trait::async_trait;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::MailTransport;
use cadence_core::types::{OutboundEmail, SendReceipt, SmtpAccount};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// Production SMTP transport (STARTTLS relay).
pub struct Smtp;

impl Smtp {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Smtp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailTransport for Smtp {
    async fn send(&self, email: &OutboundEmail, account: &SmtpAccount) -> Result<SendReceipt> {
        let from_name = account.display_name.as_deref().unwrap_or(&account.email);
        let from_mailbox: Mailbox = format!("{from_name} <{}>", account.email)
            .parse()
            .map_err(|e| CadenceError::Transport(format!("Invalid from: {e}")))?;
        let to_mailbox: Mailbox = email
            .to
            .parse()
            .map_err(|e| CadenceError::Transport(format!("Invalid to: {e}")))?;

        // Assign the Message-ID ourselves so the send history can carry it.
        let message_id = format!("<{}@cadence>", uuid::Uuid::new_v4());

        let message = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(&email.subject)
            .message_id(Some(message_id.clone()))
            .multipart(MultiPart::alternative_plain_html(
                email.text_body.clone(),
                email.html_body.clone(),
            ))
            .map_err(|e| CadenceError::Transport(format!("Build email: {e}")))?;

        let creds = Credentials::new(account.email.clone(), account.password.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&account.smtp_host)
            .map_err(|e| CadenceError::Transport(format!("SMTP relay: {e}")))?
            .port(account.smtp_port)
            .credentials(creds)
            .build();

        mailer
            .send(message)
            .await
            .map_err(|e| CadenceError::Transport(format!("SMTP send: {e}")))?;

        tracing::info!("📤 Email sent to {} ({})", email.to, message_id);
        Ok(SendReceipt { message_id })
    }
}
