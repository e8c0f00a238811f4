use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};

use crate::config::Config;

const OTP_SUBJECT: &str = "Your Chat Server OTP Code";

/// Delivers one-time codes to an email address.
///
/// `Smtp` is the production path. `File` writes each message into an outbox
/// directory instead of sending it, which keeps the whole auth flow runnable
/// offline (development and tests).
pub enum EmailSender {
    Smtp {
        transport: AsyncSmtpTransport<Tokio1Executor>,
        from: String,
    },
    File {
        dir: PathBuf,
        seq: AtomicU64,
    },
}

impl EmailSender {
    pub fn smtp_from_config(cfg: &Config) -> anyhow::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)
            .with_context(|| format!("bad SMTP relay host {:?}", cfg.smtp_host))?
            .port(cfg.smtp_port)
            .credentials(Credentials::new(
                cfg.smtp_email.clone(),
                cfg.smtp_password.clone(),
            ))
            .build();
        Ok(Self::Smtp {
            transport,
            from: cfg.smtp_email.clone(),
        })
    }

    pub fn file_outbox(dir: impl Into<PathBuf>) -> Self {
        Self::File {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// Deliver an OTP. Called outside all server guards; a slow relay blocks
    /// only the connection that requested the code.
    pub async fn send_otp(&self, to: &str, code: &str) -> anyhow::Result<()> {
        let body = otp_email_body(code);
        match self {
            EmailSender::Smtp { transport, from } => {
                let msg = LettreMessage::builder()
                    .from(from.parse::<Mailbox>().context("bad sender address")?)
                    .to(to.parse::<Mailbox>().context("bad recipient address")?)
                    .subject(OTP_SUBJECT)
                    .header(ContentType::TEXT_HTML)
                    .body(body)
                    .context("build email")?;
                transport
                    .send(msg)
                    .await
                    .context("failed to send email")?;
                Ok(())
            }
            EmailSender::File { dir, seq } => {
                let n = seq.fetch_add(1, Ordering::Relaxed);
                let path = dir.join(format!("{n:04}.eml"));
                let raw = format!("To: {to}\r\nSubject: {OTP_SUBJECT}\r\n\r\n{body}");
                std::fs::write(&path, raw)
                    .with_context(|| format!("write outbox file {}", path.display()))?;
                Ok(())
            }
        }
    }
}

fn otp_email_body(code: &str) -> String {
    format!(
        "<!DOCTYPE html>\n\
<html>\n\
<body>\n\
  <h2>Your One-Time Password</h2>\n\
  <p>You have requested to authenticate with our chat server. Please use the\n\
  following OTP code to complete your login:</p>\n\
  <div style=\"font-size:32px;font-weight:bold;letter-spacing:5px\">{code}</div>\n\
  <p><strong>Important:</strong></p>\n\
  <ul>\n\
    <li>This code will expire in 5 minutes</li>\n\
    <li>This code can only be used once</li>\n\
    <li>Do not share this code with anyone</li>\n\
  </ul>\n\
  <p>If you did not request this code, please ignore this email.</p>\n\
</body>\n\
</html>\n"
    )
}
