//! Outbound mail: one-time-code delivery through an HTTP mail relay.
//!
//! Single attempt per send; a failure is reported back to the flow and
//! the user, never retried here.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info};

use crate::error::{BotError, Result};

/// Hard cap on a single relay request.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait MailSender: Send + Sync {
    /// Dispatch the verification code to `email`. `Ok(())` means the
    /// relay accepted the message for delivery.
    async fn send(&self, email: &str, code: &str) -> Result<()>;
}

/// Mail sender posting JSON to an HTTP relay endpoint.
pub struct HttpMailSender {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl HttpMailSender {
    pub fn new(api_url: &str, api_key: &str, from: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| BotError::Mail {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
        })
    }
}

#[async_trait]
impl MailSender for HttpMailSender {
    async fn send(&self, email: &str, code: &str) -> Result<()> {
        let body = json!({
            "from": self.from,
            "to": email,
            "subject": "Email Verification Code",
            "html": render_verification_email(email, code),
        });

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Error sending verification email: {}", e);
                BotError::Mail {
                    message: e.to_string(),
                }
            })?;

        if let Err(e) = response.error_for_status_ref() {
            error!(
                "Mail relay rejected message for {}: {}",
                email,
                response.status()
            );
            return Err(e.into());
        }

        info!("Verification email sent to {}", email);
        Ok(())
    }
}

/// HTML body carrying the code. The layout mirrors what members of the
/// community already receive from the account portal.
pub fn render_verification_email(email: &str, code: &str) -> String {
    format!(
        r#"<div style="font-family: Arial, sans-serif; text-align: center; max-width: 600px; margin: auto; padding: 20px; border: 1px solid #ddd; border-radius: 10px;">
  <h2>Account Verification</h2>
  <p>Hello, <b>{email}</b></p>
  <p>To continue setting up your Discord access, please verify your account with the code below:</p>
  <p style="font-size:24px; font-weight:bold; letter-spacing:3px; background:#f5f5f5; padding:10px; border-radius:5px; display:inline-block;">{code}</p>
  <p>This code will expire in 10 minutes. Please do not share it with anyone.</p>
  <p>If you did not make this request, please ignore this email.</p>
</div>"#
    )
}
