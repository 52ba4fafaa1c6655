use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    // Verification flow errors (each one terminal for the session)
    #[error("verification already in progress for user {user_id}")]
    SessionAlreadyActive { user_id: String },

    #[error("bot lacks required permissions in guild {guild_id}")]
    InsufficientPermissions { guild_id: String },

    #[error("user {user_id} is already verified in guild {guild_id}")]
    AlreadyVerified { user_id: String, guild_id: String },

    #[error("no reply received within {seconds} seconds")]
    ResponseTimeout { seconds: u64 },

    #[error("email domain is not on the guild allowlist")]
    DomainNotAllowed { allowed: Vec<String> },

    #[error("verification email was not accepted for delivery")]
    EmailDeliveryFailed,

    #[error("submitted code did not match an open verification record")]
    InvalidCode,

    #[error("failed to assign role '{role}' in guild {guild_id}: {reason}")]
    RoleAssignmentFailed {
        role: String,
        guild_id: String,
        reason: String,
    },

    #[error("failed to create role '{role}' in guild {guild_id}: {reason}")]
    RoleCreationFailed {
        role: String,
        guild_id: String,
        reason: String,
    },

    #[error("external call '{call}' did not complete within {seconds} seconds")]
    ExternalService { call: String, seconds: u64 },

    #[error("could not open a DM channel to user {user_id}")]
    DmUnreachable { user_id: String },

    // Store errors
    #[error("failed to save state to '{path}': {source}")]
    StateSave {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load state from '{path}': {source}")]
    StateLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file '{path}': {source}")]
    StateParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    // Configuration errors
    #[error("invalid config: {message}")]
    ConfigValidation { message: String },

    // Discord errors
    #[error("Discord API error: {message}")]
    Discord { message: String },

    #[error("guild not found: {id}")]
    GuildNotFound { id: String },

    // Mail transport errors
    #[error("mail transport error: {message}")]
    Mail { message: String },

    // Generic errors
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl BotError {
    /// The single DM sent to the end user when this error terminates a
    /// verification session. Operator detail (hierarchy reports, transport
    /// errors) goes to the log, never into these strings.
    pub fn user_message(&self) -> String {
        match self {
            BotError::SessionAlreadyActive { .. } => {
                "⏳ You already have an active verification process. Please complete it first."
                    .to_string()
            }
            BotError::InsufficientPermissions { .. } => {
                "❌ Bot is missing required permissions. Please contact an administrator to:\n\
                 1. Ensure bot role is ABOVE the verified role\n\
                 2. Enable 'Manage Roles' permission for the bot"
                    .to_string()
            }
            BotError::AlreadyVerified { .. } => {
                "✅ You are already verified in this server.".to_string()
            }
            BotError::ResponseTimeout { seconds } if *seconds <= 60 => {
                "⏰ You took too long to respond. Please use `.verify` again.".to_string()
            }
            BotError::ResponseTimeout { .. } => {
                "⏰ Verification timed out. Please use `.verify` again.".to_string()
            }
            BotError::DomainNotAllowed { allowed } => {
                let list = if allowed.is_empty() {
                    "None configured".to_string()
                } else {
                    allowed.join(", ")
                };
                format!("❌ The email domain is not allowed. Allowed domains: {list}")
            }
            BotError::EmailDeliveryFailed => {
                "❌ Failed to send verification email. Please try again later.".to_string()
            }
            // InvalidCode and role failures share one deliberately generic
            // message: the user learns nothing about which part mismatched.
            BotError::InvalidCode
            | BotError::RoleAssignmentFailed { .. }
            | BotError::RoleCreationFailed { .. } => {
                "❌ Verification failed. Please start again with `.verify`. \
                 If the problem persists, contact a server administrator."
                    .to_string()
            }
            BotError::DmUnreachable { .. } => {
                "I could not send you a DM. Please check your privacy settings.".to_string()
            }
            _ => "❌ An error occurred. Please try again.".to_string(),
        }
    }
}

impl From<serenity::Error> for BotError {
    fn from(err: serenity::Error) -> Self {
        BotError::Discord {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        BotError::Mail {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;

use poise::serenity_prelude as serenity;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_code_and_role_failure_share_one_generic_message() {
        let invalid = BotError::InvalidCode.user_message();
        let role = BotError::RoleAssignmentFailed {
            role: "Verified".to_string(),
            guild_id: "1".to_string(),
            reason: "hierarchy".to_string(),
        }
        .user_message();
        assert_eq!(invalid, role);
        assert!(!invalid.is_empty());
    }

    #[test]
    fn domain_not_allowed_lists_domains_or_placeholder() {
        let none = BotError::DomainNotAllowed { allowed: vec![] }.user_message();
        assert!(none.contains("None configured"));

        let some = BotError::DomainNotAllowed {
            allowed: vec!["csi.edu".to_string(), "sakec.ac.in".to_string()],
        }
        .user_message();
        assert!(some.contains("csi.edu, sakec.ac.in"));
    }

    #[test]
    fn timeout_message_depends_on_wait_window() {
        let email = BotError::ResponseTimeout { seconds: 60 }.user_message();
        let otp = BotError::ResponseTimeout { seconds: 600 }.user_message();
        assert_ne!(email, otp);
    }
}
