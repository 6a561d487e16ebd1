//! Errors surfaced to the SMTP client

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("user not found")]
    UserNotFound,

    #[error("authentication required")]
    AuthRequired,

    #[error("malformed message: {0}")]
    Parse(#[from] mailparse::MailParseError),

    #[error("delivery failed: {0:#}")]
    Sink(anyhow::Error),

    #[error("bad sequence of commands: {0}")]
    BadSequence(&'static str),

    #[error("too many recipients (max {max})")]
    TooManyRecipients { max: usize },

    #[error("message exceeds fixed maximum message size (max {max} bytes)")]
    MessageTooLarge { max: usize },
}

impl SmtpError {
    /// The reply line sent to the client for this error.
    pub fn reply(&self) -> String {
        let (code, enhanced) = match self {
            SmtpError::UserNotFound => (535, "5.7.8"),
            SmtpError::AuthRequired => (530, "5.7.0"),
            SmtpError::Parse(_) => (554, "5.6.0"),
            SmtpError::Sink(_) => (451, "4.3.0"),
            SmtpError::BadSequence(_) => (503, "5.5.1"),
            SmtpError::TooManyRecipients { .. } => (452, "4.5.3"),
            SmtpError::MessageTooLarge { .. } => (552, "5.3.4"),
        };

        match self {
            SmtpError::UserNotFound => {
                format!("{} {} Authentication failed: {}\r\n", code, enhanced, self)
            }
            _ => format!("{} {} {}\r\n", code, enhanced, capitalize(&self.to_string())),
        }
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_not_found_reply() {
        assert_eq!(
            SmtpError::UserNotFound.reply(),
            "535 5.7.8 Authentication failed: user not found\r\n"
        );
    }

    #[test]
    fn test_auth_required_reply() {
        assert_eq!(
            SmtpError::AuthRequired.reply(),
            "530 5.7.0 Authentication required\r\n"
        );
    }

    #[test]
    fn test_sink_error_is_transient() {
        let err = SmtpError::Sink(anyhow::anyhow!("notification channel closed"));
        assert_eq!(
            err.reply(),
            "451 4.3.0 Delivery failed: notification channel closed\r\n"
        );
    }

    #[test]
    fn test_limits_in_reply() {
        assert!(SmtpError::TooManyRecipients { max: 50 }
            .reply()
            .starts_with("452 4.5.3 Too many recipients (max 50)"));
        assert!(SmtpError::MessageTooLarge { max: 1024 }
            .reply()
            .starts_with("552 5.3.4 "));
    }
}
