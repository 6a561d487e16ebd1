use mailparse::MailHeaderMap;

use crate::error::SmtpError;
use crate::mime;

/// A notification decoded from one DATA payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

impl Message {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Splits a DATA payload into subject and body text.
///
/// Multipart bodies yield their first plain-text leaf; anything else yields
/// the body after the header block, verbatim.
pub fn parse_message(data: &[u8]) -> Result<Message, SmtpError> {
    let (headers, offset) = mailparse::parse_headers(data)?;
    let body = &data[offset..];

    let subject = headers.get_first_value("Subject").unwrap_or_default();

    let text = match headers.get_first_value("Content-Type") {
        Some(value) => {
            let content_type = mailparse::parse_content_type(&value);
            if content_type.mimetype.starts_with("multipart/") {
                let boundary = content_type
                    .params
                    .get("boundary")
                    .map(String::as_str)
                    .unwrap_or("");
                mime::extract_plain_text(body, boundary)
            } else {
                String::from_utf8_lossy(body).into_owned()
            }
        }
        None => String::from_utf8_lossy(body).into_owned(),
    };

    Ok(Message::new(subject, text))
}
