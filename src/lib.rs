//! SMTP to notification bridge.
//!
//! Mail submitted over SMTP is authenticated against a registry of tenants,
//! its first plain-text part is extracted, and the resulting subject and body
//! are handed to the sink of the tenant the connection logged in as.

pub mod bridge;
pub mod config;
pub mod daemon;
pub mod error;
pub mod message;
pub mod mime;
pub mod registry;
pub mod server;
pub mod session;
pub mod sink;
pub mod utils;

pub use bridge::{Bridge, TenantContext};
pub use config::Opt;
pub use error::SmtpError;
pub use message::{parse_message, Message};
pub use mime::extract_plain_text;
pub use registry::{Tenant, TenantRegistry};
pub use server::Server;
pub use session::{Backend, SessionState, SmtpSession};
pub use sink::{DirectorySink, LogSink, MessageSink};
pub use utils::Logger;
