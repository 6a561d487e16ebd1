use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-notify",
    about = "An SMTP endpoint that turns authenticated mail into per-tenant notifications",
    author = "2026, Philippe TEMESI <https://www.tems.be>",
    version = "0.1.0"
)]
pub struct Opt {
    /// Run as daemon
    #[structopt(short = "d", long = "daemon")]
    pub daemon: bool,

    /// Listening address (default: 0.0.0.0)
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Listening port (default: 1025)
    #[structopt(short = "p", long = "port", default_value = "1025")]
    pub port: u16,

    /// Domain advertised in the greeting and EHLO response
    #[structopt(long = "domain", default_value = "0.0.0.0")]
    pub domain: String,

    /// Read timeout in seconds
    #[structopt(long = "read-timeout", default_value = "10")]
    pub read_timeout_secs: u64,

    /// Write timeout in seconds
    #[structopt(long = "write-timeout", default_value = "10")]
    pub write_timeout_secs: u64,

    /// Maximum accepted message size in bytes
    #[structopt(long = "max-message-bytes", default_value = "1048576")]
    pub max_message_bytes: usize,

    /// Maximum number of recipients per message
    #[structopt(long = "max-recipients", default_value = "50")]
    pub max_recipients: usize,

    /// Refuse AUTH on the plaintext channel
    #[structopt(long = "deny-insecure-auth")]
    pub deny_insecure_auth: bool,

    /// Tenant identity to register at start-up (can be specified multiple times)
    #[structopt(short = "t", long = "tenant", number_of_values = 1)]
    pub tenants: Vec<String>,

    /// Directory in which notifications are written
    #[structopt(long = "data", parse(from_os_str))]
    pub data_dir: Option<PathBuf>,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - display SMTP details
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Enable raw display (not filtered) - DANGEROUS
    #[structopt(short = "r", long = "raw")]
    pub raw_display: bool,
}

impl Opt {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn allow_insecure_auth(&self) -> bool {
        !self.deny_insecure_auth
    }
}

impl Default for Opt {
    fn default() -> Self {
        Opt::from_iter(&["smtp-notify"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opt = Opt::default();
        assert_eq!(opt.listen_addr(), "0.0.0.0:1025");
        assert_eq!(opt.domain, "0.0.0.0");
        assert_eq!(opt.read_timeout(), Duration::from_secs(10));
        assert_eq!(opt.write_timeout(), Duration::from_secs(10));
        assert_eq!(opt.max_message_bytes, 1024 * 1024);
        assert_eq!(opt.max_recipients, 50);
        assert!(opt.allow_insecure_auth());
        assert!(opt.tenants.is_empty());
        assert!(!opt.daemon);
    }

    #[test]
    fn test_flags() {
        let opt = Opt::from_iter(&[
            "smtp-notify",
            "-p",
            "2525",
            "--tenant",
            "alice",
            "-t",
            "bob",
            "--deny-insecure-auth",
            "--max-recipients",
            "5",
        ]);
        assert_eq!(opt.port, 2525);
        assert_eq!(opt.tenants, vec!["alice", "bob"]);
        assert!(!opt.allow_insecure_auth());
        assert_eq!(opt.max_recipients, 5);
    }
}
