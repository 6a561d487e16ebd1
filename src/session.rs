//! Authentication backend and the per-connection session it hands out

use std::sync::Arc;

use crate::error::SmtpError;
use crate::message;
use crate::registry::{Tenant, TenantRegistry};

/// Resolves SMTP identities against the tenant registry.
#[derive(Clone)]
pub struct Backend {
    registry: Arc<TenantRegistry>,
}

impl Backend {
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self { registry }
    }

    /// Binds a new session to the tenant registered under `identity`.
    ///
    /// The credential is not checked: a registered identity is enough.
    pub async fn login(&self, identity: &str, _credential: &str) -> Result<SmtpSession, SmtpError> {
        match self.registry.resolve(identity).await {
            Some(tenant) => Ok(SmtpSession::new(tenant)),
            None => Err(SmtpError::UserNotFound),
        }
    }

    /// Unauthenticated senders are never accepted.
    pub fn anonymous_login(&self) -> Result<SmtpSession, SmtpError> {
        Err(SmtpError::AuthRequired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Logged in, no transaction open
    Authenticated,
    MailReceived,
    RecipientsReceived,
    ReceivingData,
}

/// State of one authenticated connection.
#[derive(Debug)]
pub struct SmtpSession {
    tenant: Tenant,
    state: SessionState,
    recipients: usize,
}

impl SmtpSession {
    fn new(tenant: Tenant) -> Self {
        Self {
            tenant,
            state: SessionState::Authenticated,
            recipients: 0,
        }
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn recipient_count(&self) -> usize {
        self.recipients
    }

    /// Opens a transaction. The sender address is neither checked nor kept.
    pub fn mail(&mut self, _from: &str) -> Result<(), SmtpError> {
        if self.state != SessionState::Authenticated {
            return Err(SmtpError::BadSequence("nested MAIL command"));
        }
        self.state = SessionState::MailReceived;
        Ok(())
    }

    /// Accepts any recipient; only the count is kept.
    pub fn rcpt(&mut self, _to: &str) -> Result<(), SmtpError> {
        match self.state {
            SessionState::MailReceived | SessionState::RecipientsReceived => {
                self.recipients += 1;
                self.state = SessionState::RecipientsReceived;
                Ok(())
            }
            _ => Err(SmtpError::BadSequence("need MAIL before RCPT")),
        }
    }

    pub fn begin_data(&mut self) -> Result<(), SmtpError> {
        if self.state != SessionState::RecipientsReceived {
            return Err(SmtpError::BadSequence("need RCPT before DATA"));
        }
        self.state = SessionState::ReceivingData;
        Ok(())
    }

    /// Parses the DATA payload and hands it to the tenant's sink, if any.
    ///
    /// The transaction is closed whatever the outcome.
    pub async fn data(&mut self, body: &[u8]) -> Result<(), SmtpError> {
        if self.state != SessionState::ReceivingData {
            return Err(SmtpError::BadSequence("need DATA command first"));
        }
        self.reset();

        let message = message::parse_message(body)?;

        if let Some(sink) = self.tenant.sink() {
            sink.accept(message).await.map_err(SmtpError::Sink)?;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.state = SessionState::Authenticated;
        self.recipients = 0;
    }

    pub fn logout(self) -> Result<(), SmtpError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::message::Message;
    use tokio::sync::mpsc;

    async fn backend_with(identity: &str) -> (Backend, mpsc::UnboundedReceiver<Message>) {
        let registry = Arc::new(TenantRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .register(identity, Tenant::new(identity).with_sink(Arc::new(tx)))
            .await;
        (Backend::new(registry), rx)
    }

    async fn deliver(session: &mut SmtpSession, body: &[u8]) -> Result<(), SmtpError> {
        session.mail("monitor@example.com")?;
        session.rcpt("anyone")?;
        session.begin_data()?;
        session.data(body).await
    }

    #[tokio::test]
    async fn test_login_registered_identity_any_credential() {
        let (backend, _rx) = backend_with("alerts").await;
        for credential in ["", "secret", "wrong"] {
            let session = backend.login("alerts", credential).await.unwrap();
            assert_eq!(session.tenant().identity(), "alerts");
            assert_eq!(session.state(), SessionState::Authenticated);
        }
    }

    #[tokio::test]
    async fn test_login_unknown_identity() {
        let (backend, _rx) = backend_with("alerts").await;
        let err = backend.login("intruder", "secret").await.unwrap_err();
        assert!(matches!(err, SmtpError::UserNotFound));
        assert_eq!(err.to_string(), "user not found");
    }

    #[tokio::test]
    async fn test_anonymous_login_fails() {
        let (backend, _rx) = backend_with("alerts").await;
        assert!(matches!(
            backend.anonymous_login(),
            Err(SmtpError::AuthRequired)
        ));
    }

    #[tokio::test]
    async fn test_data_delivers_to_sink() {
        let (backend, mut rx) = backend_with("alerts").await;
        let mut session = backend.login("alerts", "x").await.unwrap();

        deliver(&mut session, b"Subject: CPU\n\nload 12").await.unwrap();
        assert_eq!(rx.recv().await, Some(Message::new("CPU", "load 12")));
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(session.recipient_count(), 0);

        // a second transaction on the same session
        deliver(&mut session, b"Subject: CPU\n\nload 3").await.unwrap();
        assert_eq!(rx.recv().await, Some(Message::new("CPU", "load 3")));
    }

    #[tokio::test]
    async fn test_tenant_without_sink_drops_silently() {
        let registry = Arc::new(TenantRegistry::new());
        registry.register("quiet", Tenant::new("quiet")).await;
        let backend = Backend::new(registry);

        let mut session = backend.login("quiet", "").await.unwrap();
        deliver(&mut session, b"Subject: x\n\ny").await.unwrap();
    }

    #[tokio::test]
    async fn test_sink_error_is_reported() {
        let (backend, rx) = backend_with("alerts").await;
        drop(rx);
        let mut session = backend.login("alerts", "").await.unwrap();
        let err = deliver(&mut session, b"Subject: x\n\ny").await.unwrap_err();
        assert!(matches!(err, SmtpError::Sink(_)));
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_session_keeps_tenant_resolved_at_login() {
        let registry = Arc::new(TenantRegistry::new());
        let (old_tx, mut old_rx) = mpsc::unbounded_channel::<Message>();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel::<Message>();
        registry
            .register("ops", Tenant::new("ops").with_sink(Arc::new(old_tx)))
            .await;
        let backend = Backend::new(registry.clone());

        let mut session = backend.login("ops", "").await.unwrap();
        registry
            .register("ops", Tenant::new("ops").with_sink(Arc::new(new_tx)))
            .await;

        deliver(&mut session, b"Subject: a\n\nb").await.unwrap();
        assert_eq!(old_rx.recv().await, Some(Message::new("a", "b")));
        assert!(new_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_command_sequence() {
        let (backend, _rx) = backend_with("alerts").await;
        let mut session = backend.login("alerts", "").await.unwrap();

        assert!(matches!(session.rcpt("a"), Err(SmtpError::BadSequence(_))));
        assert!(matches!(session.begin_data(), Err(SmtpError::BadSequence(_))));

        session.mail("").unwrap();
        assert!(matches!(session.mail(""), Err(SmtpError::BadSequence(_))));
        assert!(matches!(session.begin_data(), Err(SmtpError::BadSequence(_))));

        session.rcpt("a").unwrap();
        session.rcpt("b").unwrap();
        assert_eq!(session.recipient_count(), 2);

        session.reset();
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(session.recipient_count(), 0);
        assert_eq!(session.tenant().identity(), "alerts");

        assert!(session.logout().is_ok());
    }
}
