//! SMTP submission over lettre.
//!
//! A session owns exactly one `AsyncSmtpConnection`. Dialing connects, runs
//! STARTTLS as the TLS mode asks and authenticates; every send goes over that
//! same connection, and closing sends QUIT and waits for the reply.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::{Credentials, DEFAULT_MECHANISMS};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use tracing::{debug, info};

use super::{Dialer, Session, TransportError};
use crate::config::{SmtpConfig, TlsMode};
use crate::message::OutboundMessage;

/// Dials SMTP sessions against the configured relay.
#[derive(Debug, Clone)]
pub struct SmtpDialer {
    config: SmtpConfig,
}

impl SmtpDialer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    fn hello_name(&self) -> ClientId {
        ClientId::Domain(self.config.helo_name.clone())
    }

    fn tls_parameters(&self) -> Result<TlsParameters, TransportError> {
        TlsParameters::new(self.config.host.clone()).map_err(|e| TransportError::Tls(Box::new(e)))
    }

    async fn connect(&self) -> Result<AsyncSmtpConnection, TransportError> {
        let wrapper = match self.config.tls {
            TlsMode::Wrapper => Some(self.tls_parameters()?),
            _ => None,
        };

        AsyncSmtpConnection::connect_tokio1(
            (self.config.host.as_str(), self.config.port),
            Some(self.config.timeout),
            &self.hello_name(),
            wrapper,
            None,
        )
        .await
        .map_err(|e| TransportError::Connect(Box::new(e)))
    }

    async fn secure(&self, conn: &mut AsyncSmtpConnection) -> Result<(), TransportError> {
        let upgrade = match self.config.tls {
            TlsMode::StartTls => true,
            TlsMode::Opportunistic => conn.can_starttls(),
            TlsMode::Wrapper | TlsMode::None => false,
        };
        if !upgrade {
            return Ok(());
        }

        conn.starttls(self.tls_parameters()?, &self.hello_name())
            .await
            .map_err(|e| TransportError::Tls(Box::new(e)))?;
        debug!(host = %self.config.host, "smtp_starttls_done");
        Ok(())
    }

    async fn authenticate(&self, conn: &mut AsyncSmtpConnection) -> Result<(), TransportError> {
        if !self.config.has_credentials() {
            return Ok(());
        }
        let credentials = Credentials::new(
            self.config.user.clone().unwrap_or_default(),
            self.config.pass.clone().unwrap_or_default(),
        );

        conn.auth(DEFAULT_MECHANISMS, &credentials)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Auth(Box::new(e)))
    }
}

#[async_trait]
impl Dialer for SmtpDialer {
    type Session = SmtpSession;

    async fn dial(&self) -> Result<SmtpSession, TransportError> {
        debug!(
            host = %self.config.host,
            port = self.config.port,
            tls = ?self.config.tls,
            credentials_set = self.config.has_credentials(),
            "smtp_dialing"
        );

        let mut conn = self.connect().await?;

        let prepared = match self.secure(&mut conn).await {
            Ok(()) => self.authenticate(&mut conn).await,
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            conn.abort().await;
            return Err(e);
        }

        info!(
            host = %self.config.host,
            port = self.config.port,
            encrypted = conn.is_encrypted(),
            "smtp_connected"
        );
        Ok(SmtpSession { conn: Some(conn) })
    }
}

/// One open SMTP connection.
pub struct SmtpSession {
    conn: Option<AsyncSmtpConnection>,
}

#[async_trait]
impl Session for SmtpSession {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| TransportError::Send("session already closed".into()))?;

        conn.send(message.envelope(), message.formatted())
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(Box::new(e)))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        match conn.quit().await {
            Ok(_) => {
                debug!("smtp_quit_acknowledged");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "smtp_quit_failed");
                conn.abort().await;
                Err(TransportError::Close(Box::new(e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Debug, Default)]
    struct RelayLog {
        accepts: usize,
        commands: Vec<String>,
        messages: usize,
        quit: bool,
    }

    impl RelayLog {
        fn count(&self, verb: &str) -> usize {
            self.commands
                .iter()
                .filter(|c| c.to_ascii_uppercase().starts_with(verb))
                .count()
        }
    }

    /// Plaintext SMTP relay on a loopback port. It offers no STARTTLS and no
    /// AUTH, and hangs up after `hang_up_after` messages when set.
    async fn fake_relay(hang_up_after: Option<usize>) -> (u16, Arc<Mutex<RelayLog>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(RelayLog::default()));

        let relay_log = Arc::clone(&log);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                relay_log.lock().unwrap().accepts += 1;
                tokio::spawn(serve(stream, Arc::clone(&relay_log), hang_up_after));
            }
        });

        (port, log)
    }

    async fn serve(stream: TcpStream, log: Arc<Mutex<RelayLog>>, hang_up_after: Option<usize>) {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut in_data = false;

        if write.write_all(b"220 relay.test ESMTP\r\n").await.is_err() {
            return;
        }

        while let Ok(Some(line)) = lines.next_line().await {
            if in_data {
                if line == "." {
                    in_data = false;
                    let messages = {
                        let mut log = log.lock().unwrap();
                        log.messages += 1;
                        log.messages
                    };
                    if write.write_all(b"250 2.0.0 queued\r\n").await.is_err() {
                        return;
                    }
                    if hang_up_after == Some(messages) {
                        return;
                    }
                }
                continue;
            }

            let verb = line.to_ascii_uppercase();
            log.lock().unwrap().commands.push(line);

            let reply: &[u8] = if verb.starts_with("EHLO") {
                b"250-relay.test\r\n250 8BITMIME\r\n"
            } else if verb.starts_with("DATA") {
                in_data = true;
                b"354 end data with <CR><LF>.<CR><LF>\r\n"
            } else if verb.starts_with("QUIT") {
                log.lock().unwrap().quit = true;
                let _ = write.write_all(b"221 2.0.0 bye\r\n").await;
                return;
            } else {
                b"250 2.1.0 ok\r\n"
            };

            if write.write_all(reply).await.is_err() {
                return;
            }
        }
    }

    fn message(subject: &str) -> OutboundMessage {
        let envelope = lettre::address::Envelope::new(
            Some("from@example.com".parse().unwrap()),
            vec!["to@example.com".parse().unwrap()],
        )
        .unwrap();
        let body = format!("Subject: {subject}\r\n\r\nhello\r\n");
        OutboundMessage::new(envelope, subject, body.into_bytes())
    }

    #[tokio::test]
    async fn test_session_reuses_one_connection_and_quits() {
        let (port, log) = fake_relay(None).await;
        // Port default: opportunistic TLS, plaintext since no STARTTLS is offered.
        let dialer = SmtpDialer::new(SmtpConfig::new("127.0.0.1", port));

        let mut session = dialer.dial().await.unwrap();
        session.send(&message("one")).await.unwrap();
        session.send(&message("two")).await.unwrap();
        session.close().await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.accepts, 1);
        assert_eq!(log.count("EHLO"), 1);
        assert_eq!(log.count("MAIL FROM"), 2);
        assert_eq!(log.count("NOOP"), 0);
        assert_eq!(log.messages, 2);
        assert!(log.quit, "QUIT must be answered before close returns");
    }

    #[tokio::test]
    async fn test_send_after_hang_up_fails_without_redial() {
        let (port, log) = fake_relay(Some(1)).await;
        let mut config = SmtpConfig::new("127.0.0.1", port);
        config.tls = TlsMode::None;

        let mut session = SmtpDialer::new(config).dial().await.unwrap();
        session.send(&message("one")).await.unwrap();

        let result = session.send(&message("two")).await;
        assert!(matches!(result, Err(TransportError::Send(_))));

        let log = log.lock().unwrap();
        assert_eq!(log.accepts, 1);
        assert_eq!(log.messages, 1);
    }

    #[tokio::test]
    async fn test_required_starttls_not_offered_fails_dial() {
        let (port, log) = fake_relay(None).await;
        let mut config = SmtpConfig::new("127.0.0.1", port);
        config.tls = TlsMode::StartTls;

        let result = SmtpDialer::new(config).dial().await;
        assert!(matches!(result, Err(TransportError::Tls(_))));

        let log = log.lock().unwrap();
        assert_eq!(log.count("STARTTLS"), 0);
        assert!(log.quit);
    }

    #[tokio::test]
    async fn test_auth_without_server_support_fails_dial() {
        let (port, log) = fake_relay(None).await;
        let mut config = SmtpConfig::new("127.0.0.1", port).with_credentials("user", "secret");
        config.tls = TlsMode::None;

        let result = SmtpDialer::new(config).dial().await;
        assert!(matches!(result, Err(TransportError::Auth(_))));
        assert_eq!(log.lock().unwrap().count("MAIL FROM"), 0);
    }

    #[tokio::test]
    async fn test_dial_unreachable_host_fails() {
        let mut config = SmtpConfig::new("127.0.0.1", 1);
        config.tls = TlsMode::None;
        config.timeout = std::time::Duration::from_secs(2);

        let result = SmtpDialer::new(config).dial().await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_send() {
        let (port, _log) = fake_relay(None).await;
        let mut session = SmtpDialer::new(SmtpConfig::new("127.0.0.1", port))
            .dial()
            .await
            .unwrap();

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(session.send(&message("late")).await, Err(TransportError::Send(_))));
    }
}
