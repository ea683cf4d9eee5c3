//! Transport layer.
//!
//! Two seams live here:
//! - [`SmtpTransport`]: one SMTP connection speaking the wire protocol
//! - [`MailTransport`]: anything that can carry an [`OutboundMessage`],
//!   either the pooled SMTP transport or the in-process simulation

pub mod pool;
pub mod pooled;
pub mod session;
pub mod simulated;
pub mod tls;

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;

use crate::config::{SmtpConfig, TlsMode};
use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};
use crate::types::{OutboundMessage, TransportKind, TransportReceipt};

pub use pool::{SmtpConnectionManager, SmtpPool};
pub use pooled::PooledTransport;
pub use session::{SessionParams, Transmission};
pub use simulated::SimulatedTransport;
pub use tls::TlsClient;

/// A carrier for hardened messages.
///
/// Implementations must stop work and release held resources once `cancel`
/// fires; the executor cancels on send timeout.
#[async_trait]
pub trait MailTransport: Send + Sync + fmt::Debug {
    /// Hands one message to the transport.
    async fn send(&self, message: &OutboundMessage, cancel: CancellationToken) -> DeliveryResult<TransportReceipt>;

    /// Checks that the transport can reach and authenticate to its server.
    async fn verify(&self) -> DeliveryResult<()>;

    /// Returns which class of transport this is.
    fn kind(&self) -> TransportKind;
}

/// One SMTP connection.
#[async_trait]
pub trait SmtpTransport: Send + Sync + fmt::Debug {
    /// Sends a command and reads its reply.
    async fn send_command(&mut self, command: &SmtpCommand) -> DeliveryResult<SmtpResponse>;

    /// Writes raw bytes (the DATA body).
    async fn send_data(&mut self, data: &[u8]) -> DeliveryResult<()>;

    /// Reads one complete reply.
    async fn read_response(&mut self) -> DeliveryResult<SmtpResponse>;

    /// Performs the TLS handshake over the current plaintext stream.
    async fn upgrade_tls(&mut self, tls: &TlsClient) -> DeliveryResult<()>;

    /// Returns true if the channel is encrypted.
    fn is_tls(&self) -> bool;

    /// Issues NOOP and expects 250.
    async fn health_check(&mut self) -> DeliveryResult<()> {
        let response = self.send_command(&SmtpCommand::Noop).await?;
        if response.code == codes::OK {
            Ok(())
        } else {
            Err(DeliveryError::new(
                DeliveryErrorKind::ConnectionUnhealthy,
                format!("Health check failed: {}", response),
            ))
        }
    }

    /// Sends QUIT and marks the connection closed.
    async fn close(&mut self) -> DeliveryResult<()>;

    /// Returns the session state.
    fn state(&self) -> TransactionState;

    /// Sets the session state.
    fn set_state(&mut self, state: TransactionState);

    /// Returns the capabilities from the last EHLO.
    fn capabilities(&self) -> Option<&EsmtpCapabilities>;

    /// Stores the capabilities from EHLO.
    fn set_capabilities(&mut self, caps: EsmtpCapabilities);

    /// Returns how many messages this connection has carried.
    fn messages_sent(&self) -> usize;

    /// Counts one more carried message.
    fn record_message_sent(&mut self);
}

enum TransportStream {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
    /// Stream moved out mid-upgrade, or lost to a failed handshake.
    Detached,
}

/// SMTP over TCP, optionally upgraded to TLS.
pub struct TcpTransport {
    stream: TransportStream,
    socket_timeout: Duration,
    state: TransactionState,
    capabilities: Option<EsmtpCapabilities>,
    host: String,
    messages_sent: usize,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.host)
            .field("tls", &self.is_tls())
            .field("state", &self.state)
            .field("messages_sent", &self.messages_sent)
            .finish()
    }
}

impl TcpTransport {
    /// Opens a connection and reads the greeting.
    ///
    /// With [`TlsMode::Implicit`] the handshake happens before the greeting.
    pub async fn connect(config: &SmtpConfig, tls: &TlsClient) -> DeliveryResult<Self> {
        let address = config.address();

        let stream = timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                DeliveryError::timeout(
                    DeliveryErrorKind::ConnectTimeout,
                    format!("Connect to {} timed out", address),
                )
            })?
            .map_err(|e| map_io_error(e, &address))?;

        stream.set_nodelay(true).ok();

        let mut transport = Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            socket_timeout: config.socket_timeout,
            state: TransactionState::Connected,
            capabilities: None,
            host: config.host.clone(),
            messages_sent: 0,
        };

        if config.tls.mode == TlsMode::Implicit {
            transport.upgrade_tls(tls).await?;
        }

        let greeting = transport.read_response().await?;
        if greeting.code != codes::SERVICE_READY {
            transport.state = TransactionState::Closed;
            return Err(greeting.into_error());
        }

        tracing::debug!(host = %transport.host, tls = transport.is_tls(), "Connected to SMTP server");
        Ok(transport)
    }

    async fn write(&mut self, data: &[u8]) -> DeliveryResult<()> {
        let result = match &mut self.stream {
            TransportStream::Plain(stream) => write_all(stream.get_mut(), data, self.socket_timeout).await,
            TransportStream::Tls(stream) => write_all(stream.get_mut(), data, self.socket_timeout).await,
            TransportStream::Detached => Err(closed()),
        };
        if result.is_err() {
            self.state = TransactionState::Closed;
        }
        result
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> DeliveryResult<SmtpResponse> {
        tracing::debug!(command = %command, "Sending SMTP command");
        self.write(format!("{}\r\n", command.to_line()).as_bytes()).await?;
        self.read_response().await
    }

    async fn send_data(&mut self, data: &[u8]) -> DeliveryResult<()> {
        self.write(data).await
    }

    async fn read_response(&mut self) -> DeliveryResult<SmtpResponse> {
        let result = match &mut self.stream {
            TransportStream::Plain(stream) => read_reply(stream, self.socket_timeout).await,
            TransportStream::Tls(stream) => read_reply(stream.as_mut(), self.socket_timeout).await,
            TransportStream::Detached => Err(closed()),
        };

        match result {
            Ok(response) => {
                tracing::debug!(code = response.code, text = %response.first_line(), "Received SMTP reply");
                if response.code == codes::SERVICE_UNAVAILABLE {
                    self.state = TransactionState::Closed;
                }
                Ok(response)
            }
            Err(e) => {
                self.state = TransactionState::Closed;
                Err(e)
            }
        }
    }

    async fn upgrade_tls(&mut self, tls: &TlsClient) -> DeliveryResult<()> {
        let tcp = match std::mem::replace(&mut self.stream, TransportStream::Detached) {
            TransportStream::Plain(reader) => reader.into_inner(),
            other => {
                self.stream = other;
                return Err(DeliveryError::tls("Connection is not in plaintext mode"));
            }
        };

        let handshake = timeout(self.socket_timeout, tls.connect(tcp)).await;
        let stream = match handshake {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state = TransactionState::Closed;
                return Err(DeliveryError::tls(format!("TLS handshake with {} failed: {}", self.host, e)));
            }
            Err(_) => {
                self.state = TransactionState::Closed;
                return Err(DeliveryError::timeout(
                    DeliveryErrorKind::ConnectTimeout,
                    "TLS handshake timed out",
                ));
            }
        };

        self.stream = TransportStream::Tls(Box::new(BufReader::new(stream)));
        tracing::debug!(host = %self.host, "TLS established");
        Ok(())
    }

    fn is_tls(&self) -> bool {
        matches!(self.stream, TransportStream::Tls(_))
    }

    async fn close(&mut self) -> DeliveryResult<()> {
        if self.state != TransactionState::Closed {
            let _ = self.send_command(&SmtpCommand::Quit).await;
            self.state = TransactionState::Closed;
        }
        Ok(())
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    fn capabilities(&self) -> Option<&EsmtpCapabilities> {
        self.capabilities.as_ref()
    }

    fn set_capabilities(&mut self, caps: EsmtpCapabilities) {
        self.capabilities = Some(caps);
    }

    fn messages_sent(&self) -> usize {
        self.messages_sent
    }

    fn record_message_sent(&mut self) {
        self.messages_sent += 1;
    }
}

async fn read_reply<R>(reader: &mut R, socket_timeout: Duration) -> DeliveryResult<SmtpResponse>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut lines = Vec::new();

    loop {
        let mut line = String::new();
        let read = timeout(socket_timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| DeliveryError::timeout(DeliveryErrorKind::ReadTimeout, "Read timed out"))?
            .map_err(|e| DeliveryError::new(DeliveryErrorKind::ConnectionReset, format!("Read error: {}", e)))?;

        if read == 0 {
            return Err(DeliveryError::new(
                DeliveryErrorKind::ConnectionReset,
                "Server closed connection",
            ));
        }

        let line = line.trim_end().to_string();
        let done = SmtpResponse::is_final_line(&line);
        lines.push(line);
        if done {
            break;
        }
    }

    SmtpResponse::parse(&lines)
}

async fn write_all<W>(writer: &mut W, data: &[u8], socket_timeout: Duration) -> DeliveryResult<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(socket_timeout, async {
        writer.write_all(data).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| DeliveryError::timeout(DeliveryErrorKind::WriteTimeout, "Write timed out"))?
    .map_err(|e| DeliveryError::new(DeliveryErrorKind::ConnectionReset, format!("Write error: {}", e)))
}

fn closed() -> DeliveryError {
    DeliveryError::new(DeliveryErrorKind::ConnectionReset, "Connection is closed")
}

fn map_io_error(error: io::Error, address: &str) -> DeliveryError {
    let err = match error.kind() {
        io::ErrorKind::ConnectionRefused => DeliveryError::new(
            DeliveryErrorKind::ConnectionRefused,
            format!("Connection refused by {}", address),
        ),
        io::ErrorKind::TimedOut => {
            DeliveryError::timeout(DeliveryErrorKind::ConnectTimeout, format!("Connect to {} timed out", address))
        }
        io::ErrorKind::ConnectionReset => {
            DeliveryError::new(DeliveryErrorKind::ConnectionReset, "Connection reset by server")
        }
        _ => DeliveryError::connection(format!("Cannot connect to {}: {}", address, error)),
    };
    err.with_cause(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn server(script: &'static [&'static str]) -> (SmtpConfig, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            for (i, reply) in script.iter().enumerate() {
                if i > 0 {
                    let n = socket.read(&mut buf).await.unwrap();
                    received.extend_from_slice(&buf[..n]);
                }
                socket.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        });

        let config = SmtpConfig::builder()
            .host("127.0.0.1")
            .port(port)
            .tls_mode(TlsMode::None)
            .build()
            .unwrap();
        (config, handle)
    }

    fn tls_client() -> TlsClient {
        TlsClient::new(&TlsConfig::default(), "localhost").unwrap()
    }

    #[tokio::test]
    async fn test_greeting_and_multiline_reply() {
        let (config, handle) = server(&[
            "220 mx.test ESMTP\r\n",
            "250-mx.test\r\n250-SIZE 1000\r\n250 8BITMIME\r\n",
            "221 bye\r\n",
        ])
        .await;

        let mut transport = TcpTransport::connect(&config, &tls_client()).await.unwrap();
        assert_eq!(transport.state(), TransactionState::Connected);
        assert!(!transport.is_tls());

        let ehlo = transport.send_command(&SmtpCommand::Ehlo("client".into())).await.unwrap();
        assert_eq!(ehlo.lines.len(), 3);
        assert_eq!(EsmtpCapabilities::from_ehlo(&ehlo).size, Some(1000));

        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransactionState::Closed);

        let received = String::from_utf8(handle.await.unwrap()).unwrap();
        assert!(received.starts_with("EHLO client\r\n"));
        assert!(received.ends_with("QUIT\r\n"));
    }

    #[tokio::test]
    async fn test_bad_greeting_is_error() {
        let (config, _handle) = server(&["554 go away\r\n"]).await;
        let err = TcpTransport::connect(&config, &tls_client()).await.unwrap_err();
        assert_eq!(err.smtp_code(), Some(554));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = SmtpConfig::builder().host("127.0.0.1").port(port).build().unwrap();
        let err = TcpTransport::connect(&config, &tls_client()).await.unwrap_err();
        assert_eq!(err.kind(), DeliveryErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_server_hangup_closes_transport() {
        let (config, handle) = server(&["220 mx.test\r\n"]).await;
        let mut transport = TcpTransport::connect(&config, &tls_client()).await.unwrap();
        handle.await.unwrap();

        assert!(transport.send_command(&SmtpCommand::Noop).await.is_err());
        assert_eq!(transport.state(), TransactionState::Closed);
    }
}
