//! Pooled SMTP transport against a scripted local server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use integrations_mail_delivery::{
    Address, DeliveryErrorKind, DeliveryMetrics, MailTransport, OutboundMessage, PooledTransport, SmtpConfig, TlsMode,
    TransportKind,
};

/// What the server saw.
#[derive(Debug, Default)]
struct Transcript {
    connections: AtomicUsize,
    commands: Mutex<Vec<String>>,
    bodies: Mutex<Vec<String>>,
}

impl Transcript {
    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn count(&self, verb: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(verb)).count()
    }
}

/// Minimal submission server. Recipients in `nobody@` are refused and a
/// greeting of `greeting` is sent on connect.
async fn serve(greeting: &'static str) -> (u16, Arc<Transcript>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let transcript = Arc::new(Transcript::default());

    let shared = transcript.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { return };
            shared.connections.fetch_add(1, Ordering::SeqCst);
            let transcript = shared.clone();

            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read);
                write.write_all(greeting.as_bytes()).await.unwrap();

                let mut line = String::new();
                loop {
                    line.clear();
                    if lines.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let command = line.trim_end().to_string();
                    transcript.commands.lock().unwrap().push(command.clone());
                    let upper = command.to_ascii_uppercase();

                    let reply: &[u8] = if upper.starts_with("EHLO") {
                        b"250-mx.test greets you\r\n250-SIZE 1000000\r\n250-8BITMIME\r\n250 ENHANCEDSTATUSCODES\r\n"
                    } else if upper.starts_with("RCPT TO:<NOBODY@") {
                        b"550 5.1.1 No such user\r\n"
                    } else if upper.starts_with("DATA") {
                        write.write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await.unwrap();
                        let mut body = String::new();
                        loop {
                            line.clear();
                            if lines.read_line(&mut line).await.unwrap_or(0) == 0 {
                                return;
                            }
                            if line == ".\r\n" {
                                break;
                            }
                            body.push_str(&line);
                        }
                        transcript.bodies.lock().unwrap().push(body);
                        b"250 2.0.0 Ok: queued as 4F2A1\r\n"
                    } else if upper.starts_with("QUIT") {
                        let _ = write.write_all(b"221 2.0.0 Bye\r\n").await;
                        return;
                    } else {
                        b"250 2.0.0 OK\r\n"
                    };
                    write.write_all(reply).await.unwrap();
                }
            });
        }
    });

    (port, transcript)
}

fn transport(port: u16) -> PooledTransport {
    let config = SmtpConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .tls_mode(TlsMode::None)
        .client_id("client.test")
        .build()
        .unwrap();
    PooledTransport::new(config, Arc::new(DeliveryMetrics::new())).unwrap()
}

fn message(recipients: &[&str]) -> OutboundMessage {
    let mut message = OutboundMessage::new(
        Address::with_name("Brand", "sales@brand.example").unwrap(),
        "4c1d9e.1700000000000@brand.example",
    );
    for recipient in recipients {
        message.to.push(Address::new(*recipient).unwrap());
    }
    message.subject = "Partnership idea".to_string();
    message.text = Some("Hello there.\n\nThanks.".to_string());
    message
        .headers
        .push(("List-Unsubscribe".to_string(), "<mailto:unsubscribe@brand.example>".to_string()));
    message
}

#[tokio::test]
async fn test_send_reports_partial_rejection() {
    let (port, transcript) = serve("220 mx.test ESMTP\r\n").await;
    let transport = transport(port);

    let receipt = transport
        .send(&message(&["host@podcast.example", "nobody@podcast.example"]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(receipt.kind, TransportKind::Real);
    assert_eq!(receipt.message_id, "<4c1d9e.1700000000000@brand.example>");
    assert_eq!(receipt.accepted.len(), 1);
    assert_eq!(receipt.rejected.len(), 1);
    assert_eq!(receipt.rejected[0].code, 550);
    assert!(receipt.response.contains("queued"));

    let commands = transcript.commands();
    assert_eq!(commands[0], "EHLO client.test");
    assert!(commands[1].starts_with("MAIL FROM:<sales@brand.example>"));
    assert!(commands[1].contains("SIZE="));

    let bodies = transcript.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("Message-ID: <4c1d9e.1700000000000@brand.example>"));
    assert!(bodies[0].contains("Subject: Partnership idea"));
    assert!(bodies[0].contains("List-Unsubscribe: <mailto:unsubscribe@brand.example>"));
}

#[tokio::test]
async fn test_connection_is_reused_between_sends() {
    let (port, transcript) = serve("220 mx.test ESMTP\r\n").await;
    let transport = transport(port);

    for _ in 0..3 {
        transport
            .send(&message(&["host@podcast.example"]), CancellationToken::new())
            .await
            .unwrap();
    }

    assert_eq!(transcript.connections.load(Ordering::SeqCst), 1);
    assert_eq!(transcript.count("EHLO"), 1);
    assert_eq!(transcript.count("DATA"), 3);
    assert_eq!(transcript.count("NOOP"), 2);
}

#[tokio::test]
async fn test_all_recipients_refused() {
    let (port, transcript) = serve("220 mx.test ESMTP\r\n").await;
    let transport = transport(port);

    let err = transport
        .send(&message(&["nobody@podcast.example"]), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), DeliveryErrorKind::InvalidRecipientAddress);
    assert_eq!(err.smtp_code(), Some(550));
    assert_eq!(transcript.count("RSET"), 1);
    assert_eq!(transcript.count("DATA"), 0);
}

#[tokio::test]
async fn test_verify_runs_noop_without_mail() {
    let (port, transcript) = serve("220 mx.test ESMTP\r\n").await;
    let transport = transport(port);

    transport.verify().await.unwrap();

    assert_eq!(transcript.count("NOOP"), 1);
    assert_eq!(transcript.count("MAIL"), 0);
}

#[tokio::test]
async fn test_refusing_server_fails_verify() {
    let (port, _transcript) = serve("554 5.3.2 Not accepting connections\r\n").await;
    let transport = transport(port);

    let err = transport.verify().await.unwrap_err();
    assert_eq!(err.smtp_code(), Some(554));
}

#[tokio::test]
async fn test_cancelled_send_returns_cancelled() {
    let (port, _transcript) = serve("220 mx.test ESMTP\r\n").await;
    let transport = transport(port);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = transport
        .send(&message(&["host@podcast.example"]), cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), DeliveryErrorKind::Cancelled);
}
