//! SMTP session: greeting through AUTH, then one mail transaction at a time.

use crate::auth::{self, AuthMethod, Credentials};
use crate::config::{SmtpConfig, TlsMode};
use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};
use crate::mime::prepare_data;
use crate::observability::DeliveryMetrics;
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};
use crate::types::{Address, OutboundMessage, RejectedRecipient};

use super::{SmtpTransport, TlsClient};

/// What a session needs to get from greeting to ready.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// EHLO identity.
    pub client_id: String,
    /// TLS policy.
    pub tls_mode: TlsMode,
    /// AUTH credentials, if the server requires them.
    pub credentials: Option<Credentials>,
    /// Forced mechanism.
    pub auth_method: Option<AuthMethod>,
}

impl SessionParams {
    /// Derives session parameters from transport configuration.
    pub fn from_config(config: &SmtpConfig) -> Self {
        let credentials = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username.clone(), password.clone())),
            _ => None,
        };

        Self {
            client_id: config.client_id().to_string(),
            tls_mode: config.tls.mode,
            credentials,
            auth_method: config.auth_method,
        }
    }
}

/// Server verdict on one mail transaction.
#[derive(Debug, Clone)]
pub struct Transmission {
    /// Recipients the server accepted.
    pub accepted: Vec<Address>,
    /// Recipients the server refused.
    pub rejected: Vec<RejectedRecipient>,
    /// Reply to the end of DATA.
    pub response: SmtpResponse,
}

/// Drives a freshly connected transport to [`TransactionState::Ready`].
pub async fn establish<T>(
    transport: &mut T,
    params: &SessionParams,
    tls: &TlsClient,
    metrics: &DeliveryMetrics,
) -> DeliveryResult<()>
where
    T: SmtpTransport + ?Sized,
{
    let mut caps = greet(transport, &params.client_id).await?;

    if !transport.is_tls() && matches!(params.tls_mode, TlsMode::StartTls | TlsMode::StartTlsRequired) {
        if caps.starttls {
            transport
                .send_command(&SmtpCommand::StartTls)
                .await?
                .expect_code(codes::SERVICE_READY)?;
            transport.upgrade_tls(tls).await?;
            metrics.record_tls_upgrade();
            caps = greet(transport, &params.client_id).await?;
        } else if params.tls_mode == TlsMode::StartTlsRequired {
            return Err(DeliveryError::new(
                DeliveryErrorKind::StarttlsNotSupported,
                "Server does not offer STARTTLS",
            ));
        } else {
            tracing::warn!("Server does not offer STARTTLS, continuing in plaintext");
        }
    }

    if let Some(credentials) = &params.credentials {
        let offered: Vec<AuthMethod> = caps.auth_mechanisms.iter().copied().collect();
        let method = auth::select_method(&offered, params.auth_method, transport.is_tls())?;

        let result = auth::authenticate(transport, credentials, method).await;
        metrics.record_auth(result.is_ok());
        result?;
        tracing::debug!(method = %method, "Authenticated");
    }

    transport.set_capabilities(caps);
    transport.set_state(TransactionState::Ready);
    Ok(())
}

async fn greet<T>(transport: &mut T, client_id: &str) -> DeliveryResult<EsmtpCapabilities>
where
    T: SmtpTransport + ?Sized,
{
    let ehlo = transport.send_command(&SmtpCommand::Ehlo(client_id.to_string())).await?;

    let caps = if ehlo.code == codes::OK {
        EsmtpCapabilities::from_ehlo(&ehlo)
    } else if matches!(ehlo.code, codes::SYNTAX_ERROR | codes::NOT_IMPLEMENTED) {
        transport
            .send_command(&SmtpCommand::Helo(client_id.to_string()))
            .await?
            .expect_code(codes::OK)?;
        EsmtpCapabilities::default()
    } else {
        return Err(ehlo.into_error());
    };

    transport.set_state(TransactionState::Greeted);
    Ok(caps)
}

/// Runs one mail transaction for `message` with an already-encoded body.
///
/// Recipients the server refuses are reported, not fatal, unless every
/// recipient is refused. Any failed reply resets the transaction so the
/// connection can be reused.
pub async fn transmit<T>(
    transport: &mut T,
    message: &OutboundMessage,
    encoded: &[u8],
    max_size: usize,
) -> DeliveryResult<Transmission>
where
    T: SmtpTransport + ?Sized,
{
    if !transport.state().can_start_mail() {
        return Err(DeliveryError::new(
            DeliveryErrorKind::ConnectionUnhealthy,
            format!("Connection not ready: {:?}", transport.state()),
        ));
    }

    let (server_limit, eight_bit) = transport
        .capabilities()
        .map(|c| (c.size, c.eight_bit_mime))
        .unwrap_or((None, false));

    let limit = server_limit.map_or(max_size, |s| s.min(max_size));
    if encoded.len() > limit {
        return Err(DeliveryError::message_error(
            DeliveryErrorKind::MessageTooLarge,
            format!("Message is {} bytes, limit is {}", encoded.len(), limit),
        ));
    }

    let mail_from = SmtpCommand::MailFrom {
        address: message.from.to_smtp(),
        size: server_limit.map(|_| encoded.len()),
        body_8bit: eight_bit,
    };
    let reply = transport.send_command(&mail_from).await?;
    if reply.code != codes::OK {
        reset(transport).await;
        return Err(reply.into_error());
    }
    transport.set_state(TransactionState::InTransaction);

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for recipient in message.all_recipients() {
        let reply = transport.send_command(&SmtpCommand::RcptTo(recipient.to_smtp())).await?;
        match reply.code {
            codes::OK | codes::WILL_FORWARD => accepted.push(recipient.clone()),
            codes::SERVICE_UNAVAILABLE => return Err(reply.into_error()),
            code => {
                tracing::warn!(recipient = %recipient.email(), code, "Recipient rejected");
                rejected.push(RejectedRecipient {
                    address: recipient.clone(),
                    code,
                    message: reply.text(),
                });
            }
        }
    }

    if accepted.is_empty() {
        reset(transport).await;
        let mut err = DeliveryError::message_error(
            DeliveryErrorKind::InvalidRecipientAddress,
            "All recipients were rejected",
        );
        if let Some(last) = rejected.last() {
            err = err.with_smtp_code(last.code);
        }
        return Err(err);
    }
    transport.set_state(TransactionState::RecipientsAdded);

    let reply = transport.send_command(&SmtpCommand::Data).await?;
    if reply.code != codes::START_MAIL_INPUT {
        reset(transport).await;
        return Err(reply.into_error());
    }
    transport.set_state(TransactionState::SendingData);

    transport.send_data(&prepare_data(encoded)).await?;
    let response = transport.read_response().await?;

    if response.code != codes::OK {
        // The server has closed the transaction itself after rejecting the body
        transport.set_state(TransactionState::Ready);
        return Err(response.into_error());
    }

    transport.set_state(TransactionState::Ready);
    transport.record_message_sent();

    Ok(Transmission {
        accepted,
        rejected,
        response,
    })
}

async fn reset<T>(transport: &mut T)
where
    T: SmtpTransport + ?Sized,
{
    match transport.send_command(&SmtpCommand::Rset).await {
        Ok(reply) if reply.code == codes::OK => transport.set_state(TransactionState::Ready),
        _ => transport.set_state(TransactionState::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use crate::mocks::{fixtures, MockTransport};
    use secrecy::SecretString;

    fn tls() -> TlsClient {
        TlsClient::new(&TlsConfig::default(), "localhost").unwrap()
    }

    fn params(mode: TlsMode, with_auth: bool) -> SessionParams {
        SessionParams {
            client_id: "client.test".into(),
            tls_mode: mode,
            credentials: with_auth.then(|| Credentials::new("user", SecretString::new("pw".into()))),
            auth_method: None,
        }
    }

    fn ready_transport() -> MockTransport {
        let mut transport = MockTransport::new();
        transport.set_state(TransactionState::Ready);
        transport
    }

    fn message(recipients: &[&str]) -> OutboundMessage {
        let mut msg = OutboundMessage::new(Address::new("sender@example.com").unwrap(), "id@example.com");
        for r in recipients {
            msg.to.push(Address::new(*r).unwrap());
        }
        msg
    }

    #[tokio::test]
    async fn test_establish_with_starttls_and_auth() {
        let mut transport = MockTransport::new();
        transport
            .queue_response(fixtures::ehlo_response())
            .queue_response(SmtpResponse::new(220, "2.0.0 Ready to start TLS"))
            .queue_response(fixtures::ehlo_response())
            .queue_response(SmtpResponse::new(235, "2.7.0 Accepted"));

        let metrics = DeliveryMetrics::new();
        establish(&mut transport, &params(TlsMode::StartTlsRequired, true), &tls(), &metrics)
            .await
            .unwrap();

        assert!(transport.is_tls());
        assert_eq!(transport.state(), TransactionState::Ready);
        let commands = transport.recorded_commands();
        assert_eq!(commands[1], SmtpCommand::StartTls);
        assert!(matches!(commands[3], SmtpCommand::Auth { ref mechanism, .. } if mechanism == "PLAIN"));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tls_upgrades, 1);
        assert_eq!(snapshot.auth_attempts, 1);
        assert_eq!(snapshot.auth_failures, 0);
    }

    #[tokio::test]
    async fn test_starttls_required_but_missing() {
        let mut transport = MockTransport::new();
        transport.queue_response(SmtpResponse::multiline(250, vec!["mx".into(), "AUTH PLAIN".into()]));

        let err = establish(&mut transport, &params(TlsMode::StartTlsRequired, true), &tls(), &DeliveryMetrics::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), DeliveryErrorKind::StarttlsNotSupported);
    }

    #[tokio::test]
    async fn test_helo_fallback() {
        let mut transport = MockTransport::new();
        transport
            .queue_response(SmtpResponse::new(502, "5.5.1 EHLO not implemented"))
            .queue_response(SmtpResponse::new(250, "mx.test"));

        establish(&mut transport, &params(TlsMode::None, false), &tls(), &DeliveryMetrics::new())
            .await
            .unwrap();

        let commands = transport.recorded_commands();
        assert_eq!(commands[1], SmtpCommand::Helo("client.test".into()));
        assert_eq!(transport.state(), TransactionState::Ready);
    }

    #[tokio::test]
    async fn test_transmit_partial_rejection() {
        let mut transport = ready_transport();
        transport
            .queue_ok()
            .queue_ok()
            .queue_error(550, "5.1.1 No such user")
            .queue_response(SmtpResponse::new(354, "Go ahead"))
            .queue_response(SmtpResponse::new(250, "2.0.0 Queued as ABC"));

        let msg = message(&["a@example.org", "b@example.org"]);
        let outcome = transmit(&mut transport, &msg, b"Subject: hi\r\n\r\n.body", 1024)
            .await
            .unwrap();

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.rejected[0].code, 550);
        assert_eq!(outcome.response.first_line(), "Queued as ABC");
        assert_eq!(transport.messages_sent(), 1);
        assert!(transport.state().is_idle());

        let data = transport.received_data();
        assert!(data[0].ends_with(b"\r\n..body\r\n.\r\n"));
    }

    #[tokio::test]
    async fn test_transmit_all_rejected_resets() {
        let mut transport = ready_transport();
        transport
            .queue_ok()
            .queue_error(550, "5.1.1 No such user")
            .queue_ok();

        let err = transmit(&mut transport, &message(&["a@example.org"]), b"body", 1024)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), DeliveryErrorKind::InvalidRecipientAddress);
        assert_eq!(transport.recorded_commands().last(), Some(&SmtpCommand::Rset));
        assert!(transport.state().is_idle());
    }

    #[tokio::test]
    async fn test_transmit_too_large() {
        let mut transport = ready_transport();
        let err = transmit(&mut transport, &message(&["a@example.org"]), &[b'x'; 64], 32)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), DeliveryErrorKind::MessageTooLarge);
        assert!(transport.recorded_commands().is_empty());
    }

    #[tokio::test]
    async fn test_transmit_requires_ready() {
        let mut transport = MockTransport::new();
        let err = transmit(&mut transport, &message(&["a@example.org"]), b"body", 1024)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), DeliveryErrorKind::ConnectionUnhealthy);
    }
}
