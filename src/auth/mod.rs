//! SMTP AUTH for the delivery transport.
//!
//! Supports the password mechanisms mail providers actually offer to
//! submission clients:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely used)
//! - CRAM-MD5 (RFC 2195)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};
use crate::protocol::{codes, SmtpCommand, SmtpResponse};
use crate::transport::SmtpTransport;

/// Authentication methods supported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication.
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
}

impl AuthMethod {
    /// Returns the SASL mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::CramMd5 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses an EHLO AUTH keyword.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            _ => None,
        }
    }

    /// Returns true if the secret crosses the wire recoverably.
    pub fn requires_tls(&self) -> bool {
        matches!(self, AuthMethod::Plain | AuthMethod::Login)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mechanism_name())
    }
}

/// Username and password for SMTP AUTH.
#[derive(Clone)]
pub struct Credentials {
    /// Login name.
    pub username: String,
    /// Password or app password.
    pub password: SecretString,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Builds the PLAIN initial response: `\0username\0password`.
pub fn plain_initial_response(username: &str, password: &SecretString) -> String {
    BASE64.encode(format!("\0{}\0{}", username, password.expose_secret()))
}

/// Builds the CRAM-MD5 reply to a base64 challenge.
pub fn cram_md5_response(challenge: &str, username: &str, password: &SecretString) -> DeliveryResult<String> {
    let challenge = BASE64
        .decode(challenge.trim())
        .map_err(|e| DeliveryError::authentication(format!("Invalid CRAM-MD5 challenge: {}", e)))?;

    let mut mac = Hmac::<Md5>::new_from_slice(password.expose_secret().as_bytes())
        .map_err(|e| DeliveryError::authentication(format!("HMAC error: {}", e)))?;
    mac.update(&challenge);
    let digest: String = mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    Ok(BASE64.encode(format!("{} {}", username, digest)))
}

/// Chooses the mechanism for a session.
///
/// A configured preference wins when the server offers it; otherwise the
/// strongest advertised mechanism allowed on the channel is used.
pub fn select_method(
    offered: &[AuthMethod],
    preferred: Option<AuthMethod>,
    is_tls: bool,
) -> DeliveryResult<AuthMethod> {
    let usable = |m: &AuthMethod| is_tls || !m.requires_tls();

    if let Some(preferred) = preferred {
        if offered.contains(&preferred) && usable(&preferred) {
            return Ok(preferred);
        }
        return Err(DeliveryError::new(
            DeliveryErrorKind::AuthMethodNotSupported,
            format!("Preferred auth method {} not available", preferred),
        ));
    }

    offered
        .iter()
        .copied()
        .filter(usable)
        .max_by_key(AuthMethod::priority)
        .ok_or_else(|| {
            DeliveryError::new(
                DeliveryErrorKind::AuthMethodNotSupported,
                "No compatible authentication method available",
            )
        })
}

/// Runs the SASL exchange for `method` over an established session.
pub async fn authenticate<T>(transport: &mut T, credentials: &Credentials, method: AuthMethod) -> DeliveryResult<()>
where
    T: SmtpTransport + ?Sized,
{
    let final_reply = match method {
        AuthMethod::Plain => {
            let initial = plain_initial_response(&credentials.username, &credentials.password);
            transport
                .send_command(&SmtpCommand::Auth {
                    mechanism: method.mechanism_name().to_string(),
                    initial_response: Some(initial),
                })
                .await?
        }
        AuthMethod::Login => {
            start(transport, method).await?;
            transport
                .send_command(&SmtpCommand::AuthResponse(BASE64.encode(&credentials.username)))
                .await?
                .expect_code(codes::AUTH_CONTINUE)?;
            transport
                .send_command(&SmtpCommand::AuthResponse(
                    BASE64.encode(credentials.password.expose_secret()),
                ))
                .await?
        }
        AuthMethod::CramMd5 => {
            let challenge = start(transport, method).await?;
            let answer = cram_md5_response(challenge.first_line(), &credentials.username, &credentials.password)?;
            transport.send_command(&SmtpCommand::AuthResponse(answer)).await?
        }
    };

    match final_reply.code {
        codes::AUTH_SUCCESS => Ok(()),
        _ => Err(final_reply.into_error()),
    }
}

async fn start<T: SmtpTransport + ?Sized>(transport: &mut T, method: AuthMethod) -> DeliveryResult<SmtpResponse> {
    transport
        .send_command(&SmtpCommand::Auth {
            mechanism: method.mechanism_name().to_string(),
            initial_response: None,
        })
        .await?
        .expect_code(codes::AUTH_CONTINUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockTransport;

    fn creds() -> Credentials {
        Credentials::new("user", SecretString::new("password".to_string()))
    }

    #[test]
    fn test_from_capability() {
        assert_eq!(AuthMethod::from_capability("login"), Some(AuthMethod::Login));
        assert_eq!(AuthMethod::from_capability("CRAM-MD5"), Some(AuthMethod::CramMd5));
        assert_eq!(AuthMethod::from_capability("XOAUTH2"), None);
    }

    #[test]
    fn test_plain_initial_response() {
        let response = plain_initial_response("user", &SecretString::new("password".to_string()));
        assert_eq!(BASE64.decode(response).unwrap(), b"\0user\0password");
    }

    #[test]
    fn test_cram_md5_known_vector() {
        // RFC 2195 example
        let challenge = BASE64.encode("<1896.697170952@postoffice.reston.mci.net>");
        let response = cram_md5_response(
            &challenge,
            "tim",
            &SecretString::new("tanstaaftanstaaf".to_string()),
        )
        .unwrap();
        let decoded = String::from_utf8(BASE64.decode(response).unwrap()).unwrap();
        assert_eq!(decoded, "tim b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn test_select_method() {
        let offered = [AuthMethod::Plain, AuthMethod::Login];
        assert_eq!(select_method(&offered, None, true).unwrap(), AuthMethod::Plain);
        assert!(select_method(&offered, None, false).is_err());
        assert_eq!(
            select_method(&offered, Some(AuthMethod::Login), true).unwrap(),
            AuthMethod::Login
        );
        assert!(select_method(&offered, Some(AuthMethod::CramMd5), true).is_err());
    }

    #[test]
    fn test_credentials_debug_redacts() {
        let creds = Credentials::new("user", SecretString::new("s3cr3t".to_string()));
        let debug = format!("{:?}", creds);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_login_exchange() {
        let mut transport = MockTransport::new();
        transport
            .queue_response(SmtpResponse::new(334, "VXNlcm5hbWU6"))
            .queue_response(SmtpResponse::new(334, "UGFzc3dvcmQ6"))
            .queue_response(SmtpResponse::new(235, "2.7.0 Authentication successful"));

        authenticate(&mut transport, &creds(), AuthMethod::Login).await.unwrap();

        let commands = transport.recorded_commands();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[1], SmtpCommand::AuthResponse(BASE64.encode("user")));
        assert_eq!(commands[2], SmtpCommand::AuthResponse(BASE64.encode("password")));
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let mut transport = MockTransport::new();
        transport.queue_response(SmtpResponse::new(535, "5.7.8 Bad credentials"));

        let err = authenticate(&mut transport, &creds(), AuthMethod::Plain)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), DeliveryErrorKind::CredentialsInvalid);
        assert_eq!(err.smtp_code(), Some(535));
    }
}
