//! SMTP wire protocol.
//!
//! Commands, replies and EHLO capability parsing per RFC 5321, plus the
//! transaction state machine the pooled transport uses to decide whether a
//! connection is clean enough to reuse.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{DeliveryError, DeliveryResult, EnhancedStatusCode};

/// SMTP commands issued by the delivery transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO, used when EHLO is refused.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// SASL mechanism name.
        mechanism: String,
        /// Initial response.
        initial_response: Option<String>,
    },
    /// SASL continuation line.
    AuthResponse(String),
    /// MAIL FROM.
    MailFrom {
        /// Reverse path in angle brackets.
        address: String,
        /// SIZE parameter.
        size: Option<usize>,
        /// BODY=8BITMIME parameter.
        body_8bit: bool,
    },
    /// RCPT TO.
    RcptTo(String),
    /// DATA.
    Data,
    /// Reset transaction.
    Rset,
    /// Keepalive and liveness check.
    Noop,
    /// Close the session.
    Quit,
}

impl SmtpCommand {
    /// Formats the command line without the trailing CRLF.
    pub fn to_line(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(response),
            } => format!("AUTH {} {}", mechanism, response),
            SmtpCommand::Auth { mechanism, .. } => format!("AUTH {}", mechanism),
            SmtpCommand::AuthResponse(data) => data.clone(),
            SmtpCommand::MailFrom {
                address,
                size,
                body_8bit,
            } => {
                let mut line = format!("MAIL FROM:{}", address);
                if let Some(size) = size {
                    line.push_str(&format!(" SIZE={}", size));
                }
                if *body_8bit {
                    line.push_str(" BODY=8BITMIME");
                }
                line
            }
            SmtpCommand::RcptTo(address) => format!("RCPT TO:{}", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Returns true if the line carries credentials and must not be logged.
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            SmtpCommand::AuthResponse(_)
                | SmtpCommand::Auth {
                    initial_response: Some(_),
                    ..
                }
        )
    }

    /// Returns a log-safe rendering.
    pub fn redacted(&self) -> String {
        match self {
            SmtpCommand::Auth { mechanism, .. } => format!("AUTH {} ****", mechanism),
            SmtpCommand::AuthResponse(_) => "****".to_string(),
            other => other.to_line(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// A complete (possibly multiline) server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Reply code.
    pub code: u16,
    /// Enhanced status code from the first line.
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Text of each line, code stripped.
    pub lines: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line reply.
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        let text = text.into();
        let (enhanced_code, text) = match split_enhanced_code(&text) {
            Some((esc, rest)) => (Some(esc), rest.to_string()),
            None => (None, text),
        };
        Self {
            code,
            enhanced_code,
            lines: vec![text],
        }
    }

    /// Creates a multiline reply.
    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            lines,
        }
    }

    /// Parses a reply from raw wire lines (CRLF already stripped).
    pub fn parse(raw: &[String]) -> DeliveryResult<Self> {
        let Some(first) = raw.first() else {
            return Err(DeliveryError::protocol("Empty response"));
        };

        let code = parse_code(first)?;
        let mut lines = Vec::with_capacity(raw.len());
        let mut enhanced_code = None;

        for (i, line) in raw.iter().enumerate() {
            if parse_code(line)? != code {
                return Err(DeliveryError::protocol(
                    "Inconsistent status codes in multiline response",
                ));
            }

            let text = line.get(4..).unwrap_or("");
            if i == 0 {
                if let Some((esc, rest)) = split_enhanced_code(text) {
                    enhanced_code = Some(esc);
                    lines.push(rest.to_string());
                    continue;
                }
            }
            lines.push(text.to_string());
        }

        Ok(Self {
            code,
            enhanced_code,
            lines,
        })
    }

    /// Returns true if a raw line ends a reply (`NNN ` rather than `NNN-`).
    pub fn is_final_line(line: &str) -> bool {
        line.as_bytes().get(3) != Some(&b'-')
    }

    /// Returns true if this is a success reply (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns the first line of text.
    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }

    /// Returns all lines joined.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Returns `self` if the code matches, otherwise the mapped error.
    pub fn expect_code(self, expected: u16) -> DeliveryResult<Self> {
        if self.code == expected {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }

    /// Converts the reply into a delivery error.
    pub fn into_error(self) -> DeliveryError {
        let mut err = DeliveryError::from_smtp_response(self.code, self.text());
        if let Some(enhanced) = self.enhanced_code {
            err = err.with_enhanced_code(enhanced);
        }
        err
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.enhanced_code {
            Some(esc) => write!(f, "{} {} {}", self.code, esc, self.first_line()),
            None => write!(f, "{} {}", self.code, self.first_line()),
        }
    }
}

fn parse_code(line: &str) -> DeliveryResult<u16> {
    line.get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| (200..600).contains(c))
        .ok_or_else(|| DeliveryError::protocol(format!("Invalid status line: {}", line)))
}

fn split_enhanced_code(text: &str) -> Option<(EnhancedStatusCode, &str)> {
    let (head, rest) = text.split_once(' ').unwrap_or((text, ""));
    EnhancedStatusCode::parse(head).map(|esc| (esc, rest.trim()))
}

/// Capabilities advertised in the EHLO reply.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size.
    pub size: Option<usize>,
    /// Advertised SASL mechanisms we implement.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS offered.
    pub starttls: bool,
    /// 8BITMIME offered.
    pub eight_bit_mime: bool,
    /// PIPELINING offered.
    pub pipelining: bool,
    /// ENHANCEDSTATUSCODES offered.
    pub enhanced_status_codes: bool,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply. The first line is the greeting.
    pub fn from_ehlo(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.lines.iter().skip(1) {
            let line = line.trim().to_ascii_uppercase();
            let (keyword, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match keyword {
                "SIZE" => caps.size = params.trim().parse().ok().filter(|s| *s > 0),
                "AUTH" => caps
                    .auth_mechanisms
                    .extend(params.split_whitespace().filter_map(AuthMethod::from_capability)),
                // Some servers still use the pre-standard AUTH=LOGIN PLAIN form
                legacy if legacy.starts_with("AUTH=") => caps.auth_mechanisms.extend(
                    std::iter::once(&legacy[5..])
                        .chain(params.split_whitespace())
                        .filter_map(AuthMethod::from_capability),
                ),
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                "PIPELINING" => caps.pipelining = true,
                "ENHANCEDSTATUSCODES" => caps.enhanced_status_codes = true,
                _ => {}
            }
        }

        caps
    }

    /// Picks the strongest advertised mechanism allowed on this channel.
    pub fn best_auth_method(&self, is_tls: bool) -> Option<AuthMethod> {
        self.auth_mechanisms
            .iter()
            .copied()
            .filter(|m| is_tls || !m.requires_tls())
            .max_by_key(|m| m.priority())
    }
}

/// SMTP session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// TCP connected, greeting read.
    Connected,
    /// EHLO/HELO accepted.
    Greeted,
    /// AUTH accepted, or no AUTH needed.
    Ready,
    /// MAIL FROM accepted.
    InTransaction,
    /// At least one RCPT TO accepted.
    RecipientsAdded,
    /// DATA accepted, body not yet terminated.
    SendingData,
    /// Unusable: I/O error, timeout or QUIT.
    Closed,
}

impl TransactionState {
    /// Returns true if a new mail transaction may start.
    pub fn can_start_mail(&self) -> bool {
        matches!(self, TransactionState::Ready)
    }

    /// Returns true if RCPT TO is allowed.
    pub fn can_add_recipient(&self) -> bool {
        matches!(self, TransactionState::InTransaction | TransactionState::RecipientsAdded)
    }

    /// Returns true if DATA is allowed.
    pub fn can_send_data(&self) -> bool {
        matches!(self, TransactionState::RecipientsAdded)
    }

    /// Returns true if the session is between transactions and reusable.
    pub fn is_idle(&self) -> bool {
        matches!(self, TransactionState::Ready)
    }
}

/// Reply codes used by the transport.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Will forward (RCPT accepted, user not local).
    pub const WILL_FORWARD: u16 = 251;
    /// AUTH continuation.
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Service unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 421;
    /// Command not recognized.
    pub const SYNTAX_ERROR: u16 = 500;
    /// Command not implemented.
    pub const NOT_IMPLEMENTED: u16 = 502;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 535;
    /// Mailbox unavailable.
    pub const MAILBOX_UNAVAILABLE: u16 = 550;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SmtpCommand::Ehlo("mx.local".into()), "EHLO mx.local")]
    #[case(SmtpCommand::StartTls, "STARTTLS")]
    #[case(SmtpCommand::RcptTo("<b@example.com>".into()), "RCPT TO:<b@example.com>")]
    #[case(
        SmtpCommand::MailFrom { address: "<a@example.com>".into(), size: Some(2048), body_8bit: true },
        "MAIL FROM:<a@example.com> SIZE=2048 BODY=8BITMIME"
    )]
    fn test_command_lines(#[case] command: SmtpCommand, #[case] line: &str) {
        assert_eq!(command.to_line(), line);
    }

    #[test]
    fn test_auth_commands_are_redacted() {
        let auth = SmtpCommand::Auth {
            mechanism: "PLAIN".into(),
            initial_response: Some("AHVzZXIAcGFzcw==".into()),
        };
        assert!(auth.is_sensitive());
        assert_eq!(auth.to_string(), "AUTH PLAIN ****");
        assert_eq!(SmtpCommand::AuthResponse("secret".into()).to_string(), "****");
        assert!(!SmtpCommand::Noop.is_sensitive());
    }

    #[test]
    fn test_parse_multiline_reply() {
        let raw = vec![
            "250-smtp.example.com Hello".to_string(),
            "250-SIZE 10485760".to_string(),
            "250 STARTTLS".to_string(),
        ];
        assert!(!SmtpResponse::is_final_line(&raw[0]));
        assert!(SmtpResponse::is_final_line(&raw[2]));

        let response = SmtpResponse::parse(&raw).unwrap();
        assert_eq!(response.code, 250);
        assert!(response.is_success());
        assert_eq!(response.lines.len(), 3);
        assert_eq!(response.first_line(), "smtp.example.com Hello");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SmtpResponse::parse(&[]).is_err());
        assert!(SmtpResponse::parse(&["hello".to_string()]).is_err());
        assert!(SmtpResponse::parse(&["250-a".to_string(), "251 b".to_string()]).is_err());
    }

    #[test]
    fn test_enhanced_code_maps_into_error() {
        let response = SmtpResponse::parse(&["550 5.1.1 User unknown".to_string()]).unwrap();
        assert_eq!(response.first_line(), "User unknown");

        let err = response.expect_code(codes::OK).unwrap_err();
        assert_eq!(err.smtp_code(), Some(550));
        assert_eq!(err.enhanced_code().map(|c| c.to_string()), Some("5.1.1".into()));
    }

    #[test]
    fn test_capabilities() {
        let response = SmtpResponse::multiline(
            250,
            vec![
                "smtp.example.com".into(),
                "SIZE 10485760".into(),
                "AUTH PLAIN LOGIN CRAM-MD5 XOAUTH2".into(),
                "STARTTLS".into(),
                "8BITMIME".into(),
            ],
        );

        let caps = EsmtpCapabilities::from_ehlo(&response);
        assert_eq!(caps.size, Some(10_485_760));
        assert!(caps.starttls);
        assert!(caps.eight_bit_mime);
        assert_eq!(caps.auth_mechanisms.len(), 3);
        assert_eq!(caps.best_auth_method(false), Some(AuthMethod::CramMd5));
        assert_eq!(caps.best_auth_method(true), Some(AuthMethod::CramMd5));
    }

    #[test]
    fn test_legacy_auth_form_lists_every_mechanism() {
        let response = SmtpResponse::multiline(250, vec!["smtp.example.com".into(), "AUTH=LOGIN PLAIN".into()]);

        let caps = EsmtpCapabilities::from_ehlo(&response);
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Login));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Plain));
        assert_eq!(caps.auth_mechanisms.len(), 2);
    }

    #[test]
    fn test_plaintext_auth_needs_tls() {
        let response = SmtpResponse::multiline(250, vec!["mx".into(), "AUTH PLAIN LOGIN".into()]);
        let caps = EsmtpCapabilities::from_ehlo(&response);
        assert_eq!(caps.best_auth_method(false), None);
        assert_eq!(caps.best_auth_method(true), Some(AuthMethod::Plain));
    }

    #[test]
    fn test_transaction_state() {
        assert!(TransactionState::Ready.is_idle());
        assert!(!TransactionState::InTransaction.is_idle());
        assert!(TransactionState::InTransaction.can_add_recipient());
        assert!(TransactionState::RecipientsAdded.can_send_data());
        assert!(!TransactionState::Greeted.can_start_mail());
    }
}
