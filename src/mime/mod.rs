//! RFC 5322 / MIME encoding for outbound messages.
//!
//! Provides:
//! - Header encoding (RFC 2047) and folding
//! - Quoted-printable bodies and base64 attachments
//! - multipart/alternative and multipart/mixed construction
//! - DATA preparation with dot-stuffing (RFC 5321 §4.5.2)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use uuid::Uuid;

use crate::errors::{DeliveryError, DeliveryErrorKind, DeliveryResult};
use crate::types::{Address, Attachment, OutboundMessage};

/// Headers the encoder always writes itself.
const RESERVED_HEADERS: &[&str] = &[
    "date",
    "from",
    "to",
    "cc",
    "bcc",
    "subject",
    "message-id",
    "mime-version",
    "content-type",
    "content-transfer-encoding",
];

/// Encodes [`OutboundMessage`]s to wire format.
#[derive(Debug, Clone, Copy, Default)]
pub struct MimeEncoder;

impl MimeEncoder {
    /// Creates a new encoder.
    pub fn new() -> Self {
        Self
    }

    /// Encodes a message to RFC 5322 format.
    ///
    /// `Date` and `Message-ID` come from the message and are written exactly
    /// once; caller headers with reserved names are rejected.
    pub fn encode(&self, message: &OutboundMessage) -> DeliveryResult<Vec<u8>> {
        let mut out = Vec::with_capacity(4096);

        write_header(&mut out, "Date", &message.date.to_rfc2822())?;
        write_header(&mut out, "From", &address_header(&message.from)?)?;

        if !message.to.is_empty() {
            write_header(&mut out, "To", &address_list(&message.to)?)?;
        }
        if !message.cc.is_empty() {
            write_header(&mut out, "Cc", &address_list(&message.cc)?)?;
        }
        if let Some(reply_to) = &message.reply_to {
            write_header(&mut out, "Reply-To", &address_header(reply_to)?)?;
        }

        write_header(&mut out, "Subject", &encode_value("Subject", &message.subject)?)?;
        write_header(&mut out, "Message-ID", &message.message_id_header())?;

        for (name, value) in &message.headers {
            if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                return Err(DeliveryError::message_error(
                    DeliveryErrorKind::InvalidHeader,
                    format!("Header {} is managed by the encoder", name),
                ));
            }
            write_header(&mut out, name, &encode_value(name, value)?)?;
        }

        write_header(&mut out, "MIME-Version", "1.0")?;

        if message.has_attachments() {
            let boundary = boundary();
            write_header(&mut out, "Content-Type", &format!("multipart/mixed; boundary=\"{}\"", boundary))?;
            out.extend_from_slice(b"\r\n");

            out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            write_body(&mut out, message)?;

            for attachment in &message.attachments {
                out.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
                write_attachment(&mut out, attachment)?;
            }
            out.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        } else {
            write_body(&mut out, message)?;
        }

        Ok(out)
    }
}

fn write_body(out: &mut Vec<u8>, message: &OutboundMessage) -> DeliveryResult<()> {
    match (&message.text, &message.html) {
        (Some(text), Some(html)) => {
            let boundary = boundary();
            write_header(out, "Content-Type", &format!("multipart/alternative; boundary=\"{}\"", boundary))?;
            out.extend_from_slice(b"\r\n");

            out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            write_text_part(out, "text/plain", text)?;
            out.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
            write_text_part(out, "text/html", html)?;
            out.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
            Ok(())
        }
        (None, Some(html)) => write_text_part(out, "text/html", html),
        (Some(text), None) => write_text_part(out, "text/plain", text),
        (None, None) => write_text_part(out, "text/plain", ""),
    }
}

fn write_text_part(out: &mut Vec<u8>, mime_type: &str, body: &str) -> DeliveryResult<()> {
    write_header(out, "Content-Type", &format!("{}; charset=utf-8", mime_type))?;
    write_header(out, "Content-Transfer-Encoding", "quoted-printable")?;
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&quoted_printable::encode(normalize_newlines(body).as_bytes()));
    Ok(())
}

fn write_attachment(out: &mut Vec<u8>, attachment: &Attachment) -> DeliveryResult<()> {
    let filename = attachment.filename.replace(['"', '\r', '\n'], "_");
    write_header(out, "Content-Type", &format!("{}; name=\"{}\"", attachment.content_type, filename))?;
    write_header(out, "Content-Transfer-Encoding", "base64")?;
    write_header(out, "Content-Disposition", &format!("attachment; filename=\"{}\"", filename))?;
    out.extend_from_slice(b"\r\n");

    let encoded = BASE64.encode(&attachment.data);
    let mut lines = encoded.as_bytes().chunks(76).peekable();
    while let Some(line) = lines.next() {
        out.extend_from_slice(line);
        if lines.peek().is_some() {
            out.extend_from_slice(b"\r\n");
        }
    }
    Ok(())
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &str) -> DeliveryResult<()> {
    if name.is_empty() || name.chars().any(|c| c.is_control() || c == ':' || c == ' ') {
        return Err(DeliveryError::message_error(
            DeliveryErrorKind::InvalidHeader,
            format!("Invalid header name: {:?}", name),
        ));
    }
    if value.contains(['\r', '\n']) {
        return Err(DeliveryError::message_error(
            DeliveryErrorKind::InvalidHeader,
            format!("Header {} contains a line break", name),
        ));
    }

    out.extend_from_slice(fold(&format!("{}: {}", name, value)).as_bytes());
    out.extend_from_slice(b"\r\n");
    Ok(())
}

/// Folds a header line at whitespace to stay under 78 characters.
fn fold(line: &str) -> String {
    if line.len() <= 78 {
        return line.to_string();
    }

    let mut folded = String::with_capacity(line.len() + 16);
    let mut current = 0usize;

    for (i, word) in line.split(' ').enumerate() {
        if i > 0 {
            if current + 1 + word.len() > 76 {
                folded.push_str("\r\n ");
                current = 1;
            } else {
                folded.push(' ');
                current += 1;
            }
        }
        folded.push_str(word);
        current += word.len();
    }

    folded
}

/// RFC 2047 encoded-word for non-ASCII header values.
/// Rejects line breaks in the raw value, then applies RFC 2047 encoding.
fn encode_value(name: &str, value: &str) -> DeliveryResult<String> {
    if value.contains(['\r', '\n']) {
        return Err(DeliveryError::message_error(
            DeliveryErrorKind::InvalidHeader,
            format!("Header {} contains a line break", name),
        ));
    }
    Ok(encode_word(value))
}

/// Formats an address with a non-ASCII display name as an encoded word.
fn address_header(address: &Address) -> DeliveryResult<String> {
    match &address.name {
        Some(name) if !name.is_ascii() || name.contains(['\r', '\n']) => {
            Ok(format!("{} <{}>", encode_value("display name", name)?, address.email))
        }
        _ => Ok(address.to_header()),
    }
}

fn address_list(addresses: &[Address]) -> DeliveryResult<String> {
    let formatted = addresses.iter().map(address_header).collect::<DeliveryResult<Vec<_>>>()?;
    Ok(formatted.join(", "))
}

fn encode_word(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", BASE64.encode(value.as_bytes()))
    }
}

fn normalize_newlines(body: &str) -> String {
    body.replace("\r\n", "\n").replace('\n', "\r\n")
}

fn boundary() -> String {
    format!("=_Part_{}", Uuid::new_v4().simple())
}

/// Prepares DATA content: dot-stuffs, normalizes the final CRLF and
/// appends the `.` terminator.
pub fn prepare_data(encoded: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded.len() + 64);
    let mut at_line_start = true;

    for &byte in encoded {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }

    if !out.ends_with(b"\r\n") {
        if out.ends_with(b"\n") {
            out.pop();
        }
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        let mut msg = OutboundMessage::new(
            Address::with_name("Sender", "sender@example.com").unwrap(),
            "abc.1700000000@example.com",
        );
        msg.to.push(Address::new("recipient@example.org").unwrap());
        msg.bcc.push(Address::new("hidden@example.org").unwrap());
        msg.subject = "Quarterly update".to_string();
        msg.text = Some("Hello World!".to_string());
        msg
    }

    fn encode(msg: &OutboundMessage) -> String {
        String::from_utf8(MimeEncoder::new().encode(msg).unwrap()).unwrap()
    }

    #[test]
    fn test_simple_message() {
        let content = encode(&message());

        assert!(content.contains("From: Sender <sender@example.com>\r\n"));
        assert!(content.contains("To: recipient@example.org\r\n"));
        assert!(content.contains("Subject: Quarterly update\r\n"));
        assert!(content.contains("Message-ID: <abc.1700000000@example.com>\r\n"));
        assert!(content.contains("MIME-Version: 1.0\r\n"));
        assert!(!content.contains("hidden@example.org"));
        assert_eq!(content.matches("Date: ").count(), 1);
    }

    #[test]
    fn test_custom_headers_in_order() {
        let mut msg = message();
        msg.headers.push(("Precedence".into(), "bulk".into()));
        msg.headers.push(("X-Auto-Response-Suppress".into(), "OOF, AutoReply".into()));

        let content = encode(&msg);
        let precedence = content.find("Precedence: bulk").unwrap();
        let suppress = content.find("X-Auto-Response-Suppress: OOF, AutoReply").unwrap();
        assert!(precedence < suppress);
    }

    #[test]
    fn test_reserved_and_injected_headers_rejected() {
        let mut msg = message();
        msg.headers.push(("Message-ID".into(), "<dup@example.com>".into()));
        let err = MimeEncoder::new().encode(&msg).unwrap_err();
        assert_eq!(err.kind(), DeliveryErrorKind::InvalidHeader);

        let mut msg = message();
        msg.headers.push(("X-Note".into(), "a\r\nBcc: evil@example.com".into()));
        let err = MimeEncoder::new().encode(&msg).unwrap_err();
        assert_eq!(err.kind(), DeliveryErrorKind::InvalidHeader);

        let mut msg = message();
        msg.subject = "Hi\nBcc: evil@example.com".to_string();
        assert!(MimeEncoder::new().encode(&msg).is_err());

        let mut msg = message();
        msg.from = Address::with_name("Brand\r\nBcc: evil@example.com", "sender@example.com").unwrap();
        assert!(MimeEncoder::new().encode(&msg).is_err());
    }

    #[test]
    fn test_non_ascii_display_names_are_encoded() {
        let mut msg = message();
        msg.from = Address::with_name("Café Team", "sender@example.com").unwrap();
        msg.cc.push(Address::with_name("Zoë", "zoe@example.org").unwrap());

        let content = encode(&msg);
        assert!(content.is_ascii());
        assert!(content.contains(&format!("From: =?UTF-8?B?{}?= <sender@example.com>\r\n", BASE64.encode("Café Team"))));
        assert!(content.contains(&format!("Cc: =?UTF-8?B?{}?= <zoe@example.org>\r\n", BASE64.encode("Zoë"))));
    }

    #[test]
    fn test_alternative_with_attachment() {
        let mut msg = message();
        msg.html = Some("<p>Hello</p>".to_string());
        msg.attachments.push(Attachment::new("notes.txt", "text/plain", b"notes".to_vec()));

        let content = encode(&msg);
        assert!(content.contains("multipart/mixed"));
        assert!(content.contains("multipart/alternative"));
        assert!(content.contains("Content-Disposition: attachment; filename=\"notes.txt\""));
        assert!(content.contains(&BASE64.encode("notes")));
    }

    #[test]
    fn test_non_ascii_subject() {
        let mut msg = message();
        msg.subject = "Héllo".to_string();
        assert!(encode(&msg).contains("Subject: =?UTF-8?B?"));
    }

    #[test]
    fn test_fold_long_header() {
        let value = vec!["word"; 40].join(" ");
        let folded = fold(&format!("X-Long: {}", value));
        assert!(folded.split("\r\n").all(|line| line.len() <= 78));
        assert_eq!(folded.replace("\r\n ", " "), format!("X-Long: {}", value));
    }

    #[test]
    fn test_dot_stuffing() {
        let output = prepare_data(b"Hello\r\n.World\r\n..Test");
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("\r\n..World"));
        assert!(output.contains("\r\n...Test"));
        assert!(output.ends_with("...Test\r\n.\r\n"));

        let leading = prepare_data(b".first");
        assert!(leading.starts_with(b"..first"));
    }
}
