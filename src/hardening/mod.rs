//! Content hardening pipeline.
//!
//! Turns a [`SendRequest`] into the [`OutboundMessage`] a transport sends:
//! - a fresh domain-qualified message id per send
//! - caller copy kept verbatim inside a header/body/footer skeleton
//! - a text-heavy template when the caller supplied only placeholder copy
//! - unsubscribe, feedback and abuse-reporting headers
//! - soft content-quality scoring

use chrono::Utc;
use uuid::Uuid;

use crate::config::{ContentPolicy, HardeningConfig};
use crate::errors::{DeliveryError, DeliveryResult};
use crate::types::{Address, OutboundMessage, SendRequest, SenderAccount};

/// Phrases commonly weighted by content filters.
const TRIGGER_PHRASES: &[&str] = &[
    "act now",
    "limited time",
    "click here",
    "risk-free",
    "100% free",
    "winner",
    "guaranteed",
    "cash bonus",
    "urgent response",
    "no obligation",
];

/// Unrendered merge tags and stock filler.
const PLACEHOLDER_MARKERS: &[&str] = &["lorem ipsum", "{{", "}}", "[insert ", "[first_name]", "*|fname|*", "%first_name%"];

/// Output of the hardening pipeline.
#[derive(Debug, Clone)]
pub struct HardenedContent {
    /// The message to hand to a transport.
    pub message: OutboundMessage,
    /// Unique reference shown in the footer and the `X-Entity-Ref-ID` header.
    pub reference: String,
    /// Content-quality findings.
    pub warnings: Vec<String>,
    /// Sum of content-quality penalties.
    pub spam_score: u32,
    /// The caller copy was treated as placeholder and templated.
    pub used_template: bool,
}

/// Applies deliverability structure and headers to send requests.
#[derive(Debug, Clone, Default)]
pub struct ContentHardener {
    config: HardeningConfig,
}

impl ContentHardener {
    /// Creates a hardener.
    pub fn new(config: HardeningConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &HardeningConfig {
        &self.config
    }

    /// Hardens `request` for sending from `account`.
    ///
    /// Fails only when the sender address is unusable or the content policy
    /// blocks the message.
    pub fn harden(&self, account: &SenderAccount, request: &SendRequest) -> DeliveryResult<HardenedContent> {
        let from = Address::sender(account.display_name.as_deref(), account.email.trim())?;
        let domain = from.domain();

        let (spam_score, warnings) = score_content(&request.subject, request.text.as_deref(), request.html.as_deref());
        self.apply_policy(account, spam_score, &warnings)?;

        let now = Utc::now();
        let unique = Uuid::new_v4().simple().to_string();
        let message_id = format!("{}.{}@{}", unique, now.timestamp_millis(), domain);
        let reference = unique[..12].to_ascii_uppercase();

        let recipient = request.primary_recipient();
        let footer = Footer {
            unsubscribe_url: self.unsubscribe_url(&reference),
            unsubscribe_mailbox: format!("{}@{}", self.config.unsubscribe_mailbox, domain),
            physical_address: &self.config.physical_address,
            reference: &reference,
        };

        let used_template = !self.is_substantive(request);
        let html = if used_template {
            template_html(request, &footer)
        } else {
            skeleton_html(request, &footer)
        };

        let text = match &request.text {
            Some(text) if !text.trim().is_empty() => format!("{}\n\n{}", text.trim_end(), footer.text()),
            _ => format!("{}\n\n{}", html_to_text(body_html(request).as_deref().unwrap_or(&request.subject)), footer.text()),
        };

        let mut message = OutboundMessage::new(from, message_id);
        message.date = now;
        message.to = request.to.clone();
        message.cc = request.cc.clone();
        message.bcc = request.bcc.clone();
        message.subject = request.subject.clone();
        message.html = Some(html);
        message.text = Some(text);
        message.attachments = request.attachments.clone();
        message.headers = self.headers(account, request, &domain, &footer);

        tracing::debug!(
            account_id = account.id,
            message_id = %message.message_id,
            recipient_domain = %recipient.map(|r| r.domain()).unwrap_or_default(),
            used_template,
            spam_score,
            "Hardened message content"
        );

        Ok(HardenedContent {
            message,
            reference,
            warnings,
            spam_score,
            used_template,
        })
    }

    fn apply_policy(&self, account: &SenderAccount, score: u32, warnings: &[String]) -> DeliveryResult<()> {
        for warning in warnings {
            tracing::warn!(account_id = account.id, score, warning = %warning, "Content quality warning");
        }

        match self.config.content_policy {
            ContentPolicy::BlockAbove(threshold) if score > threshold => Err(DeliveryError::content_rejected(
                format!("Spam score {} exceeds threshold {}: {}", score, threshold, warnings.join("; ")),
            )),
            _ => Ok(()),
        }
    }

    fn is_substantive(&self, request: &SendRequest) -> bool {
        let visible = match (&request.html, &request.text) {
            (Some(html), _) => html_to_text(html),
            (None, Some(text)) => text.clone(),
            (None, None) => return false,
        };

        let lowered = visible.to_lowercase();
        if PLACEHOLDER_MARKERS.iter().any(|m| lowered.contains(m)) {
            return false;
        }

        visible.chars().filter(|c| !c.is_whitespace()).count() >= self.config.min_substantive_chars
    }

    fn unsubscribe_url(&self, reference: &str) -> String {
        format!("{}/{}", self.config.unsubscribe_url.trim_end_matches('/'), reference.to_ascii_lowercase())
    }

    fn headers(
        &self,
        account: &SenderAccount,
        request: &SendRequest,
        domain: &str,
        footer: &Footer<'_>,
    ) -> Vec<(String, String)> {
        let campaign = request
            .association
            .and_then(|a| a.campaign_id)
            .map(|id| id.to_string())
            .unwrap_or_else(|| "direct".to_string());

        vec![
            (
                "List-Unsubscribe".to_string(),
                format!("<mailto:{}?subject=unsubscribe>, <{}>", footer.unsubscribe_mailbox, footer.unsubscribe_url),
            ),
            ("List-Unsubscribe-Post".to_string(), "List-Unsubscribe=One-Click".to_string()),
            (
                "Feedback-ID".to_string(),
                format!("{}:{}:{}:{}", campaign, self.config.category, account.id, domain),
            ),
            ("X-Auto-Response-Suppress".to_string(), "OOF, AutoReply".to_string()),
            (
                "X-Report-Abuse".to_string(),
                format!("Please report abuse to {}@{}", self.config.abuse_mailbox, domain),
            ),
            ("X-Entity-Ref-ID".to_string(), footer.reference.to_string()),
            ("Precedence".to_string(), "bulk".to_string()),
        ]
    }
}

struct Footer<'a> {
    unsubscribe_url: String,
    unsubscribe_mailbox: String,
    physical_address: &'a str,
    reference: &'a str,
}

impl Footer<'_> {
    fn html(&self) -> String {
        format!(
            concat!(
                "<div class=\"footer\" style=\"margin-top:24px;font-size:12px;color:#666\">",
                "<p>To stop receiving these emails, reply with \"unsubscribe\" or ",
                "<a href=\"{url}\">unsubscribe here</a>.</p>",
                "<p>{address}</p>",
                "<p>Ref: {reference}</p>",
                "</div>"
            ),
            url = escape_html(&self.unsubscribe_url),
            address = escape_html(self.physical_address),
            reference = self.reference,
        )
    }

    fn text(&self) -> String {
        format!(
            "--\nTo stop receiving these emails, reply with \"unsubscribe\" or visit {}\n{}\nRef: {}",
            self.unsubscribe_url, self.physical_address, self.reference
        )
    }
}

fn body_html(request: &SendRequest) -> Option<String> {
    match (&request.html, &request.text) {
        (Some(html), _) => Some(html.clone()),
        (None, Some(text)) => Some(text_to_html(text)),
        (None, None) => None,
    }
}

/// Keeps the caller's markup untouched and adds the footer.
fn skeleton_html(request: &SendRequest, footer: &Footer<'_>) -> String {
    let body = body_html(request).unwrap_or_default();

    if let Some(pos) = body.to_ascii_lowercase().rfind("</body>") {
        let mut document = body.clone();
        document.insert_str(pos, &footer.html());
        return document;
    }

    format!(
        concat!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head>",
            "<body style=\"font-family:Arial,sans-serif;font-size:14px;line-height:1.5;color:#222\">",
            "<div class=\"header\"></div>",
            "<div class=\"body\">{body}</div>",
            "{footer}",
            "</body></html>"
        ),
        body = body,
        footer = footer.html(),
    )
}

/// Text-heavy wrapper. Caller markup is embedded as-is; text or a bare
/// subject becomes plain paragraphs.
fn template_html(request: &SendRequest, footer: &Footer<'_>) -> String {
    let body = match (&request.html, &request.text) {
        (Some(html), _) if !html.trim().is_empty() => html.clone(),
        (_, Some(text)) if !text.trim().is_empty() => text_to_html(text),
        _ => text_to_html(&request.subject),
    };

    format!(
        concat!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head><body>",
            "<div class=\"header\"><p>Hello,</p></div>",
            "<div class=\"body\">{body}</div>",
            "{footer}",
            "</body></html>"
        ),
        body = body,
        footer = footer.html(),
    )
}

/// Scores content quality. Higher is worse.
pub fn score_content(subject: &str, text: Option<&str>, html: Option<&str>) -> (u32, Vec<String>) {
    let mut score = 0;
    let mut warnings = Vec::new();
    let mut flag = |points: u32, warning: String| {
        score += points;
        warnings.push(warning);
    };

    if subject.trim().is_empty() {
        flag(1, "Subject is empty".to_string());
    }

    let letters: Vec<char> = subject.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() >= 4 && letters.iter().all(|c| c.is_uppercase()) {
        flag(2, "Subject is written in capitals".to_string());
    }

    let visible = match (html, text) {
        (Some(html), _) => html_to_text(html),
        (None, Some(text)) => text.to_string(),
        (None, None) => String::new(),
    };

    let exclamations = subject.matches('!').count() + visible.matches('!').count();
    if exclamations > 3 {
        flag(1, format!("{} exclamation marks", exclamations));
    }

    let haystack = format!("{} {}", subject, visible).to_lowercase();
    for phrase in TRIGGER_PHRASES {
        if haystack.contains(phrase) {
            flag(1, format!("Contains trigger phrase \"{}\"", phrase));
        }
    }

    if let Some(html) = html {
        let links = html.to_ascii_lowercase().matches("href=").count();
        let words = visible.split_whitespace().count();
        if links > 3 && links * 50 > words {
            flag(2, format!("{} links for {} words", links, words));
        }

        let ratio = visible.len() as f64 / html.len().max(1) as f64;
        if html.len() > 200 && ratio < 0.2 {
            flag(2, format!("Low text-to-markup ratio ({:.2})", ratio));
        }

        if text.is_none() {
            flag(1, "No plain-text alternative".to_string());
        }
    }

    (score, warnings)
}

/// Extracts visible text from markup, one line per block element.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    let mut skip_until: Option<&str> = None;

    while let Some(start) = rest.find('<') {
        if skip_until.is_none() {
            out.push_str(&rest[..start]);
        }
        let Some(end) = rest[start..].find('>') else {
            rest = "";
            break;
        };
        let tag = rest[start + 1..start + end].trim().to_ascii_lowercase();
        rest = &rest[start + end + 1..];

        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();

        match skip_until {
            Some(closing) if tag.starts_with('/') && name == closing => skip_until = None,
            Some(_) => {}
            None if name == "script" || name == "style" || name == "head" => {
                if !tag.starts_with('/') && !tag.ends_with('/') {
                    skip_until = Some(match name.as_str() {
                        "script" => "script",
                        "style" => "style",
                        _ => "head",
                    });
                }
            }
            None if matches!(name.as_str(), "br" | "p" | "div" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6") => {
                out.push('\n');
            }
            None => {}
        }
    }
    if skip_until.is_none() {
        out.push_str(rest);
    }

    let decoded = decode_entities(&out);
    decoded
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn text_to_html(text: &str) -> String {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", escape_html(p).replace('\n', "<br>")))
        .collect()
}
