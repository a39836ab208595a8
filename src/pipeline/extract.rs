//! Metadata extraction — provider message → canonical [`RawMessage`].
//!
//! Two provider shapes are accepted: raw RFC 822 bytes (parsed with
//! `mail-parser`) and a structured API payload whose parts are already
//! transfer-decoded. The plaintext part wins; without one, text is derived
//! from HTML. Quoted reply text is stripped so rules only see new content.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, PartType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ExtractionError;
use crate::pipeline::types::RawMessage;

// ── Provider input ──────────────────────────────────────────────────

/// A message as delivered by a transport, before extraction.
#[derive(Debug, Clone)]
pub enum ProviderMessage {
    /// RFC 822 bytes. `received_at` is the transport's delivery time, used
    /// when the message carries no `Date` header.
    Rfc822 {
        fallback_id: String,
        bytes: Vec<u8>,
        received_at: Option<DateTime<Utc>>,
    },
    /// Structured API payload.
    Payload(ProviderPayload),
}

impl ProviderMessage {
    /// Identifier used when reporting a failure before extraction finishes.
    pub fn id_hint(&self) -> &str {
        match self {
            Self::Rfc822 { fallback_id, .. } => fallback_id,
            Self::Payload(p) => &p.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadPart {
    pub mime_type: String,
    /// Decoded part content.
    pub data: String,
}

/// Structured provider payload (Gmail-API style).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPayload {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Delivery time in milliseconds since the epoch.
    pub internal_date_ms: i64,
    #[serde(default)]
    pub headers: Vec<PayloadHeader>,
    #[serde(default)]
    pub parts: Vec<PayloadPart>,
}

// ── Extraction ──────────────────────────────────────────────────────

/// Extract a canonical message from either provider shape.
pub fn extract(message: &ProviderMessage) -> Result<RawMessage, ExtractionError> {
    match message {
        ProviderMessage::Rfc822 {
            fallback_id,
            bytes,
            received_at,
        } => extract_rfc822(bytes, fallback_id, *received_at),
        ProviderMessage::Payload(payload) => extract_payload(payload),
    }
}

/// Parse RFC 822 bytes.
pub fn extract_rfc822(
    bytes: &[u8],
    fallback_id: &str,
    received_hint: Option<DateTime<Utc>>,
) -> Result<RawMessage, ExtractionError> {
    let malformed = |reason: &str| ExtractionError::Malformed {
        id: fallback_id.to_string(),
        reason: reason.to_string(),
    };

    let parsed = MessageParser::default()
        .parse(bytes)
        .ok_or_else(|| malformed("unparsable MIME structure"))?;
    if parsed.headers().is_empty() {
        return Err(malformed("no headers"));
    }

    let id = parsed
        .message_id()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback_id.to_string());

    let raw = parsed.raw_message();
    let mut headers = BTreeMap::new();
    for header in parsed.headers() {
        let start = header.offset_start as usize;
        let end = header.offset_end as usize;
        let value = raw
            .get(start..end)
            .map(|v| collapse_whitespace(&String::from_utf8_lossy(v)))
            .unwrap_or_default();
        headers
            .entry(header.name().to_ascii_lowercase())
            .or_insert(value);
    }

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.trim().to_lowercase())
        .or_else(|| headers.get("from").map(|v| parse_address(v)))
        .unwrap_or_default();

    let text = parsed.text_part(0).and_then(|part| match &part.body {
        PartType::Text(text) => Some(text.to_string()),
        _ => None,
    });
    let html = parsed.html_part(0).and_then(|part| match &part.body {
        PartType::Html(html) => Some(html.to_string()),
        _ => None,
    });
    let body = choose_body(text.as_deref(), html.as_deref()).ok_or_else(|| {
        ExtractionError::MissingBody { id: id.clone() }
    })?;

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .or(received_hint)
        .ok_or_else(|| malformed("no Date header and no delivery time"))?;

    let thread_id = thread_from_headers(&headers).unwrap_or_else(|| strip_angle(&id));

    let message = RawMessage {
        sender_domain: sender_domain(&sender),
        sender,
        subject: parsed.subject().unwrap_or("").trim().to_string(),
        body,
        html,
        headers,
        thread_id,
        received_at,
        id,
    };
    debug!(id = %message.id, sender = %message.sender, "Extracted RFC 822 message");
    Ok(message)
}

/// Convert a structured provider payload.
pub fn extract_payload(payload: &ProviderPayload) -> Result<RawMessage, ExtractionError> {
    if payload.id.trim().is_empty() {
        return Err(ExtractionError::Malformed {
            id: String::new(),
            reason: "payload has no id".into(),
        });
    }

    let mut headers = BTreeMap::new();
    for h in &payload.headers {
        headers
            .entry(h.name.to_ascii_lowercase())
            .or_insert_with(|| collapse_whitespace(&h.value));
    }

    let part_with = |mime: &str| {
        payload
            .parts
            .iter()
            .find(|p| p.mime_type.eq_ignore_ascii_case(mime) && !p.data.trim().is_empty())
            .map(|p| p.data.clone())
    };
    let text = part_with("text/plain");
    let html = part_with("text/html");
    let body = choose_body(text.as_deref(), html.as_deref()).ok_or_else(|| {
        ExtractionError::MissingBody {
            id: payload.id.clone(),
        }
    })?;

    let received_at = DateTime::from_timestamp_millis(payload.internal_date_ms).ok_or_else(|| {
        ExtractionError::Malformed {
            id: payload.id.clone(),
            reason: format!("invalid internal date {}", payload.internal_date_ms),
        }
    })?;

    let sender = headers.get("from").map(|v| parse_address(v)).unwrap_or_default();
    let thread_id = payload
        .thread_id
        .clone()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| payload.id.clone());

    Ok(RawMessage {
        id: payload.id.clone(),
        sender_domain: sender_domain(&sender),
        sender,
        subject: headers.get("subject").cloned().unwrap_or_default(),
        body,
        html,
        headers,
        thread_id,
        received_at,
    })
}

fn choose_body(text: Option<&str>, html: Option<&str>) -> Option<String> {
    if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
        return Some(strip_quoted_text(text));
    }
    html.map(html_to_text).filter(|t| !t.is_empty())
}

// ── Address helpers ─────────────────────────────────────────────────

/// Pull the bare address out of a header value like `"Jane" <Jane@X.com>`.
/// Takes the first address of a list. Lowercased.
pub fn parse_address(value: &str) -> String {
    let first = value.split(',').next().unwrap_or("");
    let inner = match (first.rfind('<'), first.rfind('>')) {
        (Some(open), Some(close)) if close > open => &first[open + 1..close],
        _ => first,
    };
    inner
        .trim()
        .trim_matches('"')
        .trim_start_matches("mailto:")
        .to_lowercase()
}

/// Domain part of an address, lowercased. Malformed addresses give `""`.
pub fn sender_domain(address: &str) -> String {
    let Some((local, domain)) = address.trim().rsplit_once('@') else {
        return String::new();
    };
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    let valid = !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if valid { domain } else { String::new() }
}

/// Domains mentioned in a header value: `mailto:` targets, bare addresses
/// and URL hosts. Used for Reply-To and List-Unsubscribe.
pub fn header_domains(value: &str) -> Vec<String> {
    let mut domains = Vec::new();
    for token in value.split(|c: char| c == ',' || c == '<' || c == '>' || c.is_whitespace()) {
        let token = token.trim().trim_matches('"');
        let domain = if let Some(rest) = token
            .strip_prefix("https://")
            .or_else(|| token.strip_prefix("http://"))
        {
            let host = rest.split(['/', '?', ':']).next().unwrap_or("");
            sender_domain(&format!("x@{host}"))
        } else {
            let address = token.trim_start_matches("mailto:");
            let address = address.split('?').next().unwrap_or("");
            sender_domain(address)
        };
        if !domain.is_empty() && !domains.contains(&domain) {
            domains.push(domain);
        }
    }
    domains
}

fn thread_from_headers(headers: &BTreeMap<String, String>) -> Option<String> {
    ["references", "in-reply-to"].iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.split_whitespace().next())
            .map(strip_angle)
            .filter(|id| !id.is_empty())
    })
}

fn strip_angle(id: &str) -> String {
    id.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Text helpers ────────────────────────────────────────────────────

/// Separator lines that open a quoted or forwarded block, or a mobile
/// signature.
static REPLY_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:-{2,}\s*(?:original|forwarded) message\s*-{2,}|_{10,}|sent from my \S.*)$")
        .expect("valid regex")
});

/// Gmail-style `On <date>, <person> wrote:`.
static ATTRIBUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^on\s.+\swrote:$").expect("valid regex"));

/// Outlook reply header: a `From:` line followed closely by `Sent:`/`Date:`.
static OUTLOOK_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^from:\s*\S").expect("valid regex"));
static OUTLOOK_SENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:sent|date):\s*\S").expect("valid regex"));

/// Strip earlier thread content from a reply so rules only see what the
/// sender just wrote.
///
/// Cuts at the first reply header (Gmail attribution, possibly wrapped onto
/// a second line; Outlook `From:`/`Sent:` block; original or forwarded
/// message separator; mobile signature) and drops `>`-quoted lines above it.
pub fn strip_quoted_text(body: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let cut = reply_start(&lines);

    let mut kept: Vec<&str> = lines[..cut]
        .iter()
        .copied()
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect();
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }
    kept.join("\n")
}

fn reply_start(lines: &[&str]) -> usize {
    for (i, line) in lines.iter().enumerate() {
        let line = line.trim();
        let following = &lines[i + 1..];

        if REPLY_SEPARATOR.is_match(line) || ATTRIBUTION.is_match(line) {
            return i;
        }
        let opens_attribution = line.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("on "));
        if opens_attribution && following.first().is_some_and(|l| l.trim().ends_with("wrote:")) {
            return i;
        }
        if OUTLOOK_FROM.is_match(line)
            && following.iter().take(3).any(|l| OUTLOOK_SENT.is_match(l.trim()))
        {
            return i;
        }
    }
    lines.len()
}

const BLOCK_TAGS: &[&str] = &[
    "p", "br", "div", "li", "ul", "ol", "tr", "td", "th", "table", "h1", "h2", "h3", "h4", "h5",
    "h6", "hr", "blockquote", "section", "article", "header", "footer",
];

/// Derive plain text from HTML: drop markup, `<script>`/`<style>` content
/// and comments, decode common entities, keep link text, collapse
/// whitespace.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(lt) = rest.find('<') {
        out.push_str(&decode_entities(&rest[..lt]));
        let after = &rest[lt + 1..];

        if let Some(comment) = after.strip_prefix("!--") {
            rest = comment.find("-->").map(|end| &comment[end + 3..]).unwrap_or("");
            continue;
        }

        let Some(gt) = after.find('>') else {
            rest = "";
            break;
        };
        let name = tag_name(&after[..gt]);
        rest = &after[gt + 1..];

        if !after.starts_with('/') && (name == "script" || name == "style") {
            let close = format!("</{name}");
            rest = match rest.to_ascii_lowercase().find(&close) {
                Some(pos) => &rest[pos..],
                None => "",
            };
        }
        if BLOCK_TAGS.contains(&name.as_str()) {
            out.push(' ');
        }
    }
    out.push_str(&decode_entities(rest));

    collapse_whitespace(&out)
}

fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('/')
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let decoded = after
            .find(';')
            .filter(|&semi| semi <= 8)
            .and_then(|semi| decode_entity(&after[..semi]).map(|c| (c, semi)));
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let num = entity.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}
