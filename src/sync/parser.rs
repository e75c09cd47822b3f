//! Message parsing and normalization.
//!
//! Turns raw RFC 822 bytes into a [`ParsedMessage`]: decoded headers, the
//! plain text body, and the patch metadata derived from the subject line.
//!
//! # Subject prefixes
//!
//! Bracketed groups at the start of the subject are split on whitespace into
//! prefix tokens, so `[Qemu-devel] [PATCH v2 1/3] Fix leak` yields
//! `["Qemu-devel", "PATCH", "v2", "1/3"]` with stripped subject `Fix leak`.
//! Leading `Re:` / `Fwd:` markers are consumed along the way and flag the
//! message as a reply.
//!
//! # Patch heuristics
//!
//! - replies are never patches
//! - a diff in the body makes a patch
//! - position `0` without a diff is a cover letter
//! - otherwise a `PATCH`/`PULL` prefix token makes a patch
//!
//! Parsing only fails on an unreadable MIME structure or a missing
//! Message-ID; everything else degrades to a default and is logged.

use crate::models::Address;
use chrono::{DateTime, Utc};
use mailparse::body::Body;
use mailparse::{MailAddr, MailHeaderMap, ParsedMail, parse_mail};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub date: DateTime<Utc>,
    pub subject: String,
    pub stripped_subject: String,
    pub prefixes: Vec<String>,
    pub version: u32,
    pub patch_num: (u32, u32),
    pub is_reply: bool,
    pub is_patch: bool,
    pub sender: Address,
    /// To followed by Cc.
    pub recipients: Vec<Address>,
    pub body: String,
    pub is_multipart: bool,
    pub content_transfer_encoding: Option<String>,
    /// Message id named by a `Supersedes:` body line.
    pub supersedes: Option<String>,
}

impl ParsedMessage {
    /// Whether this message would start a series when it has no
    /// resolvable parent.
    pub fn is_series_head(&self) -> bool {
        if self.is_reply {
            return false;
        }
        let (position, total) = self.patch_num;
        if position == 0 {
            return true;
        }
        if self.is_patch {
            return total == 1 || (position == 1 && self.in_reply_to.is_none());
        }
        self.in_reply_to.is_none()
    }
}

#[derive(Debug, Error)]
pub enum ParseMessageError {
    #[error("failed to parse MIME structure: {0}")]
    MimeParse(#[from] mailparse::MailParseError),
    #[error("missing Message-ID header")]
    MissingMessageId,
}

static VERSION_REGEX: OnceLock<Regex> = OnceLock::new();
static SUPERSEDES_REGEX: OnceLock<Regex> = OnceLock::new();

fn version_regex() -> &'static Regex {
    VERSION_REGEX.get_or_init(|| Regex::new(r"^[vV](\d+)$").expect("Invalid version regex"))
}

fn supersedes_regex() -> &'static Regex {
    SUPERSEDES_REGEX.get_or_init(|| {
        Regex::new(r"(?mi)^supersedes:\s*<?([^\s<>]+)>?\s*$").expect("Invalid supersedes regex")
    })
}

/// Remove NUL bytes that downstream consumers choke on.
fn sanitize_text(text: &str) -> String {
    text.replace('\0', "").trim().to_string()
}

/// Strip angle brackets and whitespace from a message id.
pub fn normalize_message_id(raw: &str) -> Option<String> {
    let cleaned = raw.trim().trim_matches(&['<', '>'][..]).trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(sanitize_text(cleaned))
    }
}

/// In-Reply-To may carry several ids or trailing comments; keep the first id.
fn parse_in_reply_to(raw: &str) -> Option<String> {
    if let Some(start) = raw.find('<') {
        let rest = &raw[start + 1..];
        if let Some(end) = rest.find('>') {
            return normalize_message_id(&rest[..end]);
        }
    }
    raw.split_whitespace().next().and_then(normalize_message_id)
}

fn parse_addresses(header_value: &str) -> Vec<Address> {
    let mut addresses = Vec::new();
    let Ok(list) = mailparse::addrparse(header_value) else {
        log::debug!("unparseable address list: {}", header_value);
        return addresses;
    };
    for entry in list.iter() {
        match entry {
            MailAddr::Single(info) => addresses.push(Address::new(
                sanitize_text(info.display_name.as_deref().unwrap_or_default()),
                info.addr.to_lowercase(),
            )),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    addresses.push(Address::new(
                        sanitize_text(info.display_name.as_deref().unwrap_or_default()),
                        info.addr.to_lowercase(),
                    ));
                }
            }
        }
    }
    addresses
}

fn strip_marker<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let head = text.get(..marker.len())?;
    head.eq_ignore_ascii_case(marker).then(|| &text[marker.len()..])
}

/// Split a subject into bracketed prefix tokens and the remaining text.
///
/// Returns `(prefixes, stripped_subject, is_reply)`.
pub fn split_subject(subject: &str) -> (Vec<String>, String, bool) {
    let mut prefixes = Vec::new();
    let mut is_reply = false;
    let mut rest = subject.trim_start();

    loop {
        if let Some(inner) = rest.strip_prefix('[') {
            let Some(end) = inner.find(']') else { break };
            prefixes.extend(inner[..end].split_whitespace().map(str::to_string));
            rest = inner[end + 1..].trim_start();
            continue;
        }
        if let Some(after) = strip_marker(rest, "re:").or_else(|| strip_marker(rest, "fwd:")) {
            is_reply = true;
            rest = after.trim_start();
            continue;
        }
        break;
    }

    let stripped = rest.split_whitespace().collect::<Vec<_>>().join(" ");
    (prefixes, stripped, is_reply)
}

/// Parse a single `N/M[/...]` token.
pub fn parse_numbering_token(token: &str) -> Option<(u32, u32)> {
    let mut parts = token.split('/');
    let position = parts.next()?.parse::<u32>().ok()?;
    let total = parts.next()?.parse::<u32>().ok()?;
    Some((position, total))
}

/// `(position, total)` from the first prefix that reads as `N/M`,
/// defaulting to `(1, 1)`.
pub fn parse_numbering<S: AsRef<str>>(prefixes: &[S]) -> (u32, u32) {
    prefixes
        .iter()
        .filter(|prefix| prefix.as_ref().contains('/'))
        .find_map(|prefix| parse_numbering_token(prefix.as_ref()))
        .unwrap_or((1, 1))
}

/// Revision from a `vN` prefix token, `0` when absent.
pub fn parse_version<S: AsRef<str>>(prefixes: &[S]) -> u32 {
    prefixes
        .iter()
        .find_map(|prefix| {
            version_regex()
                .captures(prefix.as_ref())
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
        })
        .unwrap_or(0)
}

/// Whether the body carries a unified or git diff.
pub fn has_diff(body: &str) -> bool {
    let mut previous_minus = false;
    for line in body.lines() {
        if line.starts_with("diff --git ")
            || line.starts_with("@@ -")
            || line.starts_with("GIT binary patch")
            || (previous_minus && line.starts_with("+++ "))
        {
            return true;
        }
        previous_minus = line.starts_with("--- ");
    }
    false
}

fn is_patch_prefix(prefix: &str) -> bool {
    prefix.eq_ignore_ascii_case("PATCH") || prefix.eq_ignore_ascii_case("PULL")
}

fn detect_patch(is_reply: bool, prefixes: &[String], patch_num: (u32, u32), body: &str) -> bool {
    if is_reply {
        return false;
    }
    if has_diff(body) {
        return true;
    }
    if patch_num.0 == 0 {
        return false;
    }
    prefixes.iter().any(|prefix| is_patch_prefix(prefix))
}

fn parse_date(raw: Option<String>, message_id: &str) -> DateTime<Utc> {
    let raw = raw.unwrap_or_default();
    if raw.trim().is_empty() {
        log::warn!("message {} has no Date header, using current time", message_id);
        return Utc::now();
    }
    match dateparser::parse(&raw) {
        Ok(date) => date.with_timezone(&Utc),
        Err(err) => {
            log::warn!(
                "message {} has invalid date `{}`, using current time: {}",
                message_id,
                raw,
                err
            );
            Utc::now()
        }
    }
}

/// Body of the first `text/plain` part, searching nested multiparts.
fn find_text_body(part: &ParsedMail<'_>) -> Option<String> {
    if part.subparts.is_empty() {
        if part.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
            return Some(decode_body(part));
        }
        return None;
    }
    part.subparts.iter().find_map(find_text_body)
}

fn decode_body(part: &ParsedMail<'_>) -> String {
    match part.get_body() {
        Ok(body) => body,
        Err(err) => {
            log::debug!("falling back to lossy body decoding: {}", err);
            let raw = match part.get_body_raw() {
                Ok(raw) => raw,
                Err(_) => undecoded_body(part).to_vec(),
            };
            String::from_utf8_lossy(&raw).into_owned()
        }
    }
}

/// Body bytes as written in the message, headers excluded.
fn undecoded_body<'a>(part: &'a ParsedMail<'a>) -> &'a [u8] {
    match part.get_body_encoded() {
        Body::Base64(body) | Body::QuotedPrintable(body) => body.get_raw(),
        Body::SevenBit(body) | Body::EightBit(body) => body.get_raw(),
        Body::Binary(body) => body.get_raw(),
    }
}

/// Parse raw message bytes.
pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage, ParseMessageError> {
    let parsed = parse_mail(raw).map_err(|err| {
        log::debug!("failed to parse MIME: {}", err);
        ParseMessageError::MimeParse(err)
    })?;

    let message_id = parsed
        .headers
        .get_first_value("Message-ID")
        .as_deref()
        .and_then(normalize_message_id)
        .ok_or(ParseMessageError::MissingMessageId)?;

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|s| sanitize_text(&s))
        .unwrap_or_default();
    let (prefixes, stripped_subject, is_reply) = split_subject(&subject);
    let patch_num = parse_numbering(&prefixes);
    let version = parse_version(&prefixes);

    let date = parse_date(parsed.headers.get_first_value("Date"), &message_id);

    let sender = parsed
        .headers
        .get_first_value("From")
        .map(|from| parse_addresses(&from))
        .and_then(|addresses| addresses.into_iter().next())
        .unwrap_or_else(|| {
            log::warn!("message {} has no usable From header", message_id);
            Address::default()
        });

    let mut recipients = Vec::new();
    for header in ["To", "Cc"] {
        if let Some(value) = parsed.headers.get_first_value(header) {
            recipients.extend(parse_addresses(&value));
        }
    }

    let in_reply_to = parsed
        .headers
        .get_first_value("In-Reply-To")
        .as_deref()
        .and_then(parse_in_reply_to);

    let is_multipart = !parsed.subparts.is_empty();
    let body = if is_multipart {
        find_text_body(&parsed).unwrap_or_default()
    } else {
        decode_body(&parsed)
    };
    let body = sanitize_text(&body);

    let content_transfer_encoding = parsed
        .headers
        .get_first_value("Content-Transfer-Encoding")
        .map(|value| value.trim().to_ascii_lowercase());

    let supersedes = supersedes_regex()
        .captures(&body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    let is_patch = detect_patch(is_reply, &prefixes, patch_num, &body);

    Ok(ParsedMessage {
        message_id,
        in_reply_to,
        date,
        subject,
        stripped_subject,
        prefixes,
        version,
        patch_num,
        is_reply,
        is_patch,
        sender,
        recipients,
        body,
        is_multipart,
        content_transfer_encoding,
        supersedes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MessageBuilder, SAMPLE_DIFF};

    #[test]
    fn numbering_uses_first_two_components() {
        assert_eq!(parse_numbering(&["PATCH", "3/4/5"]), (3, 4));
        assert_eq!(parse_numbering(&["PATCH", "2/7"]), (2, 7));
        assert_eq!(parse_numbering(&["PATCH"]), (1, 1));
        assert_eq!(parse_numbering::<&str>(&[]), (1, 1));
    }

    #[test]
    fn numbering_skips_unparseable_slash_tokens() {
        assert_eq!(parse_numbering(&["for-2.7/next", "PATCH", "0/3"]), (0, 3));
        assert_eq!(parse_numbering(&["a/b"]), (1, 1));
    }

    #[test]
    fn split_subject_collects_prefix_groups() {
        let (prefixes, stripped, reply) =
            split_subject("[Qemu-devel] [PATCH v2 1/3] block: fix   leak");
        assert_eq!(prefixes, vec!["Qemu-devel", "PATCH", "v2", "1/3"]);
        assert_eq!(stripped, "block: fix leak");
        assert!(!reply);
    }

    #[test]
    fn split_subject_detects_replies() {
        let (prefixes, stripped, reply) = split_subject("Re: [PATCH 2/2] Add feature");
        assert_eq!(prefixes, vec!["PATCH", "2/2"]);
        assert_eq!(stripped, "Add feature");
        assert!(reply);

        let (_, _, reply) = split_subject("RE: Fwd: hello");
        assert!(reply);
    }

    #[test]
    fn version_defaults_to_zero() {
        assert_eq!(parse_version(&["PATCH", "v3", "1/2"]), 3);
        assert_eq!(parse_version(&["PATCH"]), 0);
        assert_eq!(parse_version(&["vhost"]), 0);
    }

    #[test]
    fn diff_detection() {
        assert!(has_diff(SAMPLE_DIFF));
        assert!(has_diff("--- a/x\n+++ b/x\n"));
        assert!(!has_diff("This series does things.\n\n 2 files changed\n"));
    }

    #[test]
    fn parses_single_patch() {
        let raw = MessageBuilder::new("p1@example.com", "[PATCH] Fix the frobnicator")
            .from("Fam Zheng <famz@redhat.com>")
            .to("qemu-devel@nongnu.org")
            .cc("Eric Blake <eblake@redhat.com>")
            .body(SAMPLE_DIFF)
            .build();
        let parsed = parse_message(raw.as_bytes()).unwrap();

        assert_eq!(parsed.message_id, "p1@example.com");
        assert_eq!(parsed.stripped_subject, "Fix the frobnicator");
        assert_eq!(parsed.patch_num, (1, 1));
        assert!(parsed.is_patch);
        assert!(parsed.is_series_head());
        assert_eq!(parsed.sender.address, "famz@redhat.com");
        assert_eq!(parsed.recipients.len(), 2);
        assert_eq!(parsed.recipients[1].name, "Eric Blake");
    }

    #[test]
    fn cover_letter_is_head_but_not_patch() {
        let raw = MessageBuilder::new("cover@example.com", "[PATCH v2 0/2] Series")
            .body("This is the cover letter.\n")
            .build();
        let parsed = parse_message(raw.as_bytes()).unwrap();
        assert!(!has_diff(&parsed.body));
        assert!(parsed.is_series_head());
        assert_eq!(parsed.version, 2);
    }

    #[test]
    fn threaded_patch_is_not_head() {
        let raw = MessageBuilder::new("p2@example.com", "[PATCH 2/2] Second")
            .reply_to("cover@example.com")
            .body(SAMPLE_DIFF)
            .build();
        let parsed = parse_message(raw.as_bytes()).unwrap();
        assert!(parsed.is_patch);
        assert!(!parsed.is_series_head());
        assert_eq!(parsed.in_reply_to.as_deref(), Some("cover@example.com"));
    }

    #[test]
    fn reply_is_never_patch() {
        let raw = MessageBuilder::new("r@example.com", "Re: [PATCH] Fix")
            .reply_to("p1@example.com")
            .body(&format!("> quoted\n{SAMPLE_DIFF}"))
            .build();
        let parsed = parse_message(raw.as_bytes()).unwrap();
        assert!(parsed.is_reply);
        assert!(!has_diff(&parsed.body));
        assert!(!parsed.is_series_head());
    }

    #[test]
    fn missing_message_id_is_rejected() {
        let raw = "Subject: hi\r\nFrom: a@b.org\r\n\r\nbody\r\n";
        assert!(matches!(
            parse_message(raw.as_bytes()),
            Err(ParseMessageError::MissingMessageId)
        ));
    }

    #[test]
    fn bad_date_falls_back_to_now() {
        let raw = "Message-ID: <d@x>\r\nDate: not a date\r\nSubject: hi\r\n\r\nbody\r\n";
        let before = Utc::now();
        let parsed = parse_message(raw.as_bytes()).unwrap();
        assert!(parsed.date >= before);
    }

    #[test]
    fn nested_multipart_finds_text_part() {
        let raw = concat!(
            "Message-ID: <mp@x>\r\n",
            "Subject: [PATCH] multipart\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
            "\r\n",
            "--outer\r\n",
            "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
            "\r\n",
            "--inner\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>html</p>\r\n",
            "--inner\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "Reviewed-by: Someone <s@x.org>\r\n",
            "--inner--\r\n",
            "--outer--\r\n",
        );
        let parsed = parse_message(raw.as_bytes()).unwrap();
        assert!(parsed.is_multipart);
        assert!(parsed.body.contains("Reviewed-by: Someone"));
    }

    #[test]
    fn undecodable_body_keeps_headers_out() {
        let raw: &[u8] = b"Message-ID: <e@x>\r\n\
From: A <a@x.org>\r\n\
Subject: [PATCH] caf\xe9\r\n\
Content-Type: text/plain; charset=x-bogus\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
!!!not base64 \xe9\xff\r\n";
        let parsed = parse_message(raw).unwrap();
        assert!(parsed.body.starts_with("!!!not base64"));
        assert!(!parsed.body.contains("Message-ID"));
        assert!(!parsed.body.contains("Subject:"));
        assert!(!has_diff(&parsed.body));
    }

    #[test]
    fn unknown_charset_is_decoded_lossily() {
        let raw: &[u8] = b"Message-ID: <u@x>\r\n\
Subject: [PATCH] Thing\r\n\
Content-Type: text/plain; charset=x-bogus\r\n\
\r\n\
Reviewed-by: R \xe9 <r@x.org>\r\n";
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.message_id, "u@x");
        assert!(parsed.body.starts_with("Reviewed-by: R "));
    }

    #[test]
    fn supersedes_line_is_captured() {
        let raw = MessageBuilder::new("v2@x", "[PATCH v2] Thing")
            .body(&format!("Supersedes: <v1@x>\n\n{SAMPLE_DIFF}"))
            .build();
        let parsed = parse_message(raw.as_bytes()).unwrap();
        assert_eq!(parsed.supersedes.as_deref(), Some("v1@x"));
    }

    #[test]
    fn in_reply_to_keeps_first_id() {
        assert_eq!(
            parse_in_reply_to("<a@b> (Fam Zheng's message of today)").as_deref(),
            Some("a@b")
        );
        assert_eq!(parse_in_reply_to("bare@id").as_deref(), Some("bare@id"));
        assert_eq!(parse_in_reply_to("  "), None);
    }
}
