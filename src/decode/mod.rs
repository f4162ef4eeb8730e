//! Raw RFC 5322 bytes to clean header strings and a plain-text body.
//!
//! Nothing in here fails hard except an unparseable message as a whole:
//! undecodable header bytes are replaced, undecodable body parts are
//! dropped.
use chrono::DateTime;
use html2text::from_read;
use mailparse::{addrparse_header, parse_header, DispositionType, MailAddr, MailHeader, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::errors::{AppError, AppResult};

static MESSAGE_ID_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^<>\s]+>").expect("valid message-id pattern"));

/// Header fields and body of one message, before identifier synthesis and
/// date parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedMessage {
    pub message_id: Option<String>,
    pub from_name: String,
    pub from_email: String,
    pub subject: String,
    pub body: String,
    pub date_header: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

pub fn decode_message(raw: &[u8]) -> AppResult<DecodedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Decode(format!("unparseable message: {e}")))?;

    let (from_name, from_email) = raw_header(&parsed, "From")
        .map(split_from)
        .unwrap_or_default();

    Ok(DecodedMessage {
        message_id: header(&parsed, "Message-ID").and_then(|v| first_message_id(&v)),
        from_name,
        from_email,
        subject: header(&parsed, "Subject").unwrap_or_default(),
        body: extract_body(&parsed),
        date_header: header(&parsed, "Date").filter(|d| !d.trim().is_empty()),
        in_reply_to: header(&parsed, "In-Reply-To").and_then(|v| first_message_id(&v)),
        references: header(&parsed, "References")
            .map(|v| split_message_ids(&v))
            .unwrap_or_default(),
    })
}

/// Decodes a header value that may hold several charset-tagged encoded
/// words. Fragments without a charset are read as UTF-8; bytes that do not
/// decode are replaced.
pub fn decode_header_text(raw: &str) -> String {
    let unfolded = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if !unfolded.contains("=?") {
        return unfolded;
    }

    let line = format!("X-Decode: {unfolded}\r\n");
    match parse_header(line.as_bytes()) {
        Ok((parsed, _)) => parsed.get_value().trim().to_string(),
        Err(_) => unfolded,
    }
}

/// Body text of `parsed`. Plain-text parts that are not attachments win;
/// HTML parts are only used, stripped of markup, when no plain part exists.
/// Parts are concatenated in the order they appear.
pub fn extract_body(parsed: &ParsedMail) -> String {
    let mut plain = Vec::new();
    let mut html = Vec::new();
    collect_text_parts(parsed, &mut plain, &mut html);

    if !plain.is_empty() {
        plain.concat()
    } else {
        html.concat()
    }
}

fn collect_text_parts(part: &ParsedMail, plain: &mut Vec<String>, html: &mut Vec<String>) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_text_parts(sub, plain, html);
        }
        return;
    }

    if part.get_content_disposition().disposition == DispositionType::Attachment {
        return;
    }

    if part.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
        if let Some(text) = part_text(part) {
            plain.push(text);
        }
    } else if part.ctype.mimetype.eq_ignore_ascii_case("text/html") {
        if let Some(markup) = part_text(part) {
            html.push(html_to_text(&markup));
        }
    }
}

/// Declared charset first; on failure the transfer-decoded bytes as lossy
/// UTF-8; `None` when even that is impossible.
fn part_text(part: &ParsedMail) -> Option<String> {
    match part.get_body() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(
                charset = %part.ctype.charset,
                error = %e,
                "Decoding part with declared charset failed; retrying as UTF-8"
            );
            match part.get_body_raw() {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable body part");
                    None
                }
            }
        }
    }
}

fn html_to_text(html: &str) -> String {
    from_read(html.as_bytes(), 80).unwrap_or_default()
}

fn raw_header<'a>(parsed: &'a ParsedMail, name: &str) -> Option<&'a MailHeader<'a>> {
    parsed
        .headers
        .iter()
        .find(|h| h.get_key().eq_ignore_ascii_case(name))
}

fn header(parsed: &ParsedMail, name: &str) -> Option<String> {
    raw_header(parsed, name)
        .map(|h| decode_header_text(&String::from_utf8_lossy(h.get_value_raw())))
}

/// (display name, address). Addresses are split before the display name is
/// decoded, so an encoded comma stays inside the name. Unparseable values
/// keep the whole decoded text as the address.
fn split_from(from: &MailHeader) -> (String, String) {
    let first = addrparse_header(from)
        .ok()
        .and_then(|list| list.iter().next().cloned());

    match first {
        Some(MailAddr::Single(info)) => (info.display_name.unwrap_or_default(), info.addr),
        Some(MailAddr::Group(group)) => match group.addrs.into_iter().next() {
            Some(info) => (info.display_name.unwrap_or_default(), info.addr),
            None => (group.group_name, String::new()),
        },
        None => {
            let text = decode_header_text(&String::from_utf8_lossy(from.get_value_raw()));
            (String::new(), text.trim().to_string())
        }
    }
}

/// Seconds since the epoch for an RFC 5322 `Date`, or `None` when the value
/// is not a date. mailparse's parser is only a fallback for obsolete
/// syntax; it reads garbage as 0, which is treated as a failure.
pub fn parse_date(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.timestamp());
    }
    mailparse::dateparse(raw).ok().filter(|ts| *ts > 0)
}

/// Every `<id>` token in order. A header without angle brackets is split on
/// whitespace instead and each token is bracketed, so bare ids compare
/// equal to the `<id>` form replies carry.
pub fn split_message_ids(raw: &str) -> Vec<String> {
    let bracketed: Vec<String> = MESSAGE_ID_TOKEN
        .find_iter(raw)
        .map(|m| m.as_str().to_string())
        .collect();
    if !bracketed.is_empty() {
        return bracketed;
    }
    raw.split_whitespace().filter_map(bracket_id).collect()
}

fn bracket_id(token: &str) -> Option<String> {
    let bare = token.trim_start_matches('<').trim_end_matches('>');
    (!bare.is_empty()).then(|| format!("<{bare}>"))
}

fn first_message_id(raw: &str) -> Option<String> {
    split_message_ids(raw).into_iter().next()
}
