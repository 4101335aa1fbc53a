//! UCS2 transcoding and the `+CMGL:` list grammar.
//!
//! With the modem in text mode and the UCS2 character set, phone
//! numbers and message bodies travel as big-endian UTF-16 code units
//! rendered as 4 uppercase hex digits each. Status tokens and
//! timestamps stay plain ASCII even in UCS2 mode, so decoding is
//! best-effort: anything that is not valid UCS2 hex passes through
//! unchanged.

use crate::gsm::types::{SmsMessage, SmsStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  UCS2 hex transcoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Encode text as UCS2 hex: each UTF-16 code unit as 4 uppercase hex
/// digits, concatenated.
pub fn encode_ucs2(text: &str) -> String {
    text.encode_utf16().map(|u| format!("{:04X}", u)).collect()
}

/// Decode a UCS2 hex string back to text, best-effort.
///
/// Returns the input unchanged when it is not a whole number of 4-hex
/// code units, contains non-hex characters, or does not decode as
/// UTF-16. Some modems emit plain-ASCII fields even in UCS2 mode and
/// those must survive untouched.
pub fn decode_ucs2(input: &str) -> String {
    if input.len() % 4 != 0 || !input.chars().all(|c| c.is_ascii_hexdigit()) {
        return input.to_string();
    }
    let bytes = match hex::decode(input) {
        Ok(b) => b,
        Err(_) => return input.to_string(),
    };
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).unwrap_or_else(|_| input.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  CMGL list grammar
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const CMGL_PREFIX: &str = "+CMGL:";

/// Parse the captured text of an `AT+CMGL` exchange into messages.
///
/// Grammar per entry: a header line
/// `+CMGL: <index>,"<status>","<phone>",,"<timestamp>"` followed by one
/// content line, unless the next line starts another entry (some
/// modems list empty-body notifications). The CMGL timestamp itself
/// contains a comma, so the header splits into at least six fields.
///
/// Malformed entries are skipped and logged, never fatal: one bad line
/// must not abort the whole batch. A header whose index field does not
/// parse keeps the entry with `index: None`.
pub fn parse_list_response(raw: &str) -> Vec<SmsMessage> {
    let lines: Vec<&str> = raw.lines().map(str::trim).collect();
    let mut messages = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if !line.starts_with(CMGL_PREFIX) {
            i += 1;
            continue;
        }

        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() < 5 {
            log::warn!("skipping malformed CMGL header: {:?}", line);
            i += 1;
            continue;
        }

        let index = parts[0][CMGL_PREFIX.len()..].trim().parse::<u32>().ok();
        if index.is_none() {
            log::warn!("unparseable CMGL index in header: {:?}", line);
        }
        let status = SmsStatus::parse(strip_quotes(parts[1]));
        let phone = decode_ucs2(strip_quotes(parts[2]));
        // The timestamp spans the remaining fields.
        let timestamp = strip_quotes(&parts[4..].join(",")).to_string();

        // Content is the next line; a follow-on header means the body
        // was empty.
        let content = match lines.get(i + 1) {
            Some(next) if !next.starts_with(CMGL_PREFIX) => {
                i += 2;
                decode_ucs2(next)
            }
            _ => {
                i += 1;
                String::new()
            }
        };

        messages.push(SmsMessage {
            index,
            status,
            phone,
            content,
            timestamp,
        });
    }
    messages
}

fn strip_quotes(field: &str) -> &str {
    field.trim().trim_matches('"')
}
