//! Query fingerprints and class IDs.
//!
//! A fingerprint is query text reduced to its shape: literals become `?`,
//! comments and redundant whitespace go, and everything is lowercased. Queries
//! that differ only in their literals share a fingerprint and therefore a
//! class.

use once_cell::sync::Lazy;
use qan_slowlog::Event;
use regex::Regex;

static IN_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bin ?\( ?\?(?: ?, ?\?)* ?\)").expect("Invalid regex pattern provided")
});
static VALUES_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bvalues? ?\([^)]*\)(?: ?, ?\([^)]*\))*").expect("Invalid regex pattern provided")
});

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Lowercase, drop comments, replace string and number literals with `?` and
/// squeeze whitespace, in one pass.
fn scrub(query: &str) -> String {
    let chars: Vec<char> = query.chars().collect();
    let mut out = String::with_capacity(query.len());
    let mut i = 0;

    let space = |out: &mut String| {
        if !out.is_empty() && !out.ends_with(' ') {
            out.push(' ');
        }
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\'' | '"' => {
                i += 1;
                while i < chars.len() {
                    match chars[i] {
                        '\\' => i += 2,
                        q if q == c && chars.get(i + 1) == Some(&c) => i += 2,
                        q if q == c => break,
                        _ => i += 1,
                    }
                }
                out.push('?');
                i += 1;
            }
            '`' => {
                i += 1;
                while i < chars.len() && chars[i] != '`' {
                    out.extend(chars[i].to_lowercase());
                    i += 1;
                }
                i += 1;
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
                space(&mut out);
            }
            '-' if next == Some('-')
                && chars.get(i + 2).is_none_or(|c| c.is_whitespace()) =>
            {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                space(&mut out);
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                space(&mut out);
            }
            c if c.is_whitespace() => {
                space(&mut out);
                i += 1;
            }
            c if c.is_ascii_digit() && !out.chars().next_back().is_some_and(is_word) => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
                out.push('?');
            }
            c => {
                out.extend(c.to_lowercase());
                i += 1;
            }
        }
    }

    let trimmed = out.trim_end_matches([' ', ';']);
    trimmed.trim_start().to_string()
}

/// The fingerprint of `query`.
#[must_use]
pub fn fingerprint(query: &str) -> String {
    let scrubbed = scrub(query);
    let collapsed = IN_LIST.replace_all(&scrubbed, "in(?+)");
    VALUES_LIST.replace_all(&collapsed, "values(?+)").into_owned()
}

/// The class ID of a fingerprint: the last 8 bytes of its MD5 digest in
/// upper-case hex.
#[must_use]
pub fn id(fingerprint: &str) -> String {
    let digest = md5::compute(fingerprint.as_bytes());
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&digest.0[8..]);
    format!("{:016X}", u64::from_be_bytes(tail))
}

/// Fingerprint and class ID of `event`. Admin commands are their own
/// fingerprint.
#[must_use]
pub fn classify(event: &Event) -> (String, String) {
    let fingerprint = if event.admin {
        event.query.to_lowercase()
    } else {
        fingerprint(&event.query)
    };
    (id(&fingerprint), fingerprint)
}
