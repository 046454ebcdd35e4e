//! HTML entity decoding for legacy portal markup.
//!
//! The portal double-encodes some text (`&amp;#231;`), so cell text coming out
//! of the HTML parser can still carry entities. Named entities outside the
//! small set below are left untouched.
//!
//! [`normalize_text`] runs on text the HTML parser already decoded once, so
//! its pass only turns residual entities into letters. A literal `&lt;b&gt;`
//! in a cell (sent as `&amp;lt;b&amp;gt;`) stays as written.

use std::sync::LazyLock;

use regex::{Captures, Regex};

const NAMED: &[(&str, char)] = &[
    ("nbsp", ' '),
    ("amp", '&'),
    ("quot", '"'),
    ("lt", '<'),
    ("gt", '>'),
    ("apos", '\''),
    ("ccedil", 'ç'),
    ("Ccedil", 'Ç'),
    ("uuml", 'ü'),
    ("Uuml", 'Ü'),
    ("ouml", 'ö'),
    ("Ouml", 'Ö'),
];

static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[A-Za-z]{2,8});").expect("static pattern")
});

/// Decode numeric (`&#231;`, `&#xE7;`) and known named entities.
///
/// `&nbsp;` decodes to a plain space.
pub fn decode_entities(input: &str) -> String {
    replace_entities(input, |_| true)
}

fn replace_entities(input: &str, keep: impl Fn(char) -> bool) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    ENTITY
        .replace_all(input, |caps: &Captures<'_>| match decode_one(&caps[1]) {
            Some(c) if keep(c) => c.to_string(),
            _ => caps[0].to_string(),
        })
        .into_owned()
}

fn decode_one(body: &str) -> Option<char> {
    if let Some(num) = body.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        return match char::from_u32(code)? {
            '\u{a0}' => Some(' '),
            c => Some(c),
        };
    }
    NAMED
        .iter()
        .find(|(name, _)| *name == body)
        .map(|(_, c)| *c)
}

/// Decode residual letter entities, turn non-breaking spaces into spaces,
/// collapse runs of whitespace and trim.
///
/// Entities that decode to markup or punctuation (`&lt;`, `&amp;`, `&#60;`)
/// are kept verbatim.
pub fn normalize_text(input: &str) -> String {
    replace_entities(input, |c| c.is_alphanumeric() || c == ' ')
        .replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
