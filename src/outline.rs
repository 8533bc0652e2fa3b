//! Splits an accepted outline into ordered sub-unit descriptors.
//!
//! A line is a header when it reads like a numbered heading: `1) Title`,
//! `2. Title`, `Chapter 3: Title`, `Part IV - Title` or `第五章：Title`. Every
//! non-empty line after a header, up to the next one, belongs to that
//! header's excerpt. Lines before the first header are preamble and dropped.
//! Ordinals are assigned from the order headers appear in, never from the
//! numeral written in the header.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDescriptor {
    pub ordinal: u32,
    pub title: String,
    pub excerpt: String,
}

const NUMBERED_SEPARATORS: &[char] = &[')', '.', ':', '、', '：', '-', '）'];
const LABEL_SEPARATORS: &[char] = &[':', '：', '.', '-', '–', '—', ')', '、'];
const LABELS: &[&str] = &["chapter", "part", "section", "episode"];
const NUMBER_WORDS: &[&str] = &[
    "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten", "eleven",
    "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen", "nineteen",
    "twenty",
];
const CJK_NUMERALS: &str = "0123456789零〇一二三四五六七八九十百千两";
const ROMAN: &[(u32, &str)] = &[
    (1000, "M"),
    (900, "CM"),
    (500, "D"),
    (400, "CD"),
    (100, "C"),
    (90, "XC"),
    (50, "L"),
    (40, "XL"),
    (10, "X"),
    (9, "IX"),
    (5, "V"),
    (4, "IV"),
    (1, "I"),
];

/// Decomposes outline text into sub-unit descriptors, in header order.
pub fn decompose(outline: &str) -> Vec<UnitDescriptor> {
    let mut units = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in outline.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(title) = parse_header(line) {
            if let Some((title, excerpt)) = current.take() {
                push_unit(&mut units, title, &excerpt);
            }
            current = Some((title, Vec::new()));
        } else if let Some((_, excerpt)) = current.as_mut() {
            excerpt.push(line);
        }
    }

    if let Some((title, excerpt)) = current {
        push_unit(&mut units, title, &excerpt);
    }
    units
}

fn push_unit(units: &mut Vec<UnitDescriptor>, title: String, excerpt: &[&str]) {
    units.push(UnitDescriptor {
        ordinal: units.len() as u32 + 1,
        title,
        excerpt: excerpt.join("\n"),
    });
}

/// Returns the header title when `line` is a sub-unit header.
fn parse_header(line: &str) -> Option<String> {
    let stripped = line.trim_start_matches(['#', '*', '_', '>']).trim_start();
    let title = numbered(stripped)
        .or_else(|| labelled(stripped))
        .or_else(|| cjk(stripped))?;
    let title = clean(title);
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// `1) Title`, `12. Title`, `3: Title`.
fn numbered(line: &str) -> Option<&str> {
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 || digits > 3 {
        return None;
    }
    let rest = &line[digits..];
    let sep = rest.chars().next().filter(|c| NUMBERED_SEPARATORS.contains(c))?;
    let after = &rest[sep.len_utf8()..];
    // "1.5 km", "3-4 days" and "10:30 the ferry" are prose, not headings.
    let glued = !after.starts_with(char::is_whitespace);
    if glued && (matches!(sep, '.' | '-' | ':') || after.starts_with(|c: char| c.is_ascii_digit())) {
        return None;
    }
    let title = after.trim();
    if title.is_empty() { None } else { Some(title) }
}

/// `Chapter 3: Title`, `Part IV - Title`, `Chapter Two`.
fn labelled(line: &str) -> Option<&str> {
    let label = LABELS.iter().find(|label| {
        line.get(..label.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(label))
    })?;
    let rest = &line[label.len()..];
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim_start();
    let token_len = rest.len() - rest.trim_start_matches(char::is_alphanumeric).len();
    let token = &rest[..token_len];
    if !is_number_token(token) {
        return None;
    }
    let title = rest[token_len..]
        .trim_start_matches(|c: char| c.is_whitespace() || LABEL_SEPARATORS.contains(&c))
        .trim();
    if title.is_empty() { Some(line) } else { Some(title) }
}

fn is_number_token(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    token.chars().all(|c| c.is_ascii_digit())
        || is_roman_numeral(token)
        || NUMBER_WORDS.iter().any(|w| w.eq_ignore_ascii_case(token))
}

/// Canonical roman numerals only, in one case: `IV` and `xii`, not `IIII`,
/// `Mix` or words like `civil`.
fn is_roman_numeral(token: &str) -> bool {
    let upper = token.to_ascii_uppercase();
    if token != upper && token != token.to_ascii_lowercase() {
        return false;
    }
    let mut rest = upper.as_str();
    let mut value = 0;
    for &(n, glyph) in ROMAN {
        while let Some(tail) = rest.strip_prefix(glyph) {
            value += n;
            rest = tail;
        }
    }
    rest.is_empty() && value > 0 && to_roman(value) == upper
}

fn to_roman(mut value: u32) -> String {
    let mut out = String::new();
    for &(n, glyph) in ROMAN {
        while value >= n {
            out.push_str(glyph);
            value -= n;
        }
    }
    out
}

/// `第3章：Title`, `第十二章 Title`.
fn cjk(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('第')?;
    let end = rest.find('章')?;
    let numeral = &rest[..end];
    if numeral.is_empty() || !numeral.chars().all(|c| CJK_NUMERALS.contains(c)) {
        return None;
    }
    let title = rest[end + '章'.len_utf8()..]
        .trim_start_matches(|c: char| c.is_whitespace() || LABEL_SEPARATORS.contains(&c))
        .trim();
    if title.is_empty() { Some(line) } else { Some(title) }
}

fn clean(title: &str) -> &str {
    title.trim().trim_end_matches(['*', '_', '#']).trim()
}
