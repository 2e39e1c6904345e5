use std::borrow::Cow;

const REDACTED: &str = "REDACTED";

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let nee = needle.as_bytes();
    if nee.is_empty() {
        return Some(0);
    }
    if nee.len() > hay.len() {
        return None;
    }
    (0..=hay.len() - nee.len()).find(|&i| {
        hay[i..i + nee.len()]
            .iter()
            .zip(nee)
            .all(|(a, b)| a.to_ascii_lowercase() == b.to_ascii_lowercase())
    })
}

// Replaces everything after `marker` up to the first byte matching `stop`.
fn redact_after(text: &str, marker: &str, stop: impl Fn(char) -> bool) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = find_ascii_case_insensitive(rest, marker) {
        let end = idx + marker.len();
        out.push_str(&rest[..end]);
        rest = &rest[end..];

        let consumed: usize = rest
            .chars()
            .take_while(|ch| !stop(*ch))
            .map(char::len_utf8)
            .sum();
        if consumed > 0 {
            out.push_str(REDACTED);
        }
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    out
}

/// Strips bearer tokens, cookies and JSON token fields from text bound for logs.
pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    let mut value = input.to_string();

    value = redact_after(&value, "Bearer ", |ch| {
        ch.is_whitespace() || ch == '"' || ch == ','
    });
    value = redact_after(&value, "Cookie: ", |ch| ch == '\n' || ch == '\r');
    for field in [
        "\"accessToken\":\"",
        "\"refreshToken\":\"",
        "\"password\":\"",
    ] {
        value = redact_after(&value, field, |ch| ch == '"');
    }
    for param in ["access_token=", "refresh_token="] {
        value = redact_after(&value, param, |ch| ch == '&' || ch.is_whitespace());
    }

    if value == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(value)
    }
}
