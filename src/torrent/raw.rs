//! Finds byte spans inside bencoded data without decoding it, so hashes cover exactly what
//! was on disk.

use std::ops::Range;

use super::TorrentError;

fn malformed(reason: &str, at: usize) -> TorrentError {
    TorrentError::Malformed(format!("{reason} at byte {at}"))
}

/// The span of the value stored under `key` in the top level dictionary of `bytes`.
pub(super) fn dict_value_span(bytes: &[u8], key: &[u8]) -> Result<Range<usize>, TorrentError> {
    if bytes.first() != Some(&b'd') {
        return Err(malformed("expected a dictionary", 0));
    }
    let mut pos = 1;
    while bytes.get(pos) != Some(&b'e') {
        let key_span = string_span(bytes, pos)?;
        let value_start = key_span.end;
        let value_end = value_end(bytes, value_start)?;
        let colon = bytes[key_span.clone()]
            .iter()
            .position(|&byte| byte == b':')
            .ok_or_else(|| malformed("expected a string key", pos))?;
        if &bytes[pos + colon + 1..key_span.end] == key {
            return Ok(value_start..value_end);
        }
        pos = value_end;
    }
    Err(TorrentError::Malformed(format!(
        "missing `{}` dictionary",
        String::from_utf8_lossy(key)
    )))
}

/// The span of a whole `<len>:<bytes>` string starting at `start`.
fn string_span(bytes: &[u8], start: usize) -> Result<Range<usize>, TorrentError> {
    let colon = bytes[start..]
        .iter()
        .position(|&byte| byte == b':')
        .map(|offset| start + offset)
        .ok_or_else(|| malformed("unterminated string length", start))?;
    let digits = &bytes[start..colon];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(malformed("invalid string length", start));
    }
    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| malformed("invalid string length", start))?;
    let end = colon
        .checked_add(1 + len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| malformed("truncated string", start))?;
    Ok(start..end)
}

/// Where the value starting at `start` ends.
fn value_end(bytes: &[u8], start: usize) -> Result<usize, TorrentError> {
    match bytes.get(start) {
        Some(b'i') => bytes[start..]
            .iter()
            .position(|&byte| byte == b'e')
            .map(|offset| start + offset + 1)
            .ok_or_else(|| malformed("unterminated integer", start)),
        Some(b'l' | b'd') => {
            let mut pos = start + 1;
            loop {
                match bytes.get(pos) {
                    Some(b'e') => return Ok(pos + 1),
                    Some(_) => pos = value_end(bytes, pos)?,
                    None => return Err(malformed("unterminated container", start)),
                }
            }
        }
        Some(b'0'..=b'9') => Ok(string_span(bytes, start)?.end),
        Some(_) => Err(malformed("unexpected byte", start)),
        None => Err(malformed("unexpected end", start)),
    }
}

#[cfg(test)]
mod test_raw {
    use super::*;

    #[test]
    fn finds_nested_values() {
        let bytes = b"d3:agei3e4:infod1:bli1e2:xye1:a0:e4:zzzz1:qe";
        let span = dict_value_span(bytes, b"info").unwrap();
        assert_eq!(&bytes[span], b"d1:bli1e2:xye1:a0:e");
        let span = dict_value_span(bytes, b"zzzz").unwrap();
        assert_eq!(&bytes[span], b"1:q");
    }

    #[test]
    fn truncated_input_is_malformed() {
        assert!(dict_value_span(b"d4:infod1:a", b"info").is_err());
        assert!(dict_value_span(b"d4:info5:ab", b"info").is_err());
        assert!(dict_value_span(b"d3:fooi1ee", b"info").is_err());
        assert!(dict_value_span(b"l4:infoe", b"info").is_err());
    }
}
