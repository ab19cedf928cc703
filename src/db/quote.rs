//! SQL literal quoting.
//!
//! Escapes the same characters as `mysql_real_escape_string` and wraps the
//! result in single quotes. Text stays text and bytes stay bytes.

/// Bytes that must be escaped, with their replacement.
fn escape_for(byte: u8) -> Option<&'static [u8]> {
    match byte {
        b'\\' => Some(b"\\\\"),
        b'\'' => Some(b"\\'"),
        b'"' => Some(b"\\\""),
        0 => Some(b"\\0"),
        0x1a => Some(b"\\Z"),
        b'\r' => Some(b"\\r"),
        b'\n' => Some(b"\\n"),
        _ => None,
    }
}

fn quote_bytes(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 2);
    out.push(b'\'');
    for &byte in value {
        match escape_for(byte) {
            Some(escaped) => out.extend_from_slice(escaped),
            None => out.push(byte),
        }
    }
    out.push(b'\'');
    out
}

/// Values that can be embedded in SQL text as a quoted literal.
pub trait QuoteLiteral {
    type Output;

    fn quote_literal(&self) -> Self::Output;
}

impl QuoteLiteral for str {
    type Output = String;

    fn quote_literal(&self) -> String {
        let mut out = String::with_capacity(self.len() + 2);
        out.push('\'');
        for c in self.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '\'' => out.push_str("\\'"),
                '"' => out.push_str("\\\""),
                '\0' => out.push_str("\\0"),
                '\u{1a}' => out.push_str("\\Z"),
                '\r' => out.push_str("\\r"),
                '\n' => out.push_str("\\n"),
                c => out.push(c),
            }
        }
        out.push('\'');
        out
    }
}

impl QuoteLiteral for String {
    type Output = String;

    fn quote_literal(&self) -> String {
        self.as_str().quote_literal()
    }
}

impl QuoteLiteral for [u8] {
    type Output = Vec<u8>;

    fn quote_literal(&self) -> Vec<u8> {
        quote_bytes(self)
    }
}

impl QuoteLiteral for Vec<u8> {
    type Output = Vec<u8>;

    fn quote_literal(&self) -> Vec<u8> {
        quote_bytes(self)
    }
}

/// Quote `value` for direct use in a statement.
pub fn quote_literal<T: QuoteLiteral + ?Sized>(value: &T) -> T::Output {
    value.quote_literal()
}

/// Backtick-quote a possibly qualified identifier such as `shop.orders`.
pub fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}
