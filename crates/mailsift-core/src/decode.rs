//! RFC 2047 encoded-word decoding for header values
//!
//! Header text is split on whitespace and every `=?charset?encoding?payload?=`
//! token is decoded and transcoded to UTF-8. Other tokens are kept as they
//! are. Tokens are re-joined with single spaces.
//!
//! Encoders may split one string over several adjacent encoded words, cutting
//! through a multi-byte character. [`collapse_adjacent_words`] joins such runs
//! back into one word so the bytes are transcoded together.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use encoding_rs::Encoding;
use thiserror::Error;
use tracing::warn;

/// Base64 engine that accepts payloads with or without padding
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Failure to decode one encoded word
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("charset not supported: {0}")]
    UnsupportedCharset(String),

    #[error("encoding not supported: {0}")]
    UnsupportedEncoding(String),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("invalid quoted-printable payload: {0}")]
    InvalidQuotedPrintable(String),
}

/// Decode a header value, keeping any token that fails to decode verbatim
pub fn decode_header(text: &str) -> String {
    text.split_whitespace()
        .map(|token| match decode_token(token) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(token, error = %e, "Keeping undecodable header token");
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode a header value, failing on the first token that cannot be decoded
pub fn try_decode_header(text: &str) -> Result<String, DecodeError> {
    let tokens = text
        .split_whitespace()
        .map(decode_token)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tokens.join(" "))
}

/// Merge runs of adjacent encoded words that share charset and encoding
pub fn collapse_adjacent_words(text: &str) -> String {
    enum Piece<'a> {
        Text(&'a str),
        Word {
            charset: &'a str,
            encoding: &'a str,
            payload: String,
        },
    }

    let mut pieces: Vec<Piece<'_>> = Vec::new();
    for token in text.split_whitespace() {
        let Some((charset, encoding, payload)) = split_encoded_word(token) else {
            pieces.push(Piece::Text(token));
            continue;
        };

        if let Some(Piece::Word {
            charset: prev_charset,
            encoding: prev_encoding,
            payload: prev_payload,
        }) = pieces.last_mut()
        {
            if prev_charset.eq_ignore_ascii_case(charset) && prev_encoding.eq_ignore_ascii_case(encoding) {
                if let Some(joined) = join_payloads(encoding, prev_payload, payload) {
                    *prev_payload = joined;
                    continue;
                }
            }
        }

        pieces.push(Piece::Word {
            charset,
            encoding,
            payload: payload.to_string(),
        });
    }

    pieces
        .into_iter()
        .map(|piece| match piece {
            Piece::Text(text) => text.to_string(),
            Piece::Word {
                charset,
                encoding,
                payload,
            } => format!("=?{}?{}?{}?=", charset, encoding, payload),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Concatenate two payloads of the same encoding. Base64 halves are
/// re-encoded as one block since the first may end in padding.
fn join_payloads(encoding: &str, first: &str, second: &str) -> Option<String> {
    match encoding {
        "Q" | "q" => Some(format!("{}{}", first, second)),
        "B" | "b" => {
            let mut bytes = LENIENT_BASE64.decode(first).ok()?;
            bytes.extend(LENIENT_BASE64.decode(second).ok()?);
            Some(STANDARD.encode(bytes))
        }
        _ => None,
    }
}

fn decode_token(token: &str) -> Result<String, DecodeError> {
    let Some((charset, encoding, payload)) = split_encoded_word(token) else {
        return Ok(token.to_string());
    };

    let bytes = match encoding {
        "B" | "b" => LENIENT_BASE64
            .decode(payload)
            .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?,
        "Q" | "q" => decode_q(payload)?,
        other => return Err(DecodeError::UnsupportedEncoding(other.to_string())),
    };

    let encoding = lookup_charset(charset)
        .ok_or_else(|| DecodeError::UnsupportedCharset(charset.to_string()))?;
    let (decoded, _) = encoding.decode_without_bom_handling(&bytes);
    Ok(decoded.into_owned())
}

/// Split `=?charset?encoding?payload?=` into its parts
fn split_encoded_word(token: &str) -> Option<(&str, &str, &str)> {
    if token.len() < 6 || !token.starts_with("=?") || !token.ends_with("?=") {
        return None;
    }
    if token.matches('?').count() != 4 {
        return None;
    }

    let mut parts = token[2..token.len() - 2].splitn(3, '?');
    let charset = parts.next()?;
    let encoding = parts.next()?;
    let payload = parts.next()?;
    if charset.is_empty() || encoding.is_empty() {
        return None;
    }
    Some((charset, encoding, payload))
}

/// The "Q" encoding: quoted-printable with `_` standing for a space
fn decode_q(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let input = payload.as_bytes();
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            b'_' => out.push(b' '),
            b'=' => {
                let hex = input
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| DecodeError::InvalidQuotedPrintable(payload.to_string()))?;
                out.push(hex);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }

    Ok(out)
}

/// Normalize a declared charset name to a label the WHATWG table knows
pub fn normalize_charset(charset: &str) -> String {
    let lowered = charset.trim().to_ascii_lowercase();

    // RFC 2231 language suffix, e.g. "utf-8*en"
    let name = lowered.split('*').next().unwrap_or_default();

    let folded: String = name
        .chars()
        .map(|c| match c {
            '_' | ':' | '.' | '/' | '\\' => '-',
            c => c,
        })
        .collect();

    match folded.as_str() {
        "ks-c-5601-1987" | "ks-c-5601-1989" | "cp949" | "x-windows-949" | "windows-949" => {
            return "euc-kr".to_string()
        }
        "7bit" | "8bit" | "utf8" => return "utf-8".to_string(),
        "latin-1" => return "latin1".to_string(),
        "iso-8859-8-i" => return "iso-8859-8".to_string(),
        _ => {}
    }

    if let Some(rest) = folded.strip_prefix("x-euc-") {
        return format!("euc-{}", rest);
    }

    let code_page = folded
        .strip_prefix("x-cp")
        .or_else(|| folded.strip_prefix("cp"));
    if let Some(number) = code_page.filter(|n| is_windows_code_page(n)) {
        return format!("windows-{}", number);
    }

    folded
}

fn is_windows_code_page(number: &str) -> bool {
    matches!(
        number,
        "874" | "1250" | "1251" | "1252" | "1253" | "1254" | "1255" | "1256" | "1257" | "1258"
    )
}

/// Resolve a declared charset to an encoding
pub fn lookup_charset(charset: &str) -> Option<&'static Encoding> {
    let label = normalize_charset(charset);
    if let Some(encoding) = Encoding::for_label(label.as_bytes()) {
        return Some(encoding);
    }

    // IBM code pages are registered under either spelling
    let alias = if let Some(number) = label.strip_prefix("ibm") {
        format!("cp{}", number)
    } else if let Some(number) = label.strip_prefix("cp") {
        format!("ibm{}", number)
    } else {
        return None;
    };
    Encoding::for_label(alias.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_header_table() {
        let cases = [
            ("=?iso-8859-1?q?J=F6rg_Doe?=", "Jörg Doe"),
            ("=?utf-8?q?J=C3=B6rg?=", "Jörg"),
            ("Andr=?utf-8?q?=C3=A9?=", "Andr=?utf-8?q?=C3=A9?="),
            ("=?utf-8?q?Andr=C3=A9?= Pirard", "André Pirard"),
            ("=?ISO-8859-1?B?SvZyZw==?=", "Jörg"),
            ("=?UTF-8?B?SsO2cmc=?=", "Jörg"),
            ("=?UTF-8?B?SsO2cmc?=", "Jörg"),
            (
                "illness notification =?8bit?Q?ALPH=C3=89E?=",
                "illness notification ALPHÉE",
            ),
            ("=?UTF-8?B?44G+44G/44KA44KB44KC?=", "まみむめも"),
            ("plain   text\r\n  folded", "plain text folded"),
        ];

        for (input, expected) in cases {
            assert_eq!(decode_header(input), expected, "input: {}", input);
        }
    }

    #[test]
    fn test_collapse_adjacent_words() {
        let cases = [
            ("=?utf-8?q?Andr?= =?utf-8?q?=C3=A9?=", "=?utf-8?q?Andr=C3=A9?="),
            ("=?UTF-8?B?4oI=?= =?UTF-8?B?rA==?=", "=?UTF-8?B?4oKs?="),
            ("=?utf-8?q?a?=\r\n =?UTF-8?Q?b?= =?utf-8?q?c?=", "=?utf-8?q?abc?="),
            // different encodings or charsets stay apart
            ("=?utf-8?q?a?= =?utf-8?b?Yg==?=", "=?utf-8?q?a?= =?utf-8?b?Yg==?="),
            ("=?utf-8?q?a?= =?iso-8859-1?q?b?=", "=?utf-8?q?a?= =?iso-8859-1?q?b?="),
            ("=?utf-8?q?a?= plain =?utf-8?q?b?=", "=?utf-8?q?a?= plain =?utf-8?q?b?="),
            // undecodable base64 is left for the decoder to report
            ("=?utf-8?b?!!!?= =?utf-8?b?Yg==?=", "=?utf-8?b?!!!?= =?utf-8?b?Yg==?="),
            ("no words here", "no words here"),
        ];

        for (input, expected) in cases {
            assert_eq!(collapse_adjacent_words(input), expected, "input: {}", input);
        }
    }

    #[test]
    fn test_split_multibyte_character() {
        let andre = collapse_adjacent_words("=?utf-8?q?Andr?= =?utf-8?q?=C3=A9?=");
        assert_eq!(decode_header(&andre), "André");

        let euro = collapse_adjacent_words("=?UTF-8?B?4oI=?= =?UTF-8?B?rA==?=");
        assert_eq!(decode_header(&euro), "€");
    }

    #[test]
    fn test_unsupported_charset() {
        let input = "hello =?x-klingon?q?abc?=";
        assert_eq!(
            try_decode_header(input),
            Err(DecodeError::UnsupportedCharset("x-klingon".to_string()))
        );
        assert_eq!(decode_header(input), input);
    }

    #[test]
    fn test_unsupported_encoding() {
        assert_eq!(
            try_decode_header("=?utf-8?x?abc?="),
            Err(DecodeError::UnsupportedEncoding("x".to_string()))
        );
    }

    #[test]
    fn test_invalid_payloads() {
        assert!(matches!(
            try_decode_header("=?utf-8?b?!!!?="),
            Err(DecodeError::InvalidBase64(_))
        ));
        assert!(matches!(
            try_decode_header("=?utf-8?q?bad=Z?="),
            Err(DecodeError::InvalidQuotedPrintable(_))
        ));
    }

    #[test]
    fn test_not_an_encoded_word() {
        // wrong number of '?'
        assert_eq!(decode_header("=?utf-8?q?a?b?="), "=?utf-8?q?a?b?=");
        assert_eq!(decode_header("=??="), "=??=");
    }

    #[test]
    fn test_normalize_charset() {
        let cases = [
            ("ISO_8859-1", "iso-8859-1"),
            ("ks_c_5601-1987", "euc-kr"),
            ("CP949", "euc-kr"),
            ("x-euc-jp", "euc-jp"),
            ("cp1252", "windows-1252"),
            ("x-cp1251", "windows-1251"),
            ("iso-8859-8-i", "iso-8859-8"),
            ("8bit", "utf-8"),
            ("UTF8", "utf-8"),
            ("latin-1", "latin1"),
            ("utf-8*en", "utf-8"),
            ("iso.8859.2", "iso-8859-2"),
        ];

        for (input, expected) in cases {
            assert_eq!(normalize_charset(input), expected, "input: {}", input);
        }
    }

    #[test]
    fn test_lookup_charset() {
        assert_eq!(lookup_charset("ks_c_5601-1987"), Some(encoding_rs::EUC_KR));
        assert_eq!(lookup_charset("cp1252"), Some(encoding_rs::WINDOWS_1252));
        assert_eq!(lookup_charset("cp866"), Some(encoding_rs::IBM866));
        assert_eq!(lookup_charset("ibm866"), Some(encoding_rs::IBM866));
        assert_eq!(lookup_charset("x-klingon"), None);
    }
}
