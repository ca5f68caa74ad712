//! Charset normalization. Raw response bytes are decoded to UTF-8 before any HTML parsing.

use encoding_rs::{Encoding, GB18030, GBK, UTF_8};
use std::borrow::Cow;

/// How many leading bytes are scanned for a `charset=` declaration.
const SNIFF_LEN: usize = 2048;

/// Decode `raw` using `hint` if given, otherwise whatever charset the first 2 KB declare.
///
/// Sniffing only recognizes the GB family (gbk, gb2312, gb18030, hyphen/underscore variants
/// included). Anything else is treated as UTF-8, and valid UTF-8 passes through unchanged.
pub fn decode_html<'a>(raw: &'a [u8], hint: Option<&str>) -> (Cow<'a, str>, &'static Encoding) {
    let encoding = match hint.map(str::trim).filter(|h| !h.is_empty()) {
        Some(h) => encoding_for_hint(h),
        None => sniff_charset(raw).unwrap_or(UTF_8),
    };
    let (text, _malformed) = encoding.decode_without_bom_handling(raw);
    (text, encoding)
}

/// Explicit hints accept the GB aliases plus any WHATWG label; unknown labels fall back to UTF-8.
fn encoding_for_hint(hint: &str) -> &'static Encoding {
    gb_family(hint)
        .or_else(|| Encoding::for_label(hint.as_bytes()))
        .unwrap_or(UTF_8)
}

/// Find a GB-family `charset=` declaration in the first [SNIFF_LEN] bytes.
pub fn sniff_charset(raw: &[u8]) -> Option<&'static Encoding> {
    let head = &raw[..raw.len().min(SNIFF_LEN)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    head.match_indices("charset=").find_map(|(pos, needle)| {
        let value: String = head[pos + needle.len()..]
            .trim_start_matches(['"', '\'', ' '])
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        gb_family(&value)
    })
}

fn gb_family(label: &str) -> Option<&'static Encoding> {
    let normalized: String = label
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    match normalized.as_str() {
        // GBK is a superset of GB2312.
        "gbk" | "gb2312" | "cp936" => Some(GBK),
        "gb18030" => Some(GB18030),
        _ => None,
    }
}
