//! Mojibake detection and re-decoding for fetched chapter bytes.
//!
//! Grounded on `encoding_rs`'s use in the pack's ebook-conversion crate
//! (`zacharydenton-boko`) for exactly this kind of best-effort charset recovery: a
//! server's claimed encoding is a hint, not a guarantee, and serialized Chinese fiction
//! sites are a notorious source of mis-labeled GBK/GB18030 content served as UTF-8.

use encoding_rs::Encoding;

const REPLACEMENT_CHAR: char = '\u{FFFD}';
const PROBE_WINDOW_BYTES: usize = 2048;
const PROBE_CONTROL_OR_REPLACEMENT_THRESHOLD: usize = 5;
const FULL_TEXT_REPLACEMENT_RATE_THRESHOLD: f64 = 0.01;

fn replacement_rate(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let bad = text.chars().filter(|&c| c == REPLACEMENT_CHAR).count();
    bad as f64 / text.chars().count() as f64
}

fn probe_is_suspicious(text: &str) -> bool {
    let probe: String = text.chars().take(PROBE_WINDOW_BYTES).collect();
    let bad = probe
        .chars()
        .filter(|&c| c == REPLACEMENT_CHAR || (c.is_control() && c != '\n' && c != '\r' && c != '\t'))
        .count();
    bad > PROBE_CONTROL_OR_REPLACEMENT_THRESHOLD
}

/// Decides whether a decoding looks corrupted enough to warrant retrying with a
/// detected encoding: either the replacement-character rate across the whole text
/// exceeds 1%, or the first 2 KiB contains more than 5 replacement/control characters.
pub fn looks_mojibake(text: &str) -> bool {
    replacement_rate(text) > FULL_TEXT_REPLACEMENT_RATE_THRESHOLD || probe_is_suspicious(text)
}

/// Decodes `body` using `claimed_encoding` (falling back to UTF-8 if unrecognized or
/// absent); if the result looks like mojibake, re-decodes once using `encoding_rs`'s
/// byte-order-mark/statistical detection and keeps whichever decoding has the lower
/// replacement-character rate. Returns the chosen text and the encoding label used.
pub fn decode_with_mojibake_recovery(body: &[u8], claimed_encoding: Option<&str>) -> (String, String) {
    let claimed = claimed_encoding
        .and_then(Encoding::for_label)
        .unwrap_or(encoding_rs::UTF_8);
    let (primary_text, _, _) = claimed.decode(body);
    let primary_text = primary_text.into_owned();

    if !looks_mojibake(&primary_text) {
        return (primary_text, claimed.name().to_string());
    }

    let detected = detect_encoding(body);
    if detected.name() == claimed.name() {
        return (primary_text, claimed.name().to_string());
    }
    let (alt_text, _, _) = detected.decode(body);
    let alt_text = alt_text.into_owned();

    if replacement_rate(&alt_text) < replacement_rate(&primary_text) {
        (alt_text, detected.name().to_string())
    } else {
        (primary_text, claimed.name().to_string())
    }
}

/// Crude BOM/byte-pattern based detector covering the encodings serialized Chinese
/// fiction sites commonly mislabel: UTF-8, GBK/GB18030, and Big5. Falls back to UTF-8
/// when nothing distinctive is found, since that is the most common honest case.
fn detect_encoding(body: &[u8]) -> &'static Encoding {
    if body.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return encoding_rs::UTF_8;
    }
    if std::str::from_utf8(body).is_ok() {
        return encoding_rs::UTF_8;
    }
    let high_byte_pairs_valid_gbk = body
        .windows(2)
        .filter(|w| w[0] >= 0x81 && w[0] <= 0xFE && w[1] >= 0x40 && w[1] <= 0xFE)
        .count();
    if high_byte_pairs_valid_gbk > body.len() / 10 {
        return encoding_rs::GB18030;
    }
    encoding_rs::UTF_8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_utf8_text_is_not_mojibake() {
        assert!(!looks_mojibake("这是一段正常的中文文本，没有任何问题。"));
    }

    #[test]
    fn text_full_of_replacement_chars_is_mojibake() {
        let text: String = std::iter::repeat(REPLACEMENT_CHAR).take(100).collect();
        assert!(looks_mojibake(&text));
    }

    #[test]
    fn gb18030_bytes_decoded_as_utf8_are_recovered() {
        let (gb_bytes, _, _) = encoding_rs::GB18030.encode("这是一段测试文本用来验证乱码恢复逻辑是否正确工作");
        let (recovered, label) = decode_with_mojibake_recovery(&gb_bytes, Some("utf-8"));
        assert_eq!(label, "gb18030");
        assert!(recovered.contains("测试"));
    }

    #[test]
    fn honest_utf8_keeps_claimed_label() {
        let body = "普通的 UTF-8 文本".as_bytes();
        let (text, label) = decode_with_mojibake_recovery(body, Some("utf-8"));
        assert_eq!(label, "UTF-8");
        assert_eq!(text, "普通的 UTF-8 文本");
    }
}
