//! Character encoding resolution for delimited files

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};

use crate::error::ExtractionError;

/// How an encoding was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMethod {
    Configured,
    ByteOrderMark,
    Utf8,
    Guessed,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedEncoding {
    pub encoding: &'static Encoding,
    pub method: DetectionMethod,
}

pub fn resolve_label(label: &str) -> Result<&'static Encoding, ExtractionError> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| ExtractionError::fatal(format!("unknown encoding label {label:?}")))
}

/// Pick an encoding for `bytes`.
///
/// Order: byte-order mark, valid UTF-8, a high-confidence guess, then
/// `fallback`. UTF-8 is judged on the sniffed prefix but must hold for the
/// whole buffer; when it breaks past the prefix the guess runs over
/// everything.
pub fn detect_encoding(bytes: &[u8], sniff_bytes: usize, fallback: &'static Encoding) -> DetectedEncoding {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return DetectedEncoding {
            encoding,
            method: DetectionMethod::ByteOrderMark,
        };
    }

    let sample = &bytes[..bytes.len().min(sniff_bytes.max(1))];
    let prefix_utf8 = match std::str::from_utf8(sample) {
        Ok(_) => true,
        // Sample cut in the middle of a multi-byte sequence
        Err(e) => e.error_len().is_none() && sample.len() < bytes.len(),
    };
    if prefix_utf8 && (sample.len() == bytes.len() || std::str::from_utf8(bytes).is_ok()) {
        return DetectedEncoding {
            encoding: UTF_8,
            method: DetectionMethod::Utf8,
        };
    }

    let sample = if prefix_utf8 { bytes } else { sample };
    let mut detector = EncodingDetector::new();
    detector.feed(sample, sample.len() == bytes.len());
    let (guess, confident) = detector.guess_assess(None, false);
    if confident {
        return DetectedEncoding {
            encoding: guess,
            method: DetectionMethod::Guessed,
        };
    }

    DetectedEncoding {
        encoding: fallback,
        method: DetectionMethod::Fallback,
    }
}

/// Decode a whole file, stripping a BOM that matches `encoding`.
///
/// Malformed sequences are an error rather than silently replaced.
pub fn decode(bytes: &[u8], encoding: &'static Encoding) -> Result<String, ExtractionError> {
    let (text, had_errors) = encoding.decode_with_bom_removal(bytes);
    if had_errors {
        return Err(ExtractionError::malformed(format!(
            "input is not valid {}",
            encoding.name()
        )));
    }
    Ok(text.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{UTF_16LE, WINDOWS_1252};

    #[test]
    fn test_bom_wins() {
        let mut bytes = vec![0xFF, 0xFE];
        bytes.extend("a,b\n".encode_utf16().flat_map(|u| u.to_le_bytes()));
        let detected = detect_encoding(&bytes, 10_000, WINDOWS_1252);
        assert_eq!(detected.encoding, UTF_16LE);
        assert_eq!(detected.method, DetectionMethod::ByteOrderMark);
        assert_eq!(decode(&bytes, detected.encoding).unwrap(), "a,b\n");
    }

    #[test]
    fn test_plain_utf8() {
        let detected = detect_encoding("id,name\n1,Zoë\n".as_bytes(), 10_000, WINDOWS_1252);
        assert_eq!(detected.encoding, UTF_8);
    }

    #[test]
    fn test_multibyte_split_at_sniff_boundary_is_still_utf8() {
        let text = "ab\u{e9}cd";
        // 'é' is two bytes at offsets 2..4; sniff three bytes to cut it
        let detected = detect_encoding(text.as_bytes(), 3, WINDOWS_1252);
        assert_eq!(detected.encoding, UTF_8);
    }

    #[test]
    fn test_single_byte_text_decodes_like_declared() {
        let text = "id,city,note\n1,Besançon,élève très âgé\n2,Orléans,déjà vu à côté\n";
        let (bytes, _, _) = WINDOWS_1252.encode(text);
        let detected = detect_encoding(&bytes, 10_000, WINDOWS_1252);
        assert_ne!(detected.encoding, UTF_8);
        assert_eq!(
            decode(&bytes, detected.encoding).unwrap(),
            decode(&bytes, resolve_label("windows-1252").unwrap()).unwrap()
        );
    }

    #[test]
    fn test_non_utf8_past_sniff_window_is_not_utf8() {
        let mut text = String::from("id,city,note\n");
        for i in 0..200 {
            text.push_str(&format!("{i},Paris,ok\n"));
        }
        text.push_str("200,Besançon,élève très âgé\n201,Orléans,déjà vu à côté\n");
        let (bytes, _, _) = WINDOWS_1252.encode(&text);

        let detected = detect_encoding(&bytes, 64, WINDOWS_1252);
        assert_ne!(detected.encoding, UTF_8);
        assert_ne!(detected.method, DetectionMethod::Utf8);
        assert_eq!(decode(&bytes, detected.encoding).unwrap(), text);
    }

    #[test]
    fn test_invalid_declared_utf8_is_malformed() {
        let err = decode(&[0x66, 0xFF, 0x6F], UTF_8).unwrap_err();
        assert_eq!(err.kind, crate::error::ExtractionErrorKind::Malformed);
    }

    #[test]
    fn test_unknown_label() {
        assert!(resolve_label("latin1").is_ok());
        assert!(resolve_label("klingon").is_err());
    }
}
