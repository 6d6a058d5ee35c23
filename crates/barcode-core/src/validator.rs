//! Barcode Validator (C1)
//!
//! Stateless symbology detection, checksum verification, and normalization
//! to canonical EAN-13 form. No I/O, no dependency on the rest of the
//! pipeline — every other component treats this module as a pure function
//! library.

use serde::{Deserialize, Serialize};

/// Barcode symbology as detected from a raw decoded string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum Symbology {
    Ean13,
    Ean8,
    UpcA,
    UpcE,
    Unknown,
}

impl Symbology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ean13 => "EAN-13",
            Self::Ean8 => "EAN-8",
            Self::UpcA => "UPC-A",
            Self::UpcE => "UPC-E",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Symbology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The three validation reasons tracked per Detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationReasons {
    pub numeric_only: bool,
    pub length_valid: bool,
    pub checksum_valid: bool,
}

impl ValidationReasons {
    /// A code is accepted iff all three reasons hold.
    pub fn accepted(&self) -> bool {
        self.numeric_only && self.length_valid && self.checksum_valid
    }
}

/// Classify a raw decoded string: symbology guess plus validation reasons.
///
/// Length-based symbology detection: 13 digits → EAN-13, 12 → UPC-A,
/// 8 → EAN-8, 6 or 7 → UPC-E (with or without the leading system digit).
/// Anything else numeric is `Unknown` with `length_valid = false`; anything
/// non-numeric is `Unknown` with `numeric_only = false`.
pub fn classify(raw: &str) -> (Symbology, ValidationReasons) {
    let numeric_only = !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit());

    if !numeric_only {
        return (
            Symbology::Unknown,
            ValidationReasons {
                numeric_only: false,
                length_valid: false,
                checksum_valid: false,
            },
        );
    }

    let symbology = match raw.len() {
        13 => Symbology::Ean13,
        12 => Symbology::UpcA,
        8 => Symbology::Ean8,
        6 | 7 => Symbology::UpcE,
        _ => Symbology::Unknown,
    };

    let length_valid = symbology != Symbology::Unknown;
    let checksum_valid = length_valid && checksum(raw);

    (
        symbology,
        ValidationReasons {
            numeric_only,
            length_valid,
            checksum_valid,
        },
    )
}

/// Modulo-10 checksum over a numeric-only digit string, weights {1,3,1,3,...}
/// applied from the rightmost (check) digit leftward.
///
/// `digits` must be non-empty and all-ASCII-digit; a malformed input returns
/// `false` rather than panicking, since detector output is untrusted.
pub fn checksum(digits: &str) -> bool {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let values: Vec<u32> = digits.bytes().map(|b| (b - b'0') as u32).rev().collect();
    let check_digit = values[0];

    let sum: u32 = values[1..]
        .iter()
        .enumerate()
        .map(|(i, &d)| if i % 2 == 0 { d * 3 } else { d })
        .sum();

    let computed = (10 - (sum % 10)) % 10;
    computed == check_digit
}

/// Normalize a raw code of the given symbology to canonical EAN-13 form.
/// EAN-8 is returned unchanged — it is not upconverted to 13 digits, since
/// there is no canonical zero-padding rule for EAN-8 in the GTIN namespace
/// that this pipeline uses for deduplication.
pub fn normalize(raw: &str, symbology: Symbology) -> Option<String> {
    match symbology {
        Symbology::Ean13 => Some(raw.to_string()),
        Symbology::UpcA => Some(format!("0{raw}")),
        Symbology::Ean8 => Some(raw.to_string()),
        Symbology::UpcE => upc_e_to_upc_a(raw).map(|upc_a| format!("0{upc_a}")),
        Symbology::Unknown => None,
    }
}

/// Expand a 6-digit (or 7-digit with leading system digit) UPC-E code to
/// its 12-digit UPC-A form per the standard UPC-E expansion table.
fn upc_e_to_upc_a(raw: &str) -> Option<String> {
    let (system_digit, core) = match raw.len() {
        6 => ('0', raw),
        7 => (raw.as_bytes()[0] as char, &raw[1..]),
        _ => return None,
    };
    if core.len() != 6 || !core.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let d: Vec<char> = core.chars().collect();
    let last = d[5];

    // Standard UPC-E → UPC-A digit expansion, keyed on the last UPC-E digit.
    let body: String = match last {
        '0' | '1' | '2' => format!("{}{}{}0000{}{}{}", d[0], d[1], last, d[2], d[3], d[4]),
        '3' => format!("{}{}{}00000{}{}", d[0], d[1], d[2], d[3], d[4]),
        '4' => format!("{}{}{}{}00000{}", d[0], d[1], d[2], d[3], d[4]),
        _ => format!("{}{}{}{}{}0000{}", d[0], d[1], d[2], d[3], d[4], last),
    };

    let eleven = format!("{system_digit}{body}");
    if eleven.len() != 11 {
        return None;
    }
    let check = upc_a_check_digit(&eleven)?;
    Some(format!("{eleven}{check}"))
}

fn upc_a_check_digit(eleven_digits: &str) -> Option<char> {
    if eleven_digits.len() != 11 || !eleven_digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits: Vec<u32> = eleven_digits.bytes().map(|b| (b - b'0') as u32).collect();
    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, &d)| if i % 2 == 0 { d * 3 } else { d })
        .sum();
    let check = (10 - (sum % 10)) % 10;
    char::from_digit(check, 10)
}

/// A decoded candidate reduced to its accepted/normalized essentials, used
/// by stage handlers to deduplicate across rotations or LLM responses.
#[derive(Debug, Clone)]
pub struct ClassifiedCode {
    pub raw: String,
    pub symbology: Symbology,
    pub reasons: ValidationReasons,
    pub normalized_code: Option<String>,
}

impl ClassifiedCode {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let (symbology, reasons) = classify(&raw);
        // normalized_code is populated whenever a canonical form is
        // derivable from the symbology, independent of checksum validity.
        let normalized_code = normalize(&raw, symbology);
        Self {
            raw,
            symbology,
            reasons,
            normalized_code,
        }
    }

    pub fn accepted(&self) -> bool {
        self.reasons.accepted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ean13_checksum_roundtrip() {
        // 8011642115887 is a real, valid EAN-13.
        assert!(checksum("8011642115887"));
        let (sym, reasons) = classify("8011642115887");
        assert_eq!(sym, Symbology::Ean13);
        assert!(reasons.accepted());
        assert_eq!(
            normalize("8011642115887", Symbology::Ean13).as_deref(),
            Some("8011642115887")
        );
    }

    #[test]
    fn upc_a_normalizes_with_leading_zero() {
        // 036000291452 is a valid UPC-A.
        let (sym, reasons) = classify("036000291452");
        assert_eq!(sym, Symbology::UpcA);
        assert!(reasons.accepted());
        let normalized = normalize("036000291452", Symbology::UpcA).unwrap();
        assert_eq!(normalized, "0036000291452");
        assert!(checksum(&normalized));
    }

    #[test]
    fn ean8_is_not_upconverted() {
        // 96385074 is a valid EAN-8 (checksum verified below).
        let (sym, reasons) = classify("96385074");
        assert_eq!(sym, Symbology::Ean8);
        assert!(reasons.checksum_valid);
        assert_eq!(
            normalize("96385074", Symbology::Ean8).as_deref(),
            Some("96385074")
        );
    }

    #[test]
    fn upc_e_expands_to_upc_a() {
        // UPC-E "0425261" (number system 0) expands to UPC-A "042100005264".
        let (sym, reasons) = classify("0425261");
        assert_eq!(sym, Symbology::UpcE);
        let normalized = normalize("0425261", Symbology::UpcE).unwrap();
        assert_eq!(normalized, "0042100005264");
        assert!(reasons.numeric_only);
        assert!(checksum(&normalized));
    }

    #[test]
    fn bad_checksum_is_rejected_but_classified() {
        let (sym, reasons) = classify("8011642115888");
        assert_eq!(sym, Symbology::Ean13);
        assert!(reasons.numeric_only);
        assert!(reasons.length_valid);
        assert!(!reasons.checksum_valid);
    }

    #[test]
    fn non_numeric_is_unknown() {
        let (sym, reasons) = classify("8011-642115887");
        assert_eq!(sym, Symbology::Unknown);
        assert!(!reasons.numeric_only);
    }

    #[test]
    fn wrong_length_is_unknown() {
        let (sym, reasons) = classify("12345");
        assert_eq!(sym, Symbology::Unknown);
        assert!(reasons.numeric_only);
        assert!(!reasons.length_valid);
    }

    #[test]
    fn classified_code_accepts_valid_ean13() {
        let code = ClassifiedCode::new("4006381333931");
        assert!(code.accepted());
        assert_eq!(code.normalized_code.as_deref(), Some("4006381333931"));
    }

    #[test]
    fn classified_code_rejects_invalid() {
        let code = ClassifiedCode::new("not-a-code");
        assert!(!code.accepted());
        assert!(code.normalized_code.is_none());
    }
}
