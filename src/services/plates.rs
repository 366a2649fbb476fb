use regex::Regex;
use std::sync::LazyLock;

use crate::models::detection::Detection;

/// Registration formats recognised by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateFormat {
    /// National BH series, e.g. BH01AB1234. Carries no state code.
    Bharat,
    /// MH01AB1234
    Standard,
    /// MH01A1234 or MH01AB1234
    Regional,
    /// MH01A1234
    Commercial,
    /// MH01AB123
    TwoWheeler,
}

impl PlateFormat {
    pub fn has_state_code(self) -> bool {
        !matches!(self, PlateFormat::Bharat)
    }
}

// Bharat must be tried first: BH plates also satisfy the standard pattern.
static PLATE_PATTERNS: LazyLock<Vec<(PlateFormat, Regex)>> = LazyLock::new(|| {
    [
        (PlateFormat::Bharat, r"^BH\d{2}[A-Z]{2}\d{4}$"),
        (PlateFormat::Standard, r"^[A-Z]{2}\d{2}[A-Z]{2}\d{4}$"),
        (PlateFormat::Regional, r"^[A-Z]{2}\d{2}[A-Z]{1,2}\d{4}$"),
        (PlateFormat::Commercial, r"^[A-Z]{2}\d{2}[A-Z]\d{4}$"),
        (PlateFormat::TwoWheeler, r"^[A-Z]{2}\d{2}[A-Z]{2}\d{3}$"),
    ]
    .into_iter()
    .map(|(format, pattern)| (format, Regex::new(pattern).expect("valid plate pattern")))
    .collect()
});

/// Match a plate string against the known formats.
pub fn classify_plate(plate_number: &str) -> Option<PlateFormat> {
    PLATE_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(plate_number))
        .map(|(format, _)| *format)
}

/// Two-letter region code for a valid, non-national plate.
pub fn state_code(plate_number: &str) -> Option<String> {
    region_code(plate_number, classify_plate(plate_number))
}

// Any plate with the BH prefix is national, whichever pattern it matched.
fn region_code(plate_number: &str, format: Option<PlateFormat>) -> Option<String> {
    match format {
        Some(f) if f.has_state_code() && !plate_number.starts_with("BH") => {
            Some(plate_number[..2].to_string())
        }
        _ => None,
    }
}

/// Annotate detections with `is_valid` and `state_code`.
///
/// Invalid plates are kept; only their annotations change.
pub fn validate_plates(detections: Vec<Detection>) -> Vec<Detection> {
    detections
        .into_iter()
        .map(|mut detection| {
            let format = classify_plate(&detection.plate_number);
            detection.is_valid = format.is_some();
            detection.state_code = region_code(&detection.plate_number, format);
            detection
        })
        .collect()
}
