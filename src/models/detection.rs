use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Vehicle class reported by the detection worker.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VehicleType {
    Car,
    Motorcycle,
    Truck,
    Bus,
    #[default]
    #[serde(other)]
    Unknown,
}

/// One plate observation within one frame.
///
/// The serialized form is the detection worker's output contract, so the
/// annotation fields default when the worker omits them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub plate_number: String,
    pub confidence: f64,
    /// Source-relative time, e.g. "01:23"
    pub timestamp: String,
    pub frame_number: u32,
    pub bounding_box: BoundingBox,
    #[serde(default)]
    pub state_code: Option<String>,
    #[serde(default)]
    pub vehicle_type: VehicleType,
    #[serde(default = "default_true")]
    pub is_valid: bool,
}

impl Detection {
    /// Contract checks on worker output: confidence in [0, 1] and a 1-based frame.
    pub fn check(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if self.frame_number == 0 {
            return Err("frame number must be 1-based".to_string());
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
