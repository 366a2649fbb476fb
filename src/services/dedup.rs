use std::collections::HashMap;

use crate::models::detection::Detection;

/// Collapse repeated sightings of the same plate within a frame bucket.
///
/// Detections sharing `(plate_number, frame_number / bucket_frames)` are reduced
/// to the one with the highest confidence; on ties the earliest wins. Output
/// follows the order in which each key was first seen.
pub fn filter_duplicates(detections: Vec<Detection>, bucket_frames: u32) -> Vec<Detection> {
    let bucket_frames = bucket_frames.max(1);
    let mut slots: HashMap<(String, u32), usize> = HashMap::new();
    let mut kept: Vec<Detection> = Vec::new();

    for detection in detections {
        let key = (
            detection.plate_number.clone(),
            detection.frame_number / bucket_frames,
        );

        match slots.get(&key) {
            Some(&slot) => {
                if detection.confidence > kept[slot].confidence {
                    kept[slot] = detection;
                }
            }
            None => {
                slots.insert(key, kept.len());
                kept.push(detection);
            }
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::detection::{BoundingBox, VehicleType};

    fn detection(plate: &str, confidence: f64, frame: u32) -> Detection {
        Detection {
            plate_number: plate.to_string(),
            confidence,
            timestamp: "00:00".to_string(),
            frame_number: frame,
            bounding_box: BoundingBox::default(),
            state_code: None,
            vehicle_type: VehicleType::Unknown,
            is_valid: true,
        }
    }

    #[test]
    fn test_keeps_highest_confidence_per_bucket() {
        let result = filter_duplicates(
            vec![
                detection("A", 0.6, 1),
                detection("A", 0.9, 5),
                detection("B", 0.7, 40),
            ],
            30,
        );

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].plate_number, "A");
        assert_eq!(result[0].confidence, 0.9);
        assert_eq!(result[0].frame_number, 5);
        assert_eq!(result[1].plate_number, "B");
    }

    #[test]
    fn test_same_plate_in_different_buckets_survives() {
        let result = filter_duplicates(
            vec![detection("A", 0.6, 29), detection("A", 0.5, 30)],
            30,
        );
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_tie_keeps_first_seen() {
        let result = filter_duplicates(
            vec![detection("A", 0.8, 2), detection("A", 0.8, 3)],
            30,
        );
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].frame_number, 2);
    }

    #[test]
    fn test_order_follows_first_seen_key() {
        let result = filter_duplicates(
            vec![
                detection("B", 0.5, 1),
                detection("A", 0.5, 2),
                detection("B", 0.9, 3),
            ],
            30,
        );
        let plates: Vec<_> = result.iter().map(|d| d.plate_number.as_str()).collect();
        assert_eq!(plates, vec!["B", "A"]);
        assert_eq!(result[0].confidence, 0.9);
    }

    #[test]
    fn test_bucket_width_is_configurable() {
        let input = vec![detection("A", 0.5, 1), detection("A", 0.7, 2)];
        assert_eq!(filter_duplicates(input.clone(), 1).len(), 2);
        assert_eq!(filter_duplicates(input, 0).len(), 2);
    }
}
