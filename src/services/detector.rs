use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::models::detection::Detection;
use crate::models::job::ProcessingMode;

/// Per-job parameters forwarded to the detection worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    pub confidence_threshold: f64,
    pub mode: ProcessingMode,
}

/// Opaque per-frame plate recogniser.
#[async_trait]
pub trait DetectionWorker: Send + Sync {
    /// Detect plates in one frame image. `frame_index` is 1-based.
    async fn detect(
        &self,
        frame: &Path,
        frame_index: u32,
        params: &DetectionParams,
    ) -> Result<Vec<Detection>, DetectionError>;
}

/// Worker output contract: `{ "plates": [...] }`.
#[derive(Debug, Deserialize)]
struct DetectorOutput {
    #[serde(default)]
    plates: Vec<Detection>,
}

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("Failed to start detection worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Detection worker exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("Detection worker timed out after {0} seconds")]
    Timeout(u64),

    #[error("Malformed detection worker output: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Detection worker returned invalid plate {plate}: {reason}")]
    InvalidPlate { plate: String, reason: String },

    #[error("Failed to read frame: {0}")]
    Frame(#[source] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Parse the worker's stdout / response body. One out-of-contract plate
/// rejects the whole frame.
pub fn parse_detector_output(raw: &[u8]) -> Result<Vec<Detection>, DetectionError> {
    let output: DetectorOutput = serde_json::from_slice(raw)?;
    for plate in &output.plates {
        plate.check().map_err(|reason| DetectionError::InvalidPlate {
            plate: plate.plate_number.clone(),
            reason,
        })?;
    }
    Ok(output.plates)
}

/// Runs an external recogniser once per frame:
/// `<program> <script> <frame> <index> <threshold> <mode>`, JSON on stdout.
#[derive(Debug, Clone)]
pub struct SubprocessDetector {
    program: String,
    script: PathBuf,
    timeout: Duration,
}

impl SubprocessDetector {
    pub fn new(program: impl Into<String>, script: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            script: script.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DetectionWorker for SubprocessDetector {
    async fn detect(
        &self,
        frame: &Path,
        frame_index: u32,
        params: &DetectionParams,
    ) -> Result<Vec<Detection>, DetectionError> {
        let child = Command::new(&self.program)
            .arg(&self.script)
            .arg(frame)
            .arg(frame_index.to_string())
            .arg(params.confidence_threshold.to_string())
            .arg(params.mode.as_ref())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(DetectionError::Spawn)?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| DetectionError::Timeout(self.timeout.as_secs()))?
            .map_err(DetectionError::Spawn)?;

        if !output.status.success() {
            return Err(DetectionError::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_detector_output(&output.stdout)
    }
}

/// Client for a recogniser exposed over HTTP with the same output contract.
pub struct HttpDetector {
    http: Client,
    endpoint: String,
}

impl HttpDetector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DetectionError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl DetectionWorker for HttpDetector {
    async fn detect(
        &self,
        frame: &Path,
        frame_index: u32,
        params: &DetectionParams,
    ) -> Result<Vec<Detection>, DetectionError> {
        let image_bytes = tokio::fs::read(frame).await.map_err(DetectionError::Frame)?;

        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(&image_bytes),
            "frameNumber": frame_index,
            "confidenceThreshold": params.confidence_threshold,
            "processingMode": params.mode,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request_body)
            .send()
            .await?
            .error_for_status()?;

        let body = response.bytes().await?;
        parse_detector_output(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::detection::VehicleType;

    fn params() -> DetectionParams {
        DetectionParams {
            confidence_threshold: 0.5,
            mode: ProcessingMode::Fast,
        }
    }

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("detector.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_parse_output() {
        let raw = br#"{"success": true, "frame_number": 2, "plates": [
            {"plateNumber": "KA05C1234", "confidence": 0.77, "timestamp": "00:00",
             "frameNumber": 2, "boundingBox": {"x": 1, "y": 2, "width": 3, "height": 4},
             "vehicleType": "truck"}
        ]}"#;
        let plates = parse_detector_output(raw).unwrap();
        assert_eq!(plates.len(), 1);
        assert_eq!(plates[0].vehicle_type, VehicleType::Truck);
        assert_eq!(plates[0].frame_number, 2);
    }

    #[test]
    fn test_parse_rejects_out_of_range_plates() {
        let raw = br#"{"plates": [
            {"plateNumber": "KA05C1234", "confidence": 0.8, "timestamp": "00:00",
             "frameNumber": 2, "boundingBox": {"x": 1, "y": 2, "width": 3, "height": 4}},
            {"plateNumber": "MH01AB1234", "confidence": 87.5, "timestamp": "00:00",
             "frameNumber": 2, "boundingBox": {"x": 1, "y": 2, "width": 3, "height": 4}}
        ]}"#;
        match parse_detector_output(raw) {
            Err(DetectionError::InvalidPlate { plate, .. }) => assert_eq!(plate, "MH01AB1234"),
            other => panic!("expected invalid plate, got {other:?}"),
        }

        let raw = br#"{"plates": [
            {"plateNumber": "KA05C1234", "confidence": 0.8, "timestamp": "00:00",
             "frameNumber": 0, "boundingBox": {"x": 1, "y": 2, "width": 3, "height": 4}}
        ]}"#;
        assert!(matches!(
            parse_detector_output(raw),
            Err(DetectionError::InvalidPlate { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_detector_output(b"Traceback (most recent call last)"),
            Err(DetectionError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_subprocess_receives_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"echo "{\"plates\": [{\"plateNumber\": \"MH01AB1234\", \"confidence\": $3, \"timestamp\": \"00:00\", \"frameNumber\": $2, \"boundingBox\": {\"x\": 0, \"y\": 0, \"width\": 1, \"height\": 1}, \"vehicleType\": \"$4\"}]}""#,
        );
        let detector = SubprocessDetector::new("sh", script, Duration::from_secs(10));

        let plates = detector
            .detect(Path::new("/tmp/frame_00007.jpg"), 7, &params())
            .await
            .unwrap();

        assert_eq!(plates.len(), 1);
        assert_eq!(plates[0].frame_number, 7);
        assert_eq!(plates[0].confidence, 0.5);
        // "fast" is not a vehicle type, so it falls back
        assert_eq!(plates[0].vehicle_type, VehicleType::Unknown);
    }

    #[tokio::test]
    async fn test_subprocess_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo 'model missing' >&2\nexit 3\n");
        let detector = SubprocessDetector::new("sh", script, Duration::from_secs(10));

        let err = detector
            .detect(Path::new("/tmp/frame.jpg"), 1, &params())
            .await
            .unwrap_err();

        match err {
            DetectionError::Exit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "model missing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_subprocess_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 5\n");
        let detector = SubprocessDetector::new("sh", script, Duration::from_millis(100));

        let err = detector
            .detect(Path::new("/tmp/frame.jpg"), 1, &params())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectionError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let detector = SubprocessDetector::new(
            "definitely-not-a-real-interpreter",
            "x.py",
            Duration::from_secs(1),
        );
        let err = detector
            .detect(Path::new("/tmp/frame.jpg"), 1, &params())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectionError::Spawn(_)));
    }
}
