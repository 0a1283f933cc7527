//! Analysis parameters shared by the library entry points and the CLI.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::fit::{FitKind, FitOptions};
use crate::quality::QualityThresholds;
use crate::readout::ReadoutCalibration;
use crate::IvError;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    pub fit_kind: FitKind,
    pub jump_threshold: Option<f64>,
    pub forced_cycle_index: Option<usize>,
    pub thresholds: QualityThresholds,
    pub readout: ReadoutCalibration,
}

impl AnalysisConfig {
    pub fn from_json_str(text: &str) -> Result<Self, IvError> {
        serde_json::from_str(text).map_err(|e| IvError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, IvError> {
        let text = fs::read_to_string(path)
            .map_err(|e| IvError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            kind: self.fit_kind,
            jump_threshold: self.jump_threshold,
            forced_cycle_index: self.forced_cycle_index,
        }
    }

    pub fn params_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// Hex SHA-256 of the serialized parameters, recorded with every report.
    pub fn params_hash_sha256(&self) -> Result<String, IvError> {
        let bytes = serde_json::to_vec(self).map_err(|e| IvError::Config(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let digest = Sha256::digest(bytes);
    digest
        .iter()
        .fold(String::with_capacity(digest.len() * 2), |mut out, b| {
            let _ = write!(&mut out, "{b:02x}");
            out
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = AnalysisConfig::from_json_str(
            r#"{"fit_kind": "COMBINED", "thresholds": {"residual_limit": 0.5}}"#,
        )
        .unwrap();
        assert_eq!(config.fit_kind, FitKind::Combined);
        assert_eq!(config.thresholds.residual_limit, 0.5);
        assert_eq!(config.thresholds.bias_margin, 0.2);
        assert_eq!(config.readout, ReadoutCalibration::default());
        assert!(config.jump_threshold.is_none());
    }

    #[test]
    fn test_malformed_json_is_a_config_error() {
        let err = AnalysisConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, IvError::Config(_)));
    }

    #[test]
    fn test_params_hash_tracks_parameters() {
        let base = AnalysisConfig::default();
        let hash = base.params_hash_sha256().unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, base.params_hash_sha256().unwrap());

        let changed = AnalysisConfig {
            jump_threshold: Some(5.0),
            ..AnalysisConfig::default()
        };
        assert_ne!(hash, changed.params_hash_sha256().unwrap());
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
