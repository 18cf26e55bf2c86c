//! Service configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use labelprint_core::config::{ConfigError, PrinterConfig};
use labelprint_core::printer::MAX_RASTER_WIDTH;

/// Placeholder used when a requester's name cannot be found
pub const DEFAULT_PLACEHOLDER_NAME: &str = "Unknown";

/// Label width used when none (or an unusable one) is configured
pub const DEFAULT_LABEL_WIDTH: u32 = 240;

/// Most labels a single request may ask for
pub const DEFAULT_MAX_LABELS: u32 = 50;

/// Settings of the print service, including the printer it drives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Printer link, media and timing
    pub printer: PrinterConfig,
    /// Label width in dots; the QR code is centered inside it
    pub label_width: u32,
    /// Requester id to display name
    pub names: HashMap<String, String>,
    /// Name printed when the lookup fails
    pub placeholder_name: String,
    /// TTF/OTF font for the caption under the QR code; no caption without it
    pub font_path: Option<PathBuf>,
    /// Requests asking for more labels are rejected
    pub max_labels_per_request: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            printer: PrinterConfig::default(),
            label_width: DEFAULT_LABEL_WIDTH,
            names: HashMap::new(),
            placeholder_name: DEFAULT_PLACEHOLDER_NAME.to_string(),
            font_path: None,
            max_labels_per_request: DEFAULT_MAX_LABELS,
        }
    }
}

impl ServiceConfig {
    /// Parse from JSON and validate
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(json)?;
        config.printer.label.validate()?;
        if config.label_width == 0 || config.label_width > MAX_RASTER_WIDTH {
            tracing::warn!(
                "label_width {} out of range, using {}",
                config.label_width,
                DEFAULT_LABEL_WIDTH
            );
            config.label_width = DEFAULT_LABEL_WIDTH;
        }
        if config.max_labels_per_request == 0 {
            tracing::warn!(
                "max_labels_per_request must be positive, using {}",
                DEFAULT_MAX_LABELS
            );
            config.max_labels_per_request = DEFAULT_MAX_LABELS;
        }
        Ok(config)
    }

    /// Load from a JSON file and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelprint_core::config::PortSelection;

    #[test]
    fn test_nested_printer_section() {
        let config = ServiceConfig::from_json(
            r#"{
                "printer": { "link": { "port": "/dev/ttyACM0" }, "label": { "density": 4 } },
                "label_width": 320,
                "names": { "u-1": "Mina" }
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.printer.link.port,
            PortSelection::Explicit("/dev/ttyACM0".to_string())
        );
        assert_eq!(config.printer.label.density, 4);
        assert_eq!(config.label_width, 320);
        assert_eq!(config.names.get("u-1").map(String::as_str), Some("Mina"));
        assert_eq!(config.placeholder_name, "Unknown");
        assert_eq!(config.font_path, None);
        assert_eq!(config.max_labels_per_request, DEFAULT_MAX_LABELS);
    }

    #[test]
    fn test_font_and_label_limit() {
        let config = ServiceConfig::from_json(
            r#"{ "font_path": "/usr/share/fonts/label.ttf", "max_labels_per_request": 8 }"#,
        )
        .unwrap();
        assert_eq!(
            config.font_path,
            Some(PathBuf::from("/usr/share/fonts/label.ttf"))
        );
        assert_eq!(config.max_labels_per_request, 8);

        let config = ServiceConfig::from_json(r#"{ "max_labels_per_request": 0 }"#).unwrap();
        assert_eq!(config.max_labels_per_request, DEFAULT_MAX_LABELS);
    }

    #[test]
    fn test_invalid_printer_settings_rejected() {
        let err = ServiceConfig::from_json(r#"{ "printer": { "label": { "label_type": 9 } } }"#);
        assert!(matches!(err, Err(ConfigError::OutOfRange { .. })));
    }

    #[test]
    fn test_oversized_label_width_clamped() {
        let config = ServiceConfig::from_json(r#"{ "label_width": 100000 }"#).unwrap();
        assert_eq!(config.label_width, DEFAULT_LABEL_WIDTH);
    }
}
