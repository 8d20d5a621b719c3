// ── Device configuration document ──
//
// Mirrors the configuration the device reports on its state sub-key. The
// whole document is replaced on every valid report. Every section except
// `Adjustment` is required; unknown fields are ignored.

use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Hardware {
    pub sensor: String,
    pub sensor_id: String,
    #[serde(rename = "KG")]
    pub kg: String,
    pub application_processor: String,
    pub led_on: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Version {
    pub sensor_fw_version: String,
    pub sensor_loader_version: String,
    pub dnn_model_version: Vec<String>,
    pub ap_fw_version: String,
    pub ap_loader_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Status {
    /// Sensor state; drives [`StreamStatus`].
    pub sensor: String,
    pub application_processor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ota {
    pub sensor_fw_last_updated_date: String,
    pub sensor_loader_last_updated_date: String,
    pub dnn_model_last_updated_date: Vec<String>,
    pub ap_fw_last_updated_date: String,
    pub update_progress: i64,
    pub update_status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Image {
    pub frame_rate: i64,
    pub drive_mode: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Exposure {
    pub mode: String,
    pub gain: f64,
    pub shutter_speed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WhiteBalance {
    pub mode: String,
    pub gain_red: f64,
    pub gain_blue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rotation {
    pub rot_angle: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Direction {
    pub vertical: String,
    pub horizontal: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Network {
    #[serde(rename = "ProxyURL")]
    pub proxy_url: String,
    pub proxy_port: i64,
    pub proxy_user_name: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    pub subnet_mask: String,
    pub gateway: String,
    #[serde(rename = "DNS")]
    pub dns: String,
    #[serde(rename = "NTP")]
    pub ntp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Permission {
    pub factory_reset: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Adjustment {
    pub color_matrix: AdjustmentFile,
    pub gamma: AdjustmentFile,
    #[serde(rename = "LSC")]
    pub lsc: AdjustmentFile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AdjustmentFile {
    pub mode: String,
    pub file_name: String,
}

/// Device-reported configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceConfiguration {
    pub hardware: Hardware,
    pub version: Version,
    pub status: Status,
    #[serde(rename = "OTA")]
    pub ota: Ota,
    pub image: Image,
    pub exposure: Exposure,
    pub white_balance: WhiteBalance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<Adjustment>,
    pub rotation: Rotation,
    pub direction: Direction,
    pub network: Network,
    pub permission: Permission,
}

impl DeviceConfiguration {
    pub fn stream_status(&self) -> StreamStatus {
        StreamStatus::from_sensor_status(&self.status.sensor)
    }
}

// ── StreamStatus ─────────────────────────────────────────────────────

/// Whether the device is currently uploading frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum StreamStatus {
    Inactive,
    Active,
    Transitioning,
    Error,
}

impl StreamStatus {
    /// Map the device's sensor status string. Unknown states are
    /// transitional.
    pub fn from_sensor_status(value: &str) -> Self {
        match value {
            "Standby" | "Inactive" => Self::Inactive,
            "Streaming" | "Active" => Self::Active,
            "Error" => Self::Error,
            _ => Self::Transitioning,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use serde_json::{Value, json};

    use super::*;

    pub(crate) fn sample_json(sensor_status: &str) -> Value {
        json!({
            "Hardware": {
                "Sensor": "IMX500",
                "SensorId": "100A50500A2012062364012000000000",
                "KG": "1",
                "ApplicationProcessor": "ESP32",
                "LedOn": true
            },
            "Version": {
                "SensorFwVersion": "010707",
                "SensorLoaderVersion": "020301",
                "DnnModelVersion": ["0308000000000100"],
                "ApFwVersion": "D52408",
                "ApLoaderVersion": "D10300"
            },
            "Status": { "Sensor": sensor_status, "ApplicationProcessor": "Idle" },
            "OTA": {
                "SensorFwLastUpdatedDate": "",
                "SensorLoaderLastUpdatedDate": "",
                "DnnModelLastUpdatedDate": [""],
                "ApFwLastUpdatedDate": "",
                "UpdateProgress": 100,
                "UpdateStatus": "Done"
            },
            "Image": { "FrameRate": 2997, "DriveMode": 1 },
            "Exposure": { "Mode": "auto", "Gain": 1.0, "ShutterSpeed": 0.0 },
            "WhiteBalance": { "Mode": "auto", "GainRed": 0.0, "GainBlue": 0.0 },
            "Rotation": { "RotAngle": 0 },
            "Direction": { "Vertical": "Normal", "Horizontal": "Normal" },
            "Network": {
                "ProxyURL": "",
                "ProxyPort": 0,
                "ProxyUserName": "",
                "IPAddress": "",
                "SubnetMask": "",
                "Gateway": "",
                "DNS": "",
                "NTP": "pool.ntp.org"
            },
            "Permission": { "FactoryReset": false },
            "UnknownFutureSection": { "x": 1 }
        })
    }

    pub(crate) fn sample(sensor_status: &str) -> DeviceConfiguration {
        serde_json::from_value(sample_json(sensor_status)).unwrap()
    }

    #[test]
    fn parses_device_document() {
        let config = sample("Standby");
        assert_eq!(config.hardware.sensor, "IMX500");
        assert_eq!(config.network.ntp, "pool.ntp.org");
        assert!(config.adjustment.is_none());
        assert_eq!(config.stream_status(), StreamStatus::Inactive);
    }

    #[test]
    fn missing_section_is_rejected() {
        let mut doc = sample_json("Standby");
        doc.as_object_mut().unwrap().remove("Network");
        assert!(serde_json::from_value::<DeviceConfiguration>(doc).is_err());
    }

    #[test]
    fn sensor_status_mapping() {
        assert_eq!(StreamStatus::from_sensor_status("Standby"), StreamStatus::Inactive);
        assert_eq!(StreamStatus::from_sensor_status("Streaming"), StreamStatus::Active);
        assert_eq!(StreamStatus::from_sensor_status("Error"), StreamStatus::Error);
        assert_eq!(
            StreamStatus::from_sensor_status("Booting"),
            StreamStatus::Transitioning
        );
    }
}
