use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// On-wire schema generation reported by the device's `systemInfo`.
///
/// V1 devices send the deployment manifest and deployment status as JSON
/// strings; V2 devices send structured objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OnWireProtocol {
    V1,
    V2,
}

impl OnWireProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "evp1",
            Self::V2 => "evp2",
        }
    }
}

impl fmt::Display for OnWireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnWireProtocol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evp1" | "tb" => Ok(Self::V1),
            "evp2" | "evp2-tb" => Ok(Self::V2),
            other => Err(CoreError::Validation {
                message: format!("unknown protocol version '{other}'"),
            }),
        }
    }
}
