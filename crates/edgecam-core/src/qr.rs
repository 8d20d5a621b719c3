// ── Provisioning QR codes ──
//
// Devices are onboarded by scanning a QR code carrying broker, network,
// and time settings in a fixed field grammar:
//
//   AAIAAAAAAAAAAAAAAAAAAA==N=11;E=<host>;H=<port>;t=<0|1>;
//   [S=<ssid>;][P=<pass>;][I=<ip>;][K=<mask>;][G=<gw>;][D=<dns>;]T=<ntp>;U1FS
//
// `t=0` means TLS enabled. Optional fields are skipped when absent; the
// remaining fields keep their order. `qr_string` is the only producer of
// this grammar; `get_qr_object` encodes whatever it returns.

use std::fmt::Write as _;

use qrcode::{Color, EcLevel, QrCode};
use secrecy::{ExposeSecret, SecretString};

use crate::error::CoreError;

const HEADER: &str = "AAIAAAAAAAAAAAAAAAAAAA==";
const SCHEMA_VERSION: &str = "11";
const TERMINATOR: &str = "U1FS";

/// Parameters encoded into a provisioning QR code.
#[derive(Debug, Clone, Default)]
pub struct QrParams {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub tls_enabled: bool,
    pub ntp_server: String,
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<SecretString>,
    pub ip_address: Option<String>,
    pub subnet_mask: Option<String>,
    pub gateway: Option<String>,
    pub dns_server: Option<String>,
}

/// Render the provisioning string.
pub fn qr_string(params: &QrParams) -> String {
    let tls_flag = if params.tls_enabled { 0 } else { 1 };
    let mut out = format!(
        "{HEADER}N={SCHEMA_VERSION};E={};H={};t={tls_flag};",
        params.mqtt_host, params.mqtt_port
    );

    let optional = [
        ("S", params.wifi_ssid.as_deref()),
        ("P", params.wifi_password.as_ref().map(ExposeSecret::expose_secret)),
        ("I", params.ip_address.as_deref()),
        ("K", params.subnet_mask.as_deref()),
        ("G", params.gateway.as_deref()),
        ("D", params.dns_server.as_deref()),
    ];
    for (letter, value) in optional {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            let _ = write!(out, "{letter}={value};");
        }
    }

    let _ = write!(out, "T={};{TERMINATOR}", params.ntp_server);
    out
}

/// A QR module matrix including its quiet zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrMatrix {
    width: usize,
    dark: Vec<bool>,
}

impl QrMatrix {
    /// Side length in modules, border included.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn is_dark(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.width && self.dark[y * self.width + x]
    }

    /// Two characters per module, one text line per module row.
    pub fn to_ascii(&self) -> String {
        let mut out = String::with_capacity(self.width * (self.width * 2 + 1));
        for y in 0..self.width {
            for x in 0..self.width {
                out.push_str(if self.is_dark(x, y) { "██" } else { "  " });
            }
            out.push('\n');
        }
        out
    }
}

/// Widest quiet zone accepted by [`get_qr_object`].
pub const MAX_QR_BORDER: u32 = 100;

/// Encode the provisioning string at error-correction level M, padded by
/// `border` light modules on every side.
pub fn get_qr_object(params: &QrParams, border: u32) -> Result<QrMatrix, CoreError> {
    if border > MAX_QR_BORDER {
        return Err(CoreError::Validation {
            message: format!("QR border {border} exceeds {MAX_QR_BORDER} modules"),
        });
    }
    let payload = qr_string(params);
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::M).map_err(|e| {
        CoreError::Validation {
            message: format!("cannot encode provisioning QR code: {e}"),
        }
    })?;

    let inner = code.width();
    let border = usize::try_from(border).map_err(|_| CoreError::Validation {
        message: "QR border too large".into(),
    })?;
    let (width, cells) = border
        .checked_mul(2)
        .and_then(|pad| inner.checked_add(pad))
        .and_then(|width| Some((width, width.checked_mul(width)?)))
        .ok_or_else(|| CoreError::Validation {
            message: "QR border too large".into(),
        })?;
    let colors = code.to_colors();

    let mut dark = vec![false; cells];
    for (idx, color) in colors.iter().enumerate() {
        if *color == Color::Dark {
            let (x, y) = (idx % inner, idx / inner);
            dark[(y + border) * width + (x + border)] = true;
        }
    }

    Ok(QrMatrix { width, dark })
}
