// Core data model
// Opaque identifiers are fixed-length byte sequences validated at the
// boundary; once constructed they are immutable. Overwriting one means
// erasing it from flash and re-provisioning, never partial mutation.

use std::fmt;

use serde::{Serialize, Serializer};

/// Length of the device authentication token handed out by `POST /user/login`.
pub const AUTH_TOKEN_LEN: usize = 64;

/// Length of the plant identifier handed out by `PUT /plant`.
pub const PLANT_ID_LEN: usize = 19;

/// The payload had the wrong size for a fixed-length identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadLength {
    pub expected: usize,
    pub actual: usize,
}

impl fmt::Display for BadLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected {} bytes, got {} bytes",
            self.expected, self.actual
        )
    }
}

impl std::error::Error for BadLength {}

/// Opaque 64-byte token identifying this device to the backend.
///
/// Produced only by a successful authentication; erased from flash whenever
/// the backend answers `Forbidden`.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken([u8; AUTH_TOKEN_LEN]);

impl AuthToken {
    /// Validates a server payload into a token. ASCII only; the token travels
    /// back in an `Authorization` header.
    pub fn from_payload(payload: &[u8]) -> Result<Self, BadLength> {
        if payload.len() != AUTH_TOKEN_LEN || !payload.is_ascii() {
            return Err(BadLength {
                expected: AUTH_TOKEN_LEN,
                actual: payload.len(),
            });
        }
        let mut raw = [0u8; AUTH_TOKEN_LEN];
        raw.copy_from_slice(payload);
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        // Constructor enforced ASCII.
        std::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the full credential.
        write!(f, "AuthToken({}…)", &self.as_str()[..6.min(self.as_str().len())])
    }
}

/// Opaque 19-byte identifier of the monitored plant.
///
/// Produced only by a successful plant registration; erased whenever event
/// reporting answers `NotFound` (the plant may belong to another account now).
#[derive(Clone, PartialEq, Eq)]
pub struct PlantId([u8; PLANT_ID_LEN]);

impl PlantId {
    pub fn from_payload(payload: &[u8]) -> Result<Self, BadLength> {
        if payload.len() != PLANT_ID_LEN || !payload.is_ascii() {
            return Err(BadLength {
                expected: PLANT_ID_LEN,
                actual: payload.len(),
            });
        }
        let mut raw = [0u8; PLANT_ID_LEN];
        raw.copy_from_slice(payload);
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl fmt::Debug for PlantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlantId({})", self.as_str())
    }
}

impl Serialize for PlantId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// WiFi station credentials collected by the captive portal or read back from
/// the radio after an externally triggered association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    ssid: String,
    psk: String,
}

/// 802.11 limits: SSID up to 32 octets, WPA2 passphrase up to 63.
const MAX_SSID_LEN: usize = 32;
const MAX_PSK_LEN: usize = 63;

impl WifiCredentials {
    pub fn new(ssid: &str, psk: &str) -> Result<Self, InvalidCredentials> {
        if ssid.is_empty() || ssid.len() > MAX_SSID_LEN {
            return Err(InvalidCredentials::BadSsid);
        }
        if psk.len() > MAX_PSK_LEN {
            return Err(InvalidCredentials::BadPsk);
        }
        Ok(Self {
            ssid: ssid.to_string(),
            psk: psk.to_string(),
        })
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn psk(&self) -> &str {
        &self.psk
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidCredentials {
    BadSsid,
    BadPsk,
}

impl fmt::Display for InvalidCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSsid => write!(f, "SSID must be 1..=32 bytes"),
            Self::BadPsk => write!(f, "passphrase must be at most 63 bytes"),
        }
    }
}

impl std::error::Error for InvalidCredentials {}

/// One measurement snapshot. Read-only input to event reporting; never
/// persisted by the firmware.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub air_temperature_celsius: f32,
    pub air_humidity_percentage: f32,
    pub air_heat_index_celsius: f32,
    pub soil_temperature_celsius: f32,
    pub soil_resistivity_raw: u16,
    pub firmware_hash: String,
    pub plant_id: PlantId,
}

/// Captured at the panic site, consumed once by the recovery controller.
#[derive(Debug, Clone)]
pub struct PanicData {
    pub msg: String,
    pub file: String,
    pub line: u32,
    pub func: String,
}
