// Compile-time device configuration
// One device class, one provisioning flow, one recovery policy.

use std::time::Duration;

use crate::models::WifiCredentials;

/// Backend the monitor reports to. All REST paths in `api` are relative to it.
pub const API_HOST: &str = "https://api.internet-of-plants.org/v1";

/// Access point served while the provisioning portal is open.
pub const PORTAL_AP_SSID: &str = "iop-monitor";
pub const PORTAL_AP_PSK: &str = "plants-are-thirsty";

/// How often a measurement event is reported once fully provisioned.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(180);

/// Idle "waiting" log line is emitted at most this often.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Cooldown between attempts to rejoin the WiFi credential persisted in flash.
/// Keeps a flapping network from starving the captive portal's own traffic.
pub const STORED_WIFI_COOLDOWN: Duration = Duration::from_secs(15);

/// Independent cooldown for the hardcoded fallback credential, if any.
pub const FALLBACK_WIFI_COOLDOWN: Duration = Duration::from_secs(45);

/// Recovery backoff while connected: report/upgrade attempted, then wait.
pub const RECOVERY_BACKOFF_ONLINE: Duration = Duration::from_secs(10 * 60);

/// Recovery backoff while offline, before re-enabling the radio.
pub const RECOVERY_BACKOFF_OFFLINE: Duration = Duration::from_secs(60 * 60);

/// Optional build-time WiFi credential tried when nothing usable is stored.
/// Kept `None` for production images; set for bench/bringup builds.
pub const FALLBACK_WIFI: Option<(&str, &str)> = None;

pub fn fallback_wifi() -> Option<WifiCredentials> {
    let (ssid, psk) = FALLBACK_WIFI?;
    WifiCredentials::new(ssid, psk).ok()
}

/// Identity of the running firmware, reported with every event and sent as
/// `x-version` on upgrade checks so the server can answer 304.
///
/// On the device this is the OTA app ELF SHA-256; the portable fallback hashes
/// the package identity so host builds still produce a stable 64-hex string.
#[cfg(target_os = "espidf")]
pub fn firmware_hash() -> String {
    // The IDF writes a null-terminated hex string, not raw digest bytes, so
    // the buffer holds 64 hex chars plus the terminator.
    let mut hex = [0u8; 65];
    let written = unsafe {
        esp_idf_svc::sys::esp_ota_get_app_elf_sha256(hex.as_mut_ptr() as *mut i8, hex.len())
    };
    if written <= 0 {
        log::warn!("Unable to read app ELF SHA-256, falling back to build identity");
        return build_identity_hash();
    }
    let end = hex.iter().position(|&b| b == 0).unwrap_or(hex.len());
    match std::str::from_utf8(&hex[..end]) {
        Ok(s) if !s.is_empty() => s.to_string(),
        _ => {
            log::warn!("App ELF SHA-256 came back malformed, falling back to build identity");
            build_identity_hash()
        }
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn firmware_hash() -> String {
    build_identity_hash()
}

fn build_identity_hash() -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(env!("CARGO_PKG_NAME").as_bytes());
    hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
    hex_string(&hasher.finalize())
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // Infallible for String targets.
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_hash_is_stable_sha256_hex() {
        let a = firmware_hash();
        let b = firmware_hash();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
