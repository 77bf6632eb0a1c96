// NVS-backed credential store
// One namespace holds the whole credential chain. Values are stored as plain
// strings; absence of a key is the "never provisioned" state, not an error.

use anyhow::{Context, Result};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use log::{info, warn};

use crate::models::{AuthToken, PlantId, WifiCredentials};
use crate::storage::CredentialStore;

const NVS_NAMESPACE: &str = "iop";
const AUTH_TOKEN_KEY: &str = "auth_token";
const PLANT_ID_KEY: &str = "plant_id";
const WIFI_SSID_KEY: &str = "wifi_ssid";
const WIFI_PSK_KEY: &str = "wifi_psk";

pub struct NvsCredentialStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsCredentialStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .context("opening credential NVS namespace")?;
        info!("Credential storage ready");
        Ok(Self { nvs })
    }

    fn read_str(&mut self, key: &str, buf: &mut [u8]) -> Option<String> {
        match self.nvs.get_str(key, buf) {
            Ok(Some(value)) if !value.is_empty() => Some(value.to_string()),
            Ok(_) => None,
            Err(err) => {
                // A flash read error reads as "absent"; the loop re-provisions
                // rather than crashing over it.
                warn!("NVS read of {} failed: {}", key, err);
                None
            }
        }
    }

    fn erase_key(&mut self, key: &str) -> Result<()> {
        // remove() on a missing key reports false, which is fine: erases are
        // idempotent at this seam.
        self.nvs
            .remove(key)
            .with_context(|| format!("erasing NVS key {}", key))?;
        Ok(())
    }
}

impl CredentialStore for NvsCredentialStore {
    fn read_auth_token(&mut self) -> Option<AuthToken> {
        let mut buf = [0u8; 128];
        let raw = self.read_str(AUTH_TOKEN_KEY, &mut buf)?;
        match AuthToken::from_payload(raw.as_bytes()) {
            Ok(token) => Some(token),
            Err(err) => {
                warn!("Stored auth token is corrupt ({}), ignoring it", err);
                None
            }
        }
    }

    fn write_auth_token(&mut self, token: &AuthToken) -> Result<()> {
        self.nvs
            .set_str(AUTH_TOKEN_KEY, token.as_str())
            .context("writing auth token")?;
        info!("Auth token persisted");
        Ok(())
    }

    fn erase_auth_token(&mut self) -> Result<()> {
        self.erase_key(AUTH_TOKEN_KEY)
    }

    fn read_plant_id(&mut self) -> Option<PlantId> {
        let mut buf = [0u8; 64];
        let raw = self.read_str(PLANT_ID_KEY, &mut buf)?;
        match PlantId::from_payload(raw.as_bytes()) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!("Stored plant id is corrupt ({}), ignoring it", err);
                None
            }
        }
    }

    fn write_plant_id(&mut self, id: &PlantId) -> Result<()> {
        self.nvs
            .set_str(PLANT_ID_KEY, id.as_str())
            .context("writing plant id")?;
        info!("Plant id persisted");
        Ok(())
    }

    fn erase_plant_id(&mut self) -> Result<()> {
        self.erase_key(PLANT_ID_KEY)
    }

    fn read_wifi_credentials(&mut self) -> Option<WifiCredentials> {
        let mut ssid_buf = [0u8; 64];
        let mut psk_buf = [0u8; 96];
        let ssid = self.read_str(WIFI_SSID_KEY, &mut ssid_buf)?;
        // An absent PSK is an open network, not a missing credential.
        let psk = match self.nvs.get_str(WIFI_PSK_KEY, &mut psk_buf) {
            Ok(Some(psk)) => psk.to_string(),
            _ => String::new(),
        };
        match WifiCredentials::new(&ssid, &psk) {
            Ok(credentials) => Some(credentials),
            Err(err) => {
                warn!("Stored wifi credentials are corrupt ({}), ignoring", err);
                None
            }
        }
    }

    fn write_wifi_credentials(&mut self, credentials: &WifiCredentials) -> Result<()> {
        self.nvs
            .set_str(WIFI_SSID_KEY, credentials.ssid())
            .context("writing wifi ssid")?;
        self.nvs
            .set_str(WIFI_PSK_KEY, credentials.psk())
            .context("writing wifi psk")?;
        info!("WiFi credentials persisted for {}", credentials.ssid());
        Ok(())
    }

    fn erase_wifi_credentials(&mut self) -> Result<()> {
        self.erase_key(WIFI_SSID_KEY)?;
        self.erase_key(WIFI_PSK_KEY)?;
        Ok(())
    }
}
