// Persisted credential store seam
// Flash is an external collaborator: reads return "absent" rather than
// erroring when a value was never written, and erases are idempotent so the
// orchestration loop and the recovery path can call them speculatively.

use anyhow::Result;

use crate::models::{AuthToken, PlantId, WifiCredentials};

/// Exactly one of {no token, token without plant id, token with plant id}
/// holds at any time; it is the discriminator the orchestration loop branches
/// on. The store itself does not enforce that; the loop's erase/re-provision
/// discipline does.
pub trait CredentialStore {
    fn read_auth_token(&mut self) -> Option<AuthToken>;
    fn write_auth_token(&mut self, token: &AuthToken) -> Result<()>;
    fn erase_auth_token(&mut self) -> Result<()>;

    fn read_plant_id(&mut self) -> Option<PlantId>;
    fn write_plant_id(&mut self, id: &PlantId) -> Result<()>;
    fn erase_plant_id(&mut self) -> Result<()>;

    fn read_wifi_credentials(&mut self) -> Option<WifiCredentials>;
    fn write_wifi_credentials(&mut self, credentials: &WifiCredentials) -> Result<()>;
    fn erase_wifi_credentials(&mut self) -> Result<()>;
}

/// In-memory store used by the unit tests; behaves like flash that starts
/// erased. Writes can be made to fail to exercise the loop's never-crash
/// guarantees.
#[cfg(test)]
pub struct MemoryStore {
    pub auth_token: Option<AuthToken>,
    pub plant_id: Option<PlantId>,
    pub wifi: Option<WifiCredentials>,
    pub fail_writes: bool,
    pub fail_erases: bool,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self {
            auth_token: None,
            plant_id: None,
            wifi: None,
            fail_writes: false,
            fail_erases: false,
        }
    }
}

#[cfg(test)]
impl CredentialStore for MemoryStore {
    fn read_auth_token(&mut self) -> Option<AuthToken> {
        self.auth_token.clone()
    }

    fn write_auth_token(&mut self, token: &AuthToken) -> Result<()> {
        if self.fail_writes {
            anyhow::bail!("simulated flash write failure");
        }
        self.auth_token = Some(token.clone());
        Ok(())
    }

    fn erase_auth_token(&mut self) -> Result<()> {
        if self.fail_erases {
            anyhow::bail!("simulated flash erase failure");
        }
        self.auth_token = None;
        Ok(())
    }

    fn read_plant_id(&mut self) -> Option<PlantId> {
        self.plant_id.clone()
    }

    fn write_plant_id(&mut self, id: &PlantId) -> Result<()> {
        if self.fail_writes {
            anyhow::bail!("simulated flash write failure");
        }
        self.plant_id = Some(id.clone());
        Ok(())
    }

    fn erase_plant_id(&mut self) -> Result<()> {
        if self.fail_erases {
            anyhow::bail!("simulated flash erase failure");
        }
        self.plant_id = None;
        Ok(())
    }

    fn read_wifi_credentials(&mut self) -> Option<WifiCredentials> {
        self.wifi.clone()
    }

    fn write_wifi_credentials(&mut self, credentials: &WifiCredentials) -> Result<()> {
        if self.fail_writes {
            anyhow::bail!("simulated flash write failure");
        }
        self.wifi = Some(credentials.clone());
        Ok(())
    }

    fn erase_wifi_credentials(&mut self) -> Result<()> {
        if self.fail_erases {
            anyhow::bail!("simulated flash erase failure");
        }
        self.wifi = None;
        Ok(())
    }
}
