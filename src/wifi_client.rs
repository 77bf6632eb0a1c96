// ESP-IDF WiFi station
// The driver handle is shared with the transport and the captive portal, so
// every operation here preserves whatever access point configuration the
// portal currently has on the radio.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{
    AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi,
};
use log::{info, warn};

use crate::models::WifiCredentials;
use crate::wifi::WifiControl;

pub type SharedWifi = Rc<RefCell<BlockingWifi<EspWifi<'static>>>>;

pub fn init(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
) -> Result<SharedWifi> {
    let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs)).context("creating WiFi driver")?;
    let wifi = BlockingWifi::wrap(wifi, sys_loop).context("wrapping WiFi driver")?;
    Ok(Rc::new(RefCell::new(wifi)))
}

pub struct EspWifiStation {
    wifi: SharedWifi,
}

impl EspWifiStation {
    pub fn new(wifi: SharedWifi) -> Self {
        Self { wifi }
    }

    fn client_configuration(credentials: &WifiCredentials) -> Result<ClientConfiguration> {
        Ok(ClientConfiguration {
            ssid: credentials
                .ssid()
                .try_into()
                .map_err(|_| anyhow!("ssid exceeds the driver limit"))?,
            password: credentials
                .psk()
                .try_into()
                .map_err(|_| anyhow!("psk exceeds the driver limit"))?,
            auth_method: if credentials.psk().is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        })
    }
}

impl WifiControl for EspWifiStation {
    fn is_connected(&mut self) -> bool {
        self.wifi.borrow().is_connected().unwrap_or(false)
    }

    fn connect(&mut self, credentials: &WifiCredentials) -> Result<()> {
        let client = Self::client_configuration(credentials)?;

        let mut wifi = self.wifi.borrow_mut();
        let configuration = match wifi.get_configuration() {
            Ok(Configuration::AccessPoint(ap)) | Ok(Configuration::Mixed(_, ap)) => {
                Configuration::Mixed(client, ap)
            }
            _ => Configuration::Client(client),
        };
        wifi.set_configuration(&configuration)
            .context("applying station configuration")?;

        if !wifi.is_started().unwrap_or(false) {
            wifi.start().context("starting WiFi driver")?;
        }

        info!("Associating with {}", credentials.ssid());
        wifi.connect().context("associating with the network")?;
        wifi.wait_netif_up().context("waiting for an IP lease")?;
        info!("Connected to {}", credentials.ssid());
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.borrow_mut().disconnect() {
            warn!("Disconnect failed: {}", err);
        }
    }

    fn radio_enabled(&mut self) -> bool {
        self.wifi.borrow().is_started().unwrap_or(false)
    }

    fn reenable_and_reconnect(&mut self) {
        let mut wifi = self.wifi.borrow_mut();
        if !wifi.is_started().unwrap_or(false) {
            if let Err(err) = wifi.start() {
                warn!("Failed to restart the radio: {}", err);
                return;
            }
        }
        // Best effort with whatever station config is still applied.
        if let Err(err) = wifi.connect() {
            warn!("Reconnect after backoff failed: {}", err);
        }
    }

    fn active_credentials(&mut self) -> Option<WifiCredentials> {
        let wifi = self.wifi.borrow();
        let client = match wifi.get_configuration() {
            Ok(Configuration::Client(client)) | Ok(Configuration::Mixed(client, _)) => client,
            _ => return None,
        };
        match WifiCredentials::new(client.ssid.as_str(), client.password.as_str()) {
            Ok(credentials) => Some(credentials),
            Err(err) => {
                warn!("Driver reports unusable station credentials: {}", err);
                None
            }
        }
    }
}
