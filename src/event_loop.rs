// Control loop
// Single-threaded orchestration: every tick handles at most one unit of work,
// picked by a strict priority order. Interrupt flags first, then provisioning,
// then plant registration, then the periodic report, then the heartbeat.
// Nothing in here crashes the device; failures degrade to a later retry.

use std::time::Instant;

use log::{debug, error, info, warn};

use crate::api::Api;
use crate::config;
use crate::interrupts::{InterruptEvent, InterruptMailbox};
use crate::models::{AuthToken, Event, PlantId};
use crate::portal::{CredentialsServer, PortalSurface, ProvisioningError};
use crate::sensors::{heat_index_celsius, PlantSensor};
use crate::status::ApiStatus;
use crate::storage::CredentialStore;
use crate::transport::HttpTransport;
use crate::wifi::WifiControl;

pub struct EventLoop<S, W, P, T, N>
where
    S: CredentialStore,
    W: WifiControl,
    P: PortalSurface,
    T: HttpTransport,
    N: PlantSensor,
{
    store: S,
    wifi: W,
    server: CredentialsServer<P>,
    api: Api<T>,
    sensor: N,
    mailbox: &'static InterruptMailbox,
    firmware_hash: String,
    next_report: Option<Instant>,
    next_heartbeat: Option<Instant>,
}

impl<S, W, P, T, N> EventLoop<S, W, P, T, N>
where
    S: CredentialStore,
    W: WifiControl,
    P: PortalSurface,
    T: HttpTransport,
    N: PlantSensor,
{
    pub fn new(
        store: S,
        wifi: W,
        server: CredentialsServer<P>,
        api: Api<T>,
        sensor: N,
        mailbox: &'static InterruptMailbox,
        firmware_hash: String,
    ) -> Self {
        Self {
            store,
            wifi,
            server,
            api,
            sensor,
            mailbox,
            firmware_hash,
            next_report: None,
            next_heartbeat: None,
        }
    }

    /// Hands the collaborators the recovery path needs after a crashed tick.
    pub fn recovery_handles(&mut self) -> (&mut S, &mut W, &mut Api<T>) {
        (&mut self.store, &mut self.wifi, &mut self.api)
    }

    /// One scheduling round. `now` is injected so tests control time.
    pub fn tick(&mut self, now: Instant) {
        self.handle_interrupt();

        let token = self.store.read_auth_token();
        let plant = self.store.read_plant_id();

        // The portal outlives the login so the user sees feedback; it comes
        // down only once the whole credential chain exists and works.
        if self.server.is_open()
            && self.wifi.is_connected()
            && token.is_some()
            && plant.is_some()
        {
            self.server.close();
        }

        if !self.wifi.is_connected() || token.is_none() {
            match self
                .server
                .serve(now, &mut self.store, &mut self.wifi, &mut self.api)
            {
                Ok(_) => {}
                Err(ProvisioningError::InvalidWifiConfig) => {
                    // Do not keep auto-retrying a configuration that just
                    // failed outright.
                    warn!("Unusable wifi configuration, dropping the stored copy");
                    if let Err(err) = self.store.erase_wifi_credentials() {
                        error!("Failed to erase wifi credentials: {:#}", err);
                    }
                }
                Err(err) => warn!("Portal submission rejected: {}", err),
            }
            return;
        }
        let Some(token) = token else { return };

        let plant = match plant {
            Some(plant) => plant,
            None => {
                self.register_plant(&token);
                return;
            }
        };

        if due(&self.next_report, now) {
            self.next_report = Some(now + config::REPORT_INTERVAL);
            self.report_measurements(&token, &plant);
            return;
        }

        if due(&self.next_heartbeat, now) {
            self.next_heartbeat = Some(now + config::HEARTBEAT_INTERVAL);
            debug!("Alive, next report in {:?}", self.next_report.map(|at| at - now));
        }
    }

    fn handle_interrupt(&mut self) {
        match self.mailbox.take() {
            Some(InterruptEvent::FactoryReset) => {
                warn!("Factory reset requested, wiping credentials");
                if let Err(err) = self.store.erase_wifi_credentials() {
                    error!("Failed to erase wifi credentials: {:#}", err);
                }
                if let Err(err) = self.store.erase_auth_token() {
                    error!("Failed to erase auth token: {:#}", err);
                }
                if let Err(err) = self.store.erase_plant_id() {
                    error!("Failed to erase plant id: {:#}", err);
                }
                self.wifi.disconnect();
            }
            Some(InterruptEvent::ConnectionEstablished) => {
                if let Some(active) = self.wifi.active_credentials() {
                    if self.store.read_wifi_credentials().as_ref() != Some(&active) {
                        info!("Persisting network {} from live association", active.ssid());
                        if let Err(err) = self.store.write_wifi_credentials(&active) {
                            error!("Failed to persist wifi credentials: {:#}", err);
                        }
                    }
                }
            }
            None => {}
        }
    }

    fn register_plant(&mut self, token: &AuthToken) {
        match self.api.register_plant(token) {
            Ok(plant) => {
                info!("Plant registered as {}", plant.as_str());
                if let Err(err) = self.store.write_plant_id(&plant) {
                    error!("Failed to persist plant id: {:#}", err);
                }
            }
            Err(ApiStatus::Forbidden) => {
                warn!("Token refused during plant registration, erasing it");
                if let Err(err) = self.store.erase_auth_token() {
                    error!("Failed to erase auth token: {:#}", err);
                }
            }
            // Unlike event reporting there is no plant id to invalidate yet.
            Err(ApiStatus::NotFound) => warn!("Plant registration answered NotFound"),
            Err(status) => warn!("Plant registration failed: {}", status),
        }
    }

    fn report_measurements(&mut self, token: &AuthToken, plant: &PlantId) {
        let readings = self.sensor.measure();
        let event = Event {
            air_temperature_celsius: readings.air_temperature_celsius,
            air_humidity_percentage: readings.air_humidity_percentage,
            air_heat_index_celsius: heat_index_celsius(
                readings.air_temperature_celsius,
                readings.air_humidity_percentage,
            ),
            soil_temperature_celsius: readings.soil_temperature_celsius,
            soil_resistivity_raw: readings.soil_resistivity_raw,
            firmware_hash: self.firmware_hash.clone(),
            plant_id: plant.clone(),
        };

        match self.api.register_event(token, &event) {
            ApiStatus::Ok => debug!("Event accepted"),
            ApiStatus::Forbidden => {
                warn!("Token refused during event report, erasing it");
                if let Err(err) = self.store.erase_auth_token() {
                    error!("Failed to erase auth token: {:#}", err);
                }
            }
            ApiStatus::NotFound => {
                warn!("Plant unknown server-side, erasing the stored id");
                if let Err(err) = self.store.erase_plant_id() {
                    error!("Failed to erase plant id: {:#}", err);
                }
            }
            ApiStatus::MustUpgrade => {
                // Routine upgrades ride the panic/recovery path; here the
                // event was accepted and we just note the hint.
                warn!("Server flagged this firmware as outdated");
            }
            ApiStatus::ClientBufferOverflow => {
                error!("Event did not fit its payload buffer, self-reporting");
                let status = self
                    .api
                    .report_error(token, plant, "event payload overflowed its buffer");
                if status != ApiStatus::Ok {
                    warn!("Error self-report failed: {}", status);
                }
            }
            status => warn!("Event report failed: {}", status),
        }
    }
}

fn due(next: &Option<Instant>, now: Instant) -> bool {
    next.map_or(true, |at| now >= at)
}
