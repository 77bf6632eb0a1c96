// Backend API surface
// Abstracts the Internet-of-Plants REST endpoints so callers only ever see
// domain values paired with the `ApiStatus` taxonomy, never raw transport
// outcomes. Every payload goes through the bounded encoder with a capacity
// chosen for its endpoint.

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::bounded::encode_json;
use crate::models::{AuthToken, Event, PanicData, PlantId};
use crate::status::ApiStatus;
use crate::transport::{FirmwareSink, HttpMethod, HttpTransport, Response};

// Payload buffer capacities, per endpoint. Sized from worst-case field
// content: the event payload carries a 64-hex firmware hash, the panic
// payload a free-form message.
const LOGIN_PAYLOAD_CAPACITY: usize = 256;
const PLANT_PAYLOAD_CAPACITY: usize = 30;
const EVENT_PAYLOAD_CAPACITY: usize = 384;
const ERROR_PAYLOAD_CAPACITY: usize = 300;
const PANIC_PAYLOAD_CAPACITY: usize = 2048;

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct PlantRegistration<'a> {
    mac: &'a str,
}

#[derive(Serialize)]
struct ErrorReport<'a> {
    plant_id: &'a str,
    error: &'a str,
}

#[derive(Serialize)]
struct PanicReport<'a> {
    plant_id: Option<&'a str>,
    file: &'a str,
    line: u32,
    func: &'a str,
    msg: &'a str,
}

/// Result of an upgrade check that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// A new image was streamed and committed; the device must restart.
    Applied,
    /// The server answered 304: the running firmware is current.
    AlreadyCurrent,
}

pub struct Api<T: HttpTransport> {
    pub transport: T,
    firmware_hash: String,
}

impl<T: HttpTransport> Api<T> {
    pub fn new(transport: T, firmware_hash: String) -> Self {
        Self {
            transport,
            firmware_hash,
        }
    }

    pub fn is_connected(&mut self) -> bool {
        self.transport.is_connected()
    }

    pub fn mac_address(&mut self) -> String {
        self.transport.mac_address()
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    /// `POST /user/login`: trades account credentials for the device token.
    ///
    /// Account credentials are used once and never persisted; only the token
    /// is. Empty fields are refused locally, without a round-trip.
    pub fn authenticate(&mut self, email: &str, password: &str) -> Result<AuthToken, ApiStatus> {
        debug!("Authenticating account {}", email);

        if email.is_empty() || password.is_empty() {
            debug!("Empty email or password, refusing locally");
            return Err(ApiStatus::Forbidden);
        }

        let payload = encode_json::<LOGIN_PAYLOAD_CAPACITY, _>(&LoginRequest { email, password })
            .map_err(|overflow| {
                error!("Login payload overflow: {}", overflow);
                ApiStatus::ClientBufferOverflow
            })?;

        let response = self
            .transport
            .request(HttpMethod::Post, "/user/login", None, Some(payload.as_str()))
            .map_err(|err| {
                warn!("No usable response from /user/login: {}", err);
                ApiStatus::from_transport(&err)
            })?;

        let body = expect_payload(&response, "/user/login")?;
        AuthToken::from_payload(&body).map_err(|err| {
            error!("Server sent a malformed auth token: {}", err);
            ApiStatus::BrokenServer
        })
    }

    /// `PUT /plant`: registers this device's plant under the authenticated
    /// account, keyed by MAC address. Succeeds with the plant id.
    pub fn register_plant(&mut self, token: &AuthToken) -> Result<PlantId, ApiStatus> {
        let mac = self.transport.mac_address();
        debug!("Registering plant for MAC {}", mac);

        let payload = encode_json::<PLANT_PAYLOAD_CAPACITY, _>(&PlantRegistration { mac: &mac })
            .map_err(|overflow| {
                error!("Plant registration payload overflow: {}", overflow);
                ApiStatus::ClientBufferOverflow
            })?;

        let response = self
            .transport
            .request(HttpMethod::Put, "/plant", Some(token), Some(payload.as_str()))
            .map_err(|err| {
                warn!("No usable response from /plant: {}", err);
                ApiStatus::from_transport(&err)
            })?;

        let body = expect_payload(&response, "/plant")?;
        PlantId::from_payload(&body).map_err(|err| {
            error!("Server sent a malformed plant id: {}", err);
            ApiStatus::BrokenServer
        })
    }

    /// `POST /event`: reports one measurement snapshot.
    pub fn register_event(&mut self, token: &AuthToken, event: &Event) -> ApiStatus {
        debug!("Reporting event for plant {}", event.plant_id.as_str());

        let payload = match encode_json::<EVENT_PAYLOAD_CAPACITY, _>(event) {
            Ok(payload) => payload,
            Err(overflow) => {
                error!("Event payload overflow: {}", overflow);
                return ApiStatus::ClientBufferOverflow;
            }
        };

        match self
            .transport
            .request(HttpMethod::Post, "/event", Some(token), Some(payload.as_str()))
        {
            Ok(response) => ApiStatus::from_http(response.status),
            Err(err) => {
                warn!("No usable response from /event: {}", err);
                ApiStatus::from_transport(&err)
            }
        }
    }

    /// `POST /error`: self-reports a local, non-fatal firmware error so the
    /// backend can surface it to the account owner.
    pub fn report_error(&mut self, token: &AuthToken, plant_id: &PlantId, error: &str) -> ApiStatus {
        debug!("Reporting error: {}", error);

        let payload = match encode_json::<ERROR_PAYLOAD_CAPACITY, _>(&ErrorReport {
            plant_id: plant_id.as_str(),
            error,
        }) {
            Ok(payload) => payload,
            Err(overflow) => {
                error!("Error report payload overflow: {}", overflow);
                return ApiStatus::ClientBufferOverflow;
            }
        };

        match self
            .transport
            .request(HttpMethod::Post, "/error", Some(token), Some(payload.as_str()))
        {
            Ok(response) => ApiStatus::from_http(response.status),
            Err(err) => {
                warn!("No usable response from /error: {}", err);
                ApiStatus::from_transport(&err)
            }
        }
    }

    /// `POST /panic`: reports a fatal crash. Best effort: the caller never
    /// retries within the same halt, whatever this returns.
    pub fn report_panic(
        &mut self,
        token: &AuthToken,
        plant_id: Option<&PlantId>,
        data: &PanicData,
    ) -> ApiStatus {
        debug!("Reporting panic: {}", data.msg);

        let payload = match encode_json::<PANIC_PAYLOAD_CAPACITY, _>(&PanicReport {
            plant_id: plant_id.map(PlantId::as_str),
            file: &data.file,
            line: data.line,
            func: &data.func,
            msg: &data.msg,
        }) {
            Ok(payload) => payload,
            Err(overflow) => {
                // The message is fixed; retrying cannot help.
                error!("Panic report does not fit its buffer: {}", overflow);
                return ApiStatus::ClientBufferOverflow;
            }
        };

        match self
            .transport
            .request(HttpMethod::Post, "/panic", Some(token), Some(payload.as_str()))
        {
            Ok(response) => ApiStatus::from_http(response.status),
            Err(err) => {
                warn!("No usable response from /panic: {}", err);
                ApiStatus::from_transport(&err)
            }
        }
    }

    /// `GET /upgrade`: checks for and applies a firmware image. A committed
    /// image is reported as `Applied`; the caller owns the restart.
    pub fn upgrade(
        &mut self,
        token: &AuthToken,
        sink: &mut dyn FirmwareSink,
    ) -> Result<UpgradeOutcome, ApiStatus> {
        info!("Checking for a firmware upgrade");

        let hash = self.firmware_hash.clone();
        let status = self
            .transport
            .download("/upgrade", token, &hash, sink)
            .map_err(|err| {
                warn!("Upgrade transfer failed: {}", err);
                ApiStatus::from_transport(&err)
            })?;

        match status {
            200 => {
                info!("New firmware committed");
                Ok(UpgradeOutcome::Applied)
            }
            304 => {
                debug!("Firmware already current");
                Ok(UpgradeOutcome::AlreadyCurrent)
            }
            other => Err(ApiStatus::from_http(other)),
        }
    }
}

/// A 200 with a body, or the matching error status. A success with a missing
/// payload is a server contract violation.
fn expect_payload(response: &Response, path: &str) -> Result<Vec<u8>, ApiStatus> {
    match ApiStatus::from_http(response.status) {
        ApiStatus::Ok => match &response.payload {
            Some(body) if !body.is_empty() => Ok(body.clone()),
            _ => {
                error!("Server answered OK at {} but the payload is missing", path);
                Err(ApiStatus::BrokenServer)
            }
        },
        status => Err(status),
    }
}
