// Captive portal provisioning machine
// Owns the portal lifecycle and the unattended reconnect attempts while the
// device is unprovisioned. The machine never blocks waiting for the user: one
// `serve` call does at most one unit of work and returns.

use std::time::Instant;

use anyhow::Result;
use log::{debug, error, info, warn};

use crate::api::Api;
use crate::config;
use crate::models::{AuthToken, WifiCredentials};
use crate::status::ApiStatus;
use crate::storage::CredentialStore;
use crate::transport::HttpTransport;
use crate::wifi::WifiControl;

/// One completed portal form. Account credentials live only in this value and
/// die with it; the auth token they buy is all that gets persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormSubmission {
    pub ssid: String,
    pub psk: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningError {
    /// The submitted network configuration is unusable: malformed fields or
    /// an association that failed outright. The caller discards any stored
    /// copy of it instead of auto-retrying.
    InvalidWifiConfig,
    /// A required form field is missing or empty. Rejected locally, no
    /// network round-trip.
    IncompleteForm,
}

impl std::fmt::Display for ProvisioningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidWifiConfig => write!(f, "invalid wifi configuration"),
            Self::IncompleteForm => write!(f, "incomplete portal form"),
        }
    }
}

impl std::error::Error for ProvisioningError {}

/// What the hardware portal does: bring the access point and form endpoint up
/// or down, and hand over completed submissions.
pub trait PortalSurface {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    /// The latest completed form, at most once. Later submissions replace
    /// earlier unconsumed ones.
    fn take_submission(&mut self) -> Option<FormSubmission>;
}

pub struct CredentialsServer<P: PortalSurface> {
    pub(crate) surface: P,
    is_open: bool,
    next_stored_attempt: Option<Instant>,
    next_fallback_attempt: Option<Instant>,
}

impl<P: PortalSurface> CredentialsServer<P> {
    pub fn new(surface: P) -> Self {
        Self {
            surface,
            is_open: false,
            next_stored_attempt: None,
            next_fallback_attempt: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// One provisioning step. Opens the portal if it is down, consumes a
    /// pending form if one exists, otherwise paces through stored and
    /// compile-time fallback WiFi credentials.
    ///
    /// Returns the freshly obtained auth token when a login succeeds; the
    /// portal stays open until the caller decides the device is fully
    /// provisioned and closes it.
    pub fn serve<S, W, T>(
        &mut self,
        now: Instant,
        store: &mut S,
        wifi: &mut W,
        api: &mut Api<T>,
    ) -> Result<Option<AuthToken>, ProvisioningError>
    where
        S: CredentialStore,
        W: WifiControl,
        T: HttpTransport,
    {
        if !self.is_open {
            match self.surface.open() {
                Ok(()) => {
                    info!("Captive portal is up");
                    self.is_open = true;
                }
                Err(err) => {
                    // Try again next tick; the device stays responsive.
                    error!("Failed to open the captive portal: {:#}", err);
                    return Ok(None);
                }
            }
        }

        if let Some(form) = self.surface.take_submission() {
            return self.handle_submission(form, store, wifi, api);
        }

        if !wifi.is_connected() {
            self.try_unattended_connects(now, store, wifi);
        }

        Ok(None)
    }

    /// Closes the portal. Idempotent: safe to call whether or not it is open.
    pub fn close(&mut self) {
        if self.is_open {
            info!("Closing the captive portal");
            self.surface.close();
            self.is_open = false;
        }
    }

    fn handle_submission<S, W, T>(
        &mut self,
        form: FormSubmission,
        store: &mut S,
        wifi: &mut W,
        api: &mut Api<T>,
    ) -> Result<Option<AuthToken>, ProvisioningError>
    where
        S: CredentialStore,
        W: WifiControl,
        T: HttpTransport,
    {
        if form.ssid.is_empty() || form.email.is_empty() || form.password.is_empty() {
            warn!("Portal form is missing required fields");
            return Err(ProvisioningError::IncompleteForm);
        }

        let credentials = WifiCredentials::new(&form.ssid, &form.psk).map_err(|err| {
            warn!("Portal form wifi credentials rejected: {}", err);
            ProvisioningError::InvalidWifiConfig
        })?;

        info!("Connecting to network {} from portal form", form.ssid);
        if let Err(err) = wifi.connect(&credentials) {
            // Stay in the portal, but tell the caller this configuration does
            // not work so any stale stored copy of it gets discarded.
            warn!("Portal-provided network unreachable: {:#}", err);
            return Err(ProvisioningError::InvalidWifiConfig);
        }

        if let Err(err) = store.write_wifi_credentials(&credentials) {
            error!("Failed to persist wifi credentials: {:#}", err);
        }

        match api.authenticate(&form.email, &form.password) {
            Ok(token) => {
                info!("Account login accepted, token obtained");
                if let Err(err) = store.write_auth_token(&token) {
                    error!("Failed to persist auth token: {:#}", err);
                }
                Ok(Some(token))
            }
            Err(ApiStatus::Forbidden) => {
                warn!("Account credentials rejected, keep serving the portal");
                Ok(None)
            }
            Err(status) => {
                warn!("Login did not complete: {}", status);
                Ok(None)
            }
        }
    }

    /// Stored credentials first; the fallback is tried in the same call only
    /// when the stored attempt is skipped or fails. Each source carries its
    /// own cooldown so a dead network does not starve the portal of CPU time.
    fn try_unattended_connects<S, W>(&mut self, now: Instant, store: &mut S, wifi: &mut W)
    where
        S: CredentialStore,
        W: WifiControl,
    {
        if let Some(credentials) = store.read_wifi_credentials() {
            if due(&self.next_stored_attempt, now) {
                self.next_stored_attempt = Some(now + config::STORED_WIFI_COOLDOWN);
                debug!("Retrying stored network {}", credentials.ssid());
                if wifi.connect(&credentials).is_ok() {
                    return;
                }
            }
        }

        if let Some(credentials) = config::fallback_wifi() {
            if due(&self.next_fallback_attempt, now) {
                self.next_fallback_attempt = Some(now + config::FALLBACK_WIFI_COOLDOWN);
                debug!("Trying fallback network {}", credentials.ssid());
                let _ = wifi.connect(&credentials);
            }
        }
    }
}

fn due(next: &Option<Instant>, now: Instant) -> bool {
    next.map_or(true, |at| now >= at)
}

/// Parses an `application/x-www-form-urlencoded` portal submission.
pub fn parse_form(body: &str) -> Result<FormSubmission, ProvisioningError> {
    let mut ssid = None;
    let mut psk = None;
    let mut email = None;
    let mut password = None;

    for pair in body.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode(value);
        match key {
            "ssid" => ssid = Some(value),
            "psk" => psk = Some(value),
            "email" => email = Some(value),
            "password" => password = Some(value),
            _ => {}
        }
    }

    let submission = FormSubmission {
        ssid: ssid.ok_or(ProvisioningError::IncompleteForm)?,
        psk: psk.unwrap_or_default(),
        email: email.ok_or(ProvisioningError::IncompleteForm)?,
        password: password.ok_or(ProvisioningError::IncompleteForm)?,
    };
    if submission.ssid.is_empty() || submission.email.is_empty() || submission.password.is_empty() {
        return Err(ProvisioningError::IncompleteForm);
    }
    Ok(submission)
}

/// Decodes `%XX` escapes and `+` spaces. Invalid escapes pass through
/// verbatim; a user typo should not take the portal down.
pub fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if let (Some(hi), Some(lo)) = (
                    bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                ) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}


#[cfg(test)]
mod tests {
    use super::testing::MockSurface;
    use super::*;
    use crate::models::AUTH_TOKEN_LEN;
    use crate::storage::MemoryStore;
    use crate::transport::testing::MockTransport;
    use crate::wifi::testing::MockWifi;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    fn form() -> FormSubmission {
        FormSubmission {
            ssid: "home".into(),
            psk: "hunter22".into(),
            email: "me@example.com".into(),
            password: "secret".into(),
        }
    }

    fn wifi() -> MockWifi {
        MockWifi::new(Rc::new(Cell::new(false)))
    }

    fn api(transport: MockTransport) -> Api<MockTransport> {
        Api::new(transport, "hash".into())
    }

    #[test]
    fn serve_opens_the_portal_once() {
        let mut server = CredentialsServer::new(MockSurface::new());
        let mut store = MemoryStore::new();
        let mut wifi = wifi();
        let mut api = api(MockTransport::new());
        let now = Instant::now();

        server.serve(now, &mut store, &mut wifi, &mut api).unwrap();
        server.serve(now, &mut store, &mut wifi, &mut api).unwrap();
        assert!(server.is_open());
        assert_eq!(server.surface.opens, 1);
    }

    #[test]
    fn failed_open_is_retried_next_tick() {
        let mut surface = MockSurface::new();
        surface.fail_open = true;
        let mut server = CredentialsServer::new(surface);
        let mut store = MemoryStore::new();
        let mut wifi = wifi();
        let mut api = api(MockTransport::new());

        let got = server.serve(Instant::now(), &mut store, &mut wifi, &mut api);
        assert_eq!(got, Ok(None));
        assert!(!server.is_open());

        server.surface.fail_open = false;
        server
            .serve(Instant::now(), &mut store, &mut wifi, &mut api)
            .unwrap();
        assert!(server.is_open());
    }

    #[test]
    fn close_is_idempotent() {
        let mut server = CredentialsServer::new(MockSurface::new());
        let mut store = MemoryStore::new();
        let mut wifi = wifi();
        let mut api = api(MockTransport::new());
        server
            .serve(Instant::now(), &mut store, &mut wifi, &mut api)
            .unwrap();

        server.close();
        server.close();
        assert_eq!(server.surface.closes, 1);
        assert!(!server.is_open());
    }

    #[test]
    fn good_submission_persists_wifi_and_token_and_keeps_portal_open() {
        let mut surface = MockSurface::new();
        surface.submissions.push_back(form());
        let mut server = CredentialsServer::new(surface);
        let mut store = MemoryStore::new();
        let mut wifi = wifi().accepting(WifiCredentials::new("home", "hunter22").unwrap());
        let mut api = api(MockTransport::new().respond_status(200, Some(&[b'a'; AUTH_TOKEN_LEN])));

        let token = server
            .serve(Instant::now(), &mut store, &mut wifi, &mut api)
            .unwrap()
            .expect("token");
        assert_eq!(token.as_str(), "a".repeat(AUTH_TOKEN_LEN));
        assert_eq!(store.auth_token, Some(token));
        assert_eq!(
            store.wifi,
            Some(WifiCredentials::new("home", "hunter22").unwrap())
        );
        // The orchestration loop closes the portal only after the plant is
        // registered too.
        assert!(server.is_open());
    }

    #[test]
    fn unreachable_submitted_network_is_invalid_config_and_persists_nothing() {
        let mut surface = MockSurface::new();
        surface.submissions.push_back(form());
        let mut server = CredentialsServer::new(surface);
        let mut store = MemoryStore::new();
        let mut wifi = wifi(); // accepts nothing
        let mut api = api(MockTransport::new());

        let got = server.serve(Instant::now(), &mut store, &mut wifi, &mut api);
        assert_eq!(got, Err(ProvisioningError::InvalidWifiConfig));
        assert!(store.wifi.is_none());
        assert!(store.auth_token.is_none());
        assert!(api.transport.sent.is_empty());
        assert!(server.is_open());
    }

    #[test]
    fn rejected_login_keeps_wifi_but_no_token() {
        let mut surface = MockSurface::new();
        surface.submissions.push_back(form());
        let mut server = CredentialsServer::new(surface);
        let mut store = MemoryStore::new();
        let mut wifi = wifi().accepting(WifiCredentials::new("home", "hunter22").unwrap());
        let mut api = api(MockTransport::new().respond_status(403, None));

        let got = server
            .serve(Instant::now(), &mut store, &mut wifi, &mut api)
            .unwrap();
        assert!(got.is_none());
        assert!(store.wifi.is_some());
        assert!(store.auth_token.is_none());
        assert!(server.is_open());
    }

    #[test]
    fn incomplete_submission_is_rejected_locally() {
        let mut incomplete = form();
        incomplete.email.clear();
        let mut surface = MockSurface::new();
        surface.submissions.push_back(incomplete);
        let mut server = CredentialsServer::new(surface);
        let mut store = MemoryStore::new();
        let mut wifi = wifi();
        let mut api = api(MockTransport::new());

        let got = server.serve(Instant::now(), &mut store, &mut wifi, &mut api);
        assert_eq!(got, Err(ProvisioningError::IncompleteForm));
        assert!(wifi.attempts.is_empty());
        assert!(api.transport.sent.is_empty());
    }

    #[test]
    fn oversized_ssid_is_invalid_wifi_config() {
        let mut bad = form();
        bad.ssid = "x".repeat(33);
        let mut surface = MockSurface::new();
        surface.submissions.push_back(bad);
        let mut server = CredentialsServer::new(surface);
        let mut store = MemoryStore::new();
        let mut wifi = wifi();
        let mut api = api(MockTransport::new());

        let got = server.serve(Instant::now(), &mut store, &mut wifi, &mut api);
        assert_eq!(got, Err(ProvisioningError::InvalidWifiConfig));
    }

    #[test]
    fn stored_network_retries_respect_the_cooldown() {
        let mut server = CredentialsServer::new(MockSurface::new());
        let mut store = MemoryStore::new();
        store.wifi = Some(WifiCredentials::new("home", "nope").unwrap());
        let mut wifi = wifi(); // association always fails
        let mut api = api(MockTransport::new());

        let start = Instant::now();
        server.serve(start, &mut store, &mut wifi, &mut api).unwrap();
        assert_eq!(wifi.attempts.len(), 1);

        // Within the cooldown: no new attempt.
        server
            .serve(start + Duration::from_secs(5), &mut store, &mut wifi, &mut api)
            .unwrap();
        assert_eq!(wifi.attempts.len(), 1);

        // Cooldown elapsed: one more attempt.
        server
            .serve(start + config::STORED_WIFI_COOLDOWN, &mut store, &mut wifi, &mut api)
            .unwrap();
        assert_eq!(wifi.attempts.len(), 2);
    }

    #[test]
    fn no_unattended_attempts_while_connected() {
        let mut server = CredentialsServer::new(MockSurface::new());
        let mut store = MemoryStore::new();
        store.wifi = Some(WifiCredentials::new("home", "pw").unwrap());
        let connected = Rc::new(Cell::new(true));
        let mut wifi = MockWifi::new(connected);
        let mut api = api(MockTransport::new());

        server
            .serve(Instant::now(), &mut store, &mut wifi, &mut api)
            .unwrap();
        assert!(wifi.attempts.is_empty());
    }

    #[test]
    fn parse_form_decodes_escapes_and_plus() {
        let got = parse_form("ssid=my+network&psk=p%40ss&email=me%40example.com&password=s3cret")
            .unwrap();
        assert_eq!(got.ssid, "my network");
        assert_eq!(got.psk, "p@ss");
        assert_eq!(got.email, "me@example.com");
        assert_eq!(got.password, "s3cret");
    }

    #[test]
    fn parse_form_allows_open_networks() {
        let got = parse_form("ssid=cafe&psk=&email=a%40b.c&password=x").unwrap();
        assert_eq!(got.psk, "");
    }

    #[test]
    fn parse_form_rejects_missing_fields() {
        assert_eq!(
            parse_form("ssid=cafe&psk=pw"),
            Err(ProvisioningError::IncompleteForm)
        );
        assert_eq!(
            parse_form("ssid=&email=a%40b.c&password=x"),
            Err(ProvisioningError::IncompleteForm)
        );
    }

    #[test]
    fn percent_decode_passes_bad_escapes_through() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("a%zzb"), "a%zzb");
    }
}
