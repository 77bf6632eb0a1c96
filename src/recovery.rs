// Panic recovery
// A crashed tick is assumed to be a firmware bug: the device reports the
// panic once, then keeps polling for an upgraded image under a bounded
// backoff until one arrives or a human intervenes. The handler never runs the
// crashed logic again within the same halt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{error, info, warn};

use crate::api::{Api, UpgradeOutcome};
use crate::config;
use crate::device::DeviceControl;
use crate::models::PanicData;
use crate::status::ApiStatus;
use crate::storage::CredentialStore;
use crate::transport::{FirmwareSink, HttpTransport};
use crate::wifi::WifiControl;

/// Re-entrancy guard. A panic raised while the recovery handler itself is
/// running must not recurse into it; the caller escalates to a plain restart.
pub struct PanicFlag(AtomicBool);

impl PanicFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// True exactly once per halt; later calls see the flag already set.
    pub fn try_enter(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub static PANICKING: PanicFlag = PanicFlag::new();

static LAST_PANIC: Mutex<Option<PanicData>> = Mutex::new(None);

/// Stores the details of the panic currently unwinding. Called from the
/// panic hook; the recovery path picks them up with `take_last_panic`.
pub fn record(data: PanicData) {
    let mut slot = LAST_PANIC.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(data);
}

pub fn take_last_panic() -> Option<PanicData> {
    let mut slot = LAST_PANIC.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    slot.take()
}

/// Captures panic locations into the recovery slot as they unwind.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let msg = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        let (file, line) = info
            .location()
            .map(|loc| (loc.file().to_string(), loc.line()))
            .unwrap_or_default();
        let func = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        error!("Panic at {}:{}: {}", file, line, msg);
        record(PanicData {
            msg,
            file,
            line,
            func,
        });
    }));
}

/// What the caller must do after one recovery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// No way forward without human action (radio disabled, no credentials).
    HaltForever,
    /// Online but no fix available yet; sleep the short backoff and retry.
    SleepShort,
    /// Offline; sleep the long backoff, then re-enable the radio and retry.
    SleepLong,
    /// A new image is committed; reboot into it.
    Restart,
}

/// Terminal outcome of a recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetRequest {
    Halt,
    Restart,
}

#[derive(Default)]
pub struct RecoveryController {
    reported: bool,
}

impl RecoveryController {
    pub fn new() -> Self {
        Self { reported: false }
    }

    /// One recovery attempt: report the crash if not yet delivered, then poll
    /// for an upgraded image. Backoff pacing is the caller's job.
    pub fn step<S, W, T>(
        &mut self,
        store: &mut S,
        wifi: &mut W,
        api: &mut Api<T>,
        sink: &mut dyn FirmwareSink,
        data: &PanicData,
    ) -> RecoveryAction
    where
        S: CredentialStore,
        W: WifiControl,
        T: HttpTransport,
    {
        if !wifi.radio_enabled() {
            error!("Radio administratively disabled, recovery cannot proceed");
            return RecoveryAction::HaltForever;
        }
        // Provisioning needs the very loop that just died, so a device with
        // no persisted credentials has nothing safe left to run.
        if store.read_wifi_credentials().is_none() {
            error!("No wifi credentials while halted, recovery cannot proceed");
            return RecoveryAction::HaltForever;
        }
        let Some(token) = store.read_auth_token() else {
            error!("No auth token while halted, recovery cannot proceed");
            return RecoveryAction::HaltForever;
        };
        if !wifi.is_connected() {
            warn!("Offline while halted, backing off long");
            return RecoveryAction::SleepLong;
        }

        if !self.reported {
            // One attempt per halt, whatever the outcome: the payload will
            // not improve and the server should not be spammed from a
            // crash-looping device.
            self.reported = true;
            let plant = store.read_plant_id();
            match api.report_panic(&token, plant.as_ref(), data) {
                ApiStatus::Ok => info!("Panic reported"),
                status => warn!("Panic report failed ({}), not retried this halt", status),
            }
        }

        match api.upgrade(&token, sink) {
            Ok(UpgradeOutcome::Applied) => RecoveryAction::Restart,
            Ok(UpgradeOutcome::AlreadyCurrent) => {
                info!("No fixed image published yet");
                RecoveryAction::SleepShort
            }
            Err(status) => {
                // A refused upgrade keeps the token: erasing it here would
                // strand a device that can no longer re-provision.
                warn!("Upgrade poll failed: {}", status);
                RecoveryAction::SleepShort
            }
        }
    }

    /// Runs recovery to a terminal outcome, sleeping through the backoffs.
    pub fn run<S, W, T, D>(
        &mut self,
        store: &mut S,
        wifi: &mut W,
        api: &mut Api<T>,
        sink: &mut dyn FirmwareSink,
        device: &mut D,
        data: &PanicData,
    ) -> ResetRequest
    where
        S: CredentialStore,
        W: WifiControl,
        T: HttpTransport,
        D: DeviceControl,
    {
        loop {
            match self.step(store, wifi, api, sink, data) {
                RecoveryAction::HaltForever => return ResetRequest::Halt,
                RecoveryAction::Restart => return ResetRequest::Restart,
                RecoveryAction::SleepShort => {
                    device.deep_sleep(config::RECOVERY_BACKOFF_ONLINE);
                }
                RecoveryAction::SleepLong => {
                    device.deep_sleep(config::RECOVERY_BACKOFF_OFFLINE);
                    wifi.reenable_and_reconnect();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::MockDevice;
    use crate::models::{AuthToken, PlantId, WifiCredentials, AUTH_TOKEN_LEN, PLANT_ID_LEN};
    use crate::storage::MemoryStore;
    use crate::transport::testing::{MockSink, MockTransport};
    use crate::transport::TransportError;
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::wifi::testing::MockWifi;

    fn data() -> PanicData {
        PanicData {
            msg: "index out of bounds".into(),
            file: "src/sensors.rs".into(),
            line: 31,
            func: "measure".into(),
        }
    }

    fn store_with_token() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.auth_token = Some(AuthToken::from_payload(&[b't'; AUTH_TOKEN_LEN]).unwrap());
        store.plant_id = Some(PlantId::from_payload(&[b'p'; PLANT_ID_LEN]).unwrap());
        store.wifi = Some(WifiCredentials::new("home", "pw").unwrap());
        store
    }

    fn online_wifi() -> MockWifi {
        MockWifi::new(Rc::new(Cell::new(true)))
    }

    fn api(transport: MockTransport) -> Api<MockTransport> {
        Api::new(transport, "hash".into())
    }

    #[test]
    fn panic_flag_admits_exactly_one_entry() {
        let flag = PanicFlag::new();
        assert!(flag.try_enter());
        assert!(!flag.try_enter());
        flag.clear();
        assert!(flag.try_enter());
    }

    #[test]
    fn disabled_radio_halts_forever() {
        let mut wifi = online_wifi();
        wifi.radio_on = false;
        let mut api = api(MockTransport::new());
        let action = RecoveryController::new().step(
            &mut store_with_token(),
            &mut wifi,
            &mut api,
            &mut MockSink::new(),
            &data(),
        );
        assert_eq!(action, RecoveryAction::HaltForever);
    }

    #[test]
    fn offline_backs_off_long_without_touching_the_network() {
        let mut wifi = MockWifi::new(Rc::new(Cell::new(false)));
        let mut api = api(MockTransport::new());
        let action = RecoveryController::new().step(
            &mut store_with_token(),
            &mut wifi,
            &mut api,
            &mut MockSink::new(),
            &data(),
        );
        assert_eq!(action, RecoveryAction::SleepLong);
        assert!(api.transport.sent.is_empty());
    }

    #[test]
    fn missing_token_halts_forever() {
        let mut store = MemoryStore::new();
        store.wifi = Some(WifiCredentials::new("home", "pw").unwrap());
        let mut api = api(MockTransport::new());
        let action = RecoveryController::new().step(
            &mut store,
            &mut online_wifi(),
            &mut api,
            &mut MockSink::new(),
            &data(),
        );
        assert_eq!(action, RecoveryAction::HaltForever);
    }

    #[test]
    fn missing_wifi_credentials_halt_forever() {
        let mut store = MemoryStore::new();
        store.auth_token = Some(AuthToken::from_payload(&[b't'; AUTH_TOKEN_LEN]).unwrap());
        let mut api = api(MockTransport::new());
        let action = RecoveryController::new().step(
            &mut store,
            &mut online_wifi(),
            &mut api,
            &mut MockSink::new(),
            &data(),
        );
        assert_eq!(action, RecoveryAction::HaltForever);
        assert!(api.transport.sent.is_empty());
    }

    #[test]
    fn panic_is_reported_once_per_halt() {
        let mut transport = MockTransport::new()
            .respond_status(200, None) // panic report
            .respond_status(200, None); // unused second report would pop this
        transport.download_script.push_back(Ok(304));
        transport.download_script.push_back(Ok(304));
        let mut api = api(transport);
        let mut store = store_with_token();
        let mut wifi = online_wifi();
        let mut sink = MockSink::new();
        let mut controller = RecoveryController::new();

        let first = controller.step(&mut store, &mut wifi, &mut api, &mut sink, &data());
        assert_eq!(first, RecoveryAction::SleepShort);
        let second = controller.step(&mut store, &mut wifi, &mut api, &mut sink, &data());
        assert_eq!(second, RecoveryAction::SleepShort);

        let panics: Vec<_> = api
            .transport
            .sent
            .iter()
            .filter(|r| r.path == "/panic")
            .collect();
        assert_eq!(panics.len(), 1);
        assert!(panics[0].body.as_deref().unwrap().contains("index out of bounds"));
    }

    #[test]
    fn failed_report_is_not_retried_within_the_same_halt() {
        let mut transport = MockTransport::new().respond(Err(TransportError::ConnectionFailed));
        transport.download_script.push_back(Ok(304));
        transport.download_script.push_back(Ok(304));
        let mut api = api(transport);
        let mut store = store_with_token();
        let mut wifi = online_wifi();
        let mut sink = MockSink::new();
        let mut controller = RecoveryController::new();

        controller.step(&mut store, &mut wifi, &mut api, &mut sink, &data());
        controller.step(&mut store, &mut wifi, &mut api, &mut sink, &data());
        assert_eq!(
            api.transport.sent.iter().filter(|r| r.path == "/panic").count(),
            1
        );
    }

    #[test]
    fn applied_upgrade_requests_a_restart() {
        let mut transport = MockTransport::new().respond_status(200, None);
        transport.download_script.push_back(Ok(200));
        transport.download_body = vec![1, 2, 3];
        let mut api = api(transport);
        let mut sink = MockSink::new();

        let action = RecoveryController::new().step(
            &mut store_with_token(),
            &mut online_wifi(),
            &mut api,
            &mut sink,
            &data(),
        );
        assert_eq!(action, RecoveryAction::Restart);
        assert!(sink.committed);
    }

    #[test]
    fn refused_upgrade_keeps_the_token() {
        let mut transport = MockTransport::new().respond_status(200, None);
        transport.download_script.push_back(Ok(403));
        let mut api = api(transport);
        let mut store = store_with_token();

        let action = RecoveryController::new().step(
            &mut store,
            &mut online_wifi(),
            &mut api,
            &mut MockSink::new(),
            &data(),
        );
        assert_eq!(action, RecoveryAction::SleepShort);
        assert!(store.auth_token.is_some());
    }

    #[test]
    fn dropped_upgrade_poll_keeps_the_short_backoff() {
        // Only the pre-network connectivity check picks the long backoff; a
        // connection error on the poll itself waits the usual ten minutes.
        let mut transport = MockTransport::new().respond_status(200, None);
        transport
            .download_script
            .push_back(Err(TransportError::ConnectionFailed));
        let mut api = api(transport);

        let action = RecoveryController::new().step(
            &mut store_with_token(),
            &mut online_wifi(),
            &mut api,
            &mut MockSink::new(),
            &data(),
        );
        assert_eq!(action, RecoveryAction::SleepShort);
    }

    #[test]
    fn run_sleeps_through_backoffs_until_an_image_lands() {
        let mut transport = MockTransport::new().respond_status(200, None);
        transport.download_script.push_back(Ok(304));
        transport.download_script.push_back(Ok(200));
        transport.download_body = vec![9];
        let mut api = api(transport);
        let mut store = store_with_token();
        let mut wifi = online_wifi();
        let mut sink = MockSink::new();
        let mut device = MockDevice::new();

        let outcome = RecoveryController::new().run(
            &mut store,
            &mut wifi,
            &mut api,
            &mut sink,
            &mut device,
            &data(),
        );
        assert_eq!(outcome, ResetRequest::Restart);
        assert_eq!(device.sleeps, vec![config::RECOVERY_BACKOFF_ONLINE]);
    }

    #[test]
    fn run_reenables_the_radio_after_the_offline_backoff() {
        let connected = Rc::new(Cell::new(false));
        let mut wifi = MockWifi::new(Rc::clone(&connected));
        wifi.radio_on = true;
        let mut transport = MockTransport::new().respond_status(200, None);
        transport.download_script.push_back(Ok(200));
        transport.download_body = vec![9];
        let mut api = api(transport);
        let mut store = store_with_token();
        let mut sink = MockSink::new();
        let mut device = MockDevice::new();

        // Drive run()'s shape manually: the mock reconnect does not flip the
        // link itself, so the test does it between iterations.
        let mut controller = RecoveryController::new();
        let first = controller.step(&mut store, &mut wifi, &mut api, &mut sink, &data());
        assert_eq!(first, RecoveryAction::SleepLong);
        device.deep_sleep(config::RECOVERY_BACKOFF_OFFLINE);
        wifi.reenable_and_reconnect();
        connected.set(true);

        let second = controller.step(&mut store, &mut wifi, &mut api, &mut sink, &data());
        assert_eq!(second, RecoveryAction::Restart);
        assert_eq!(wifi.reenables, 1);
    }
}
