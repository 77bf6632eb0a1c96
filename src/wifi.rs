// WiFi station control seam
// Association attempts block until they resolve (bounded by the driver's own
// timeout); pacing between attempts is the provisioning machine's cooldown
// policy, not the driver's.

use anyhow::Result;

use crate::models::WifiCredentials;

pub trait WifiControl {
    fn is_connected(&mut self) -> bool;

    /// One blocking association attempt. `Err` means this credential did not
    /// get us online; the caller decides whether that invalidates it.
    fn connect(&mut self, credentials: &WifiCredentials) -> Result<()>;

    fn disconnect(&mut self);

    /// Whether the radio is administratively enabled at all. Recovery gives
    /// up when it is not: that state is not reachable without human action.
    fn radio_enabled(&mut self) -> bool;

    /// Best-effort: power the radio back up and retry the last association.
    /// Used by the recovery loop after its offline backoff.
    fn reenable_and_reconnect(&mut self);

    /// The credential the station is currently associated with, if any. Used
    /// to persist externally established connections (e.g. after the
    /// connectivity interrupt).
    fn active_credentials(&mut self) -> Option<WifiCredentials>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Mock station. `connected` is shared via `Rc` so a test can hand the
    /// same link state to the transport mock.
    pub struct MockWifi {
        pub connected: Rc<Cell<bool>>,
        pub radio_on: bool,
        pub accept: Vec<WifiCredentials>,
        pub attempts: Vec<WifiCredentials>,
        pub reenables: usize,
        pub active: Option<WifiCredentials>,
    }

    impl MockWifi {
        pub fn new(connected: Rc<Cell<bool>>) -> Self {
            Self {
                connected,
                radio_on: true,
                accept: Vec::new(),
                attempts: Vec::new(),
                reenables: 0,
                active: None,
            }
        }

        pub fn accepting(mut self, credentials: WifiCredentials) -> Self {
            self.accept.push(credentials);
            self
        }
    }

    impl WifiControl for MockWifi {
        fn is_connected(&mut self) -> bool {
            self.connected.get()
        }

        fn connect(&mut self, credentials: &WifiCredentials) -> Result<()> {
            self.attempts.push(credentials.clone());
            if self.accept.contains(credentials) {
                self.connected.set(true);
                self.active = Some(credentials.clone());
                Ok(())
            } else {
                anyhow::bail!("association failed")
            }
        }

        fn disconnect(&mut self) {
            self.connected.set(false);
            self.active = None;
        }

        fn radio_enabled(&mut self) -> bool {
            self.radio_on
        }

        fn reenable_and_reconnect(&mut self) {
            self.radio_on = true;
            self.reenables += 1;
        }

        fn active_credentials(&mut self) -> Option<WifiCredentials> {
            self.active.clone()
        }
    }
}
