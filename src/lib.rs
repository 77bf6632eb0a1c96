// Internet-of-Plants monitor firmware library
//
// The crate is split so that every policy decision (status taxonomy, bounded
// encoding, provisioning state machine, orchestration loop, panic recovery)
// is portable and unit-tested on the host, while the ESP-IDF collaborators
// implementing the trait seams are compiled only for the device target.

pub mod api;
pub mod bounded;
pub mod config;
pub mod device;
pub mod dns;
pub mod event_loop;
pub mod interrupts;
pub mod models;
pub mod portal;
pub mod recovery;
pub mod sensors;
pub mod status;
pub mod storage;
pub mod transport;
pub mod wifi;

#[cfg(target_os = "espidf")]
pub mod captive_portal;
#[cfg(target_os = "espidf")]
pub mod http_client;
#[cfg(target_os = "espidf")]
pub mod nvs_storage;
#[cfg(target_os = "espidf")]
pub mod onboard_sensors;
#[cfg(target_os = "espidf")]
pub mod ota;
#[cfg(target_os = "espidf")]
pub mod wifi_client;
