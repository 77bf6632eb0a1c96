// Device power control seam
// The recovery loop sleeps through its backoffs via this trait so tests can
// observe the requested durations instead of waiting them out.

use std::time::Duration;

pub trait DeviceControl {
    /// Blocks for `duration` in the lowest power state that keeps RAM alive.
    fn deep_sleep(&mut self, duration: Duration);
}

#[cfg(target_os = "espidf")]
pub mod esp {
    use super::*;
    use esp_idf_svc::sys;

    /// Timer-woken light sleep: RAM, the radio config and the recovery state
    /// all survive it.
    pub struct EspDevice;

    impl DeviceControl for EspDevice {
        fn deep_sleep(&mut self, duration: Duration) {
            unsafe {
                sys::esp_sleep_enable_timer_wakeup(duration.as_micros() as u64);
                sys::esp_light_sleep_start();
            }
        }
    }

    pub fn restart() -> ! {
        unsafe { sys::esp_restart() };
        unreachable!("esp_restart does not return")
    }

    /// Deep sleep with no wakeup source: effectively off until a power cycle.
    pub fn power_down() -> ! {
        unsafe { sys::esp_deep_sleep_start() };
        unreachable!("deep sleep without wakeup does not return")
    }
}
