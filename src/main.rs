#[cfg(target_os = "espidf")]
mod firmware {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::thread;
    use std::time::{Duration, Instant};

    use anyhow::{Context, Result};
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::hal::gpio::{Gpio0, Input, PinDriver, Pull};
    use esp_idf_svc::hal::peripherals::Peripherals;
    use esp_idf_svc::netif::IpEvent;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use log::{error, info, warn};

    use iop_monitor::api::Api;
    use iop_monitor::captive_portal::EspCaptivePortal;
    use iop_monitor::config;
    use iop_monitor::device::esp::{power_down, restart, EspDevice};
    use iop_monitor::event_loop::EventLoop;
    use iop_monitor::http_client::EspTransport;
    use iop_monitor::interrupts::{InterruptEvent, INTERRUPTS};
    use iop_monitor::models::PanicData;
    use iop_monitor::nvs_storage::NvsCredentialStore;
    use iop_monitor::onboard_sensors::OnboardSensors;
    use iop_monitor::ota::EspFirmwareSink;
    use iop_monitor::portal::CredentialsServer;
    use iop_monitor::recovery::{
        self, RecoveryController, ResetRequest, PANICKING,
    };
    use iop_monitor::wifi_client::{init as init_wifi, EspWifiStation};

    // Loop pacing; the tick itself decides whether any work is due.
    const TICK_PERIOD: Duration = Duration::from_millis(50);

    const RESET_BUTTON_HOLD: Duration = Duration::from_secs(3);
    const RESET_BUTTON_POLL: Duration = Duration::from_millis(50);

    pub fn run() -> Result<()> {
        esp_idf_svc::sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();
        recovery::install_panic_hook();

        info!("Internet-of-Plants monitor {}", env!("CARGO_PKG_VERSION"));

        let peripherals = Peripherals::take().context("taking peripherals")?;
        let sys_loop = EspSystemEventLoop::take().context("taking system event loop")?;
        let nvs = EspDefaultNvsPartition::take().context("taking NVS partition")?;

        let wifi = init_wifi(peripherals.modem, sys_loop.clone(), nvs.clone())?;

        // Flag IP acquisition from any path (portal form, stored credential,
        // driver auto-reconnect) so the loop can persist what actually worked.
        let _ip_subscription = sys_loop
            .subscribe::<IpEvent, _>(|event| {
                if matches!(event, IpEvent::DhcpIpAssigned(_)) {
                    INTERRUPTS.raise(InterruptEvent::ConnectionEstablished);
                }
            })
            .context("subscribing to IP events")?;

        spawn_reset_button(PinDriver::input(peripherals.pins.gpio0).context("claiming GPIO0")?)?;

        let firmware_hash = config::firmware_hash();
        let store = NvsCredentialStore::new(nvs)?;
        let station = EspWifiStation::new(wifi.clone());
        let server = CredentialsServer::new(EspCaptivePortal::new(wifi.clone()));
        let api = Api::new(EspTransport::new(wifi), firmware_hash.clone());
        let sensors = OnboardSensors::new(
            peripherals.i2c0,
            peripherals.pins.gpio21,
            peripherals.pins.gpio22,
            peripherals.adc1,
            peripherals.pins.gpio34,
            peripherals.pins.gpio35,
            peripherals.pins.gpio25,
        )?;

        let mut event_loop = EventLoop::new(
            store,
            station,
            server,
            api,
            sensors,
            &INTERRUPTS,
            firmware_hash,
        );

        loop {
            let tick = catch_unwind(AssertUnwindSafe(|| event_loop.tick(Instant::now())));
            if tick.is_err() {
                recover(&mut event_loop);
            }
            thread::sleep(TICK_PERIOD);
        }
    }

    /// Never returns to the loop: recovery ends in a restart or a power-down.
    fn recover<S, W, P, T, N>(event_loop: &mut EventLoop<S, W, P, T, N>) -> !
    where
        S: iop_monitor::storage::CredentialStore,
        W: iop_monitor::wifi::WifiControl,
        P: iop_monitor::portal::PortalSurface,
        T: iop_monitor::transport::HttpTransport,
        N: iop_monitor::sensors::PlantSensor,
    {
        if !PANICKING.try_enter() {
            // The recovery path itself crashed; nothing left but a clean slate.
            error!("Re-entrant panic, restarting");
            restart();
        }

        let data = recovery::take_last_panic().unwrap_or_else(|| PanicData {
            msg: "panic with no recorded location".into(),
            file: String::new(),
            line: 0,
            func: "tick".into(),
        });
        error!("Tick crashed at {}:{}: {}", data.file, data.line, data.msg);
        // Let the UART drain the crash log before the network work starts.
        thread::sleep(Duration::from_millis(100));

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let (store, wifi, api) = event_loop.recovery_handles();
            let mut sink = EspFirmwareSink::new();
            let mut device = EspDevice;
            RecoveryController::new().run(store, wifi, api, &mut sink, &mut device, &data)
        }));

        match outcome {
            Ok(ResetRequest::Restart) => restart(),
            Ok(ResetRequest::Halt) => {
                warn!("Recovery exhausted, powering down until human intervention");
                power_down()
            }
            Err(_) => {
                error!("Recovery crashed, restarting");
                restart()
            }
        }
    }

    /// Dedicated thread watching the factory reset button. A held-down boot
    /// button for three seconds wipes all credentials via the loop interrupt.
    fn spawn_reset_button(mut button: PinDriver<'static, Gpio0, Input>) -> Result<()> {
        button
            .set_pull(Pull::Up)
            .context("configuring reset button pull-up")?;

        thread::Builder::new()
            .name("reset-button".into())
            .stack_size(2048)
            .spawn(move || {
                let mut held_since: Option<Instant> = None;
                loop {
                    if button.is_low() {
                        let since = held_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= RESET_BUTTON_HOLD {
                            INTERRUPTS.raise(InterruptEvent::FactoryReset);
                            held_since = None;
                        }
                    } else {
                        held_since = None;
                    }
                    thread::sleep(RESET_BUTTON_POLL);
                }
            })
            .context("spawning reset button thread")?;
        Ok(())
    }
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    firmware::run()
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!("iop-monitor targets ESP-IDF; host builds only run the test suite");
}
