// ESP-IDF captive portal
// Brings up a soft AP next to the station interface, serves the credential
// form over plain HTTP and answers every DNS query with our own address so
// phones open the form on their own.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use embedded_svc::http::Method;
use embedded_svc::io::{Read, Write};
use esp_idf_svc::http::server::{Configuration as ServerConfiguration, EspHttpServer};
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration,
};
use log::{info, warn};

use crate::config;
use crate::dns::DnsResponder;
use crate::portal::{parse_form, FormSubmission, PortalSurface};
use crate::wifi_client::SharedWifi;

const MAX_FORM_LEN: usize = 1024;

const PORTAL_HTML: &str = r#"<!DOCTYPE html>
<html><head><title>Internet of Plants</title>
<meta name="viewport" content="width=device-width, initial-scale=1"></head>
<body>
<h2>Connect your plant monitor</h2>
<form action="/submit" method="post">
<label>WiFi network<br><input name="ssid" maxlength="32"></label><br>
<label>WiFi password<br><input name="psk" type="password" maxlength="63"></label><br>
<label>Account email<br><input name="email" type="email"></label><br>
<label>Account password<br><input name="password" type="password"></label><br>
<button type="submit">Connect</button>
</form>
</body></html>"#;

const SUBMITTED_HTML: &str = r#"<!DOCTYPE html>
<html><body><h2>Connecting...</h2>
<p>The monitor is joining your network. If the light keeps blinking, reconnect
to its access point and try again.</p></body></html>"#;

pub struct EspCaptivePortal {
    wifi: SharedWifi,
    server: Option<EspHttpServer<'static>>,
    dns: Option<DnsResponder>,
    submission: Arc<Mutex<Option<FormSubmission>>>,
}

impl EspCaptivePortal {
    pub fn new(wifi: SharedWifi) -> Self {
        Self {
            wifi,
            server: None,
            dns: None,
            submission: Arc::new(Mutex::new(None)),
        }
    }

    fn bring_up_access_point(&mut self) -> Result<[u8; 4]> {
        let mut wifi = self.wifi.borrow_mut();

        let ap = AccessPointConfiguration {
            ssid: config::PORTAL_AP_SSID
                .try_into()
                .map_err(|_| anyhow::anyhow!("portal ssid exceeds the driver limit"))?,
            password: config::PORTAL_AP_PSK
                .try_into()
                .map_err(|_| anyhow::anyhow!("portal psk exceeds the driver limit"))?,
            auth_method: if config::PORTAL_AP_PSK.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        };

        // Keep whatever station configuration exists so association attempts
        // can proceed while the portal is open.
        let client = match wifi.get_configuration() {
            Ok(Configuration::Client(client)) | Ok(Configuration::Mixed(client, _)) => client,
            _ => ClientConfiguration::default(),
        };
        wifi.set_configuration(&Configuration::Mixed(client, ap))
            .context("applying AP+STA configuration")?;

        if !wifi.is_started().unwrap_or(false) {
            wifi.start().context("starting WiFi driver")?;
        }

        let ip = wifi
            .wifi()
            .ap_netif()
            .get_ip_info()
            .context("reading AP address")?
            .ip;
        Ok(ip.octets())
    }

    fn start_http(&mut self, ip: [u8; 4]) -> Result<()> {
        let server_config = ServerConfiguration {
            http_port: 80,
            uri_match_wildcard: true,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&server_config).context("starting portal HTTP")?;

        server.fn_handler::<anyhow::Error, _>("/", Method::Get, |request| {
            let mut response = request.into_ok_response()?;
            response.write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;

        let slot = Arc::clone(&self.submission);
        server.fn_handler::<anyhow::Error, _>("/submit", Method::Post, move |mut request| {
            let mut body = Vec::new();
            let mut chunk = [0u8; 256];
            loop {
                let n = request.read(&mut chunk).unwrap_or(0);
                if n == 0 {
                    break;
                }
                if body.len() + n > MAX_FORM_LEN {
                    let mut response = request.into_status_response(413)?;
                    response.write_all(b"form too large")?;
                    return Ok(());
                }
                body.extend_from_slice(&chunk[..n]);
            }

            match parse_form(&String::from_utf8_lossy(&body)) {
                Ok(form) => {
                    info!("Portal form submitted for network {}", form.ssid);
                    if let Ok(mut slot) = slot.lock() {
                        *slot = Some(form);
                    }
                    let mut response = request.into_ok_response()?;
                    response.write_all(SUBMITTED_HTML.as_bytes())?;
                }
                Err(err) => {
                    warn!("Rejecting portal form: {}", err);
                    let mut response = request.into_status_response(400)?;
                    response.write_all(PORTAL_HTML.as_bytes())?;
                }
            }
            Ok(())
        })?;

        // Captive probes (generate_204, hotspot-detect and friends) all land
        // here and get bounced to the form.
        let location = format!("http://{}.{}.{}.{}/", ip[0], ip[1], ip[2], ip[3]);
        server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |request| {
            request.into_response(302, Some("Found"), &[("Location", &location)])?;
            Ok(())
        })?;

        self.server = Some(server);
        Ok(())
    }
}

impl PortalSurface for EspCaptivePortal {
    fn open(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }
        let ip = self.bring_up_access_point()?;
        self.start_http(ip)?;
        self.dns = Some(DnsResponder::start(ip)?);
        info!(
            "Captive portal on {}.{}.{}.{} as {}",
            ip[0], ip[1], ip[2], ip[3], config::PORTAL_AP_SSID
        );
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut dns) = self.dns.take() {
            dns.stop();
        }
        // Dropping the server unregisters the handlers and frees the port.
        self.server = None;

        let mut wifi = self.wifi.borrow_mut();
        if let Ok(Configuration::Mixed(client, _)) = wifi.get_configuration() {
            if let Err(err) = wifi.set_configuration(&Configuration::Client(client)) {
                warn!("Failed to drop the AP interface: {}", err);
            }
        }
    }

    fn take_submission(&mut self) -> Option<FormSubmission> {
        self.submission.lock().ok().and_then(|mut slot| slot.take())
    }
}
