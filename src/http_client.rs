// ESP-IDF HTTP transport
// One fresh TLS connection per request; the heap headroom on this chip does
// not support a pooled client alongside the WiFi stack. Certificate trust
// comes from the built-in bundle.

use embedded_svc::http::client::Client;
use embedded_svc::http::{Headers, Method, Status};
use embedded_svc::io::{Read, Write};
use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
use log::{debug, warn};
use std::cell::RefCell;
use std::rc::Rc;

use crate::config;
use crate::models::AuthToken;
use crate::transport::{FirmwareSink, HttpMethod, HttpTransport, Response, TransportError};

// Reply bodies are identifiers and short acknowledgements; anything larger
// is a server fault.
const RECEPTION_CAP: usize = 512;
const READ_CHUNK: usize = 256;

pub struct EspTransport {
    wifi: Rc<RefCell<BlockingWifi<EspWifi<'static>>>>,
}

impl EspTransport {
    pub fn new(wifi: Rc<RefCell<BlockingWifi<EspWifi<'static>>>>) -> Self {
        Self { wifi }
    }

    fn connection(&self) -> Result<EspHttpConnection, TransportError> {
        let http_config = Configuration {
            use_global_ca_store: true,
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        EspHttpConnection::new(&http_config).map_err(|err| {
            warn!("Failed to create an HTTP connection: {}", err);
            TransportError::ConnectionFailed
        })
    }

    fn url(path: &str) -> String {
        format!("{}{}", config::API_HOST, path)
    }
}

fn bearer(token: &AuthToken) -> String {
    format!("Bearer {}", token.as_str())
}

impl HttpTransport for EspTransport {
    fn is_connected(&mut self) -> bool {
        self.wifi.borrow().is_connected().unwrap_or(false)
    }

    fn mac_address(&mut self) -> String {
        let wifi = self.wifi.borrow();
        match wifi.wifi().sta_netif().get_mac() {
            Ok(mac) => format!(
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            ),
            Err(err) => {
                warn!("Failed to read the station MAC: {}", err);
                String::new()
            }
        }
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.borrow_mut().disconnect() {
            warn!("Disconnect failed: {}", err);
        }
    }

    fn request(
        &mut self,
        method: HttpMethod,
        path: &str,
        token: Option<&AuthToken>,
        body: Option<&str>,
    ) -> Result<Response, TransportError> {
        let url = Self::url(path);
        debug!("{:?} {}", method, url);

        let auth = token.map(bearer);
        let length = body.map(|b| b.len().to_string());
        let mut headers: Vec<(&str, &str)> = vec![("Content-Type", "application/json")];
        if let Some(auth) = auth.as_deref() {
            headers.push(("Authorization", auth));
        }
        if let Some(length) = length.as_deref() {
            headers.push(("Content-Length", length));
        }

        let mut client = Client::wrap(self.connection()?);
        let method = match method {
            HttpMethod::Get => Method::Get,
            HttpMethod::Post => Method::Post,
            HttpMethod::Put => Method::Put,
        };

        let mut request = client
            .request(method, &url, &headers)
            .map_err(|err| {
                warn!("Failed to open {}: {}", url, err);
                TransportError::ConnectionFailed
            })?;
        if let Some(body) = body {
            request.write_all(body.as_bytes()).map_err(|err| {
                warn!("Failed to send the request body: {:?}", err);
                TransportError::ConnectionFailed
            })?;
        }

        let mut response = request.submit().map_err(|err| {
            warn!("No response from {}: {:?}", url, err);
            TransportError::ConnectionFailed
        })?;
        let status = response.status();

        let mut payload = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match response.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if payload.len() + n > RECEPTION_CAP {
                        warn!("Response body exceeds {} bytes, dropping it", RECEPTION_CAP);
                        return Err(TransportError::ResponseTooLarge);
                    }
                    payload.extend_from_slice(&chunk[..n]);
                }
                Err(err) => {
                    warn!("Response body read aborted: {:?}", err);
                    return Err(TransportError::Interrupted);
                }
            }
        }

        Ok(Response {
            status,
            payload: if payload.is_empty() { None } else { Some(payload) },
        })
    }

    fn download(
        &mut self,
        path: &str,
        token: &AuthToken,
        current_version: &str,
        sink: &mut dyn FirmwareSink,
    ) -> Result<u16, TransportError> {
        let url = Self::url(path);
        debug!("GET {} (streaming)", url);

        let auth = bearer(token);
        let headers: Vec<(&str, &str)> = vec![
            ("Authorization", &auth),
            ("x-version", current_version),
        ];

        let mut client = Client::wrap(self.connection()?);
        let request = client.request(Method::Get, &url, &headers).map_err(|err| {
            warn!("Failed to open {}: {}", url, err);
            TransportError::ConnectionFailed
        })?;
        let mut response = request.submit().map_err(|err| {
            warn!("No response from {}: {:?}", url, err);
            TransportError::ConnectionFailed
        })?;
        let status = response.status();
        if status != 200 {
            return Ok(status);
        }

        let expected_len = response
            .header("Content-Length")
            .and_then(|v| v.parse::<usize>().ok());

        sink.apply(expected_len, &mut |buf| {
            response
                .read(buf)
                .map_err(|err| anyhow::anyhow!("firmware chunk read failed: {:?}", err))
        })
        .map_err(|err| {
            warn!("Firmware stream aborted: {:#}", err);
            TransportError::Interrupted
        })?;

        Ok(status)
    }
}
