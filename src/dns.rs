// Captive DNS
// While the portal is up every A query gets answered with the access point's
// own address, so any hostname the phone tries lands on the credential form.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};

const DNS_PORT: u16 = 53;
const MAX_QUERY_LEN: usize = 512;
const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const ANSWER_TTL: u32 = 60;

/// Builds a response for one DNS query datagram, or `None` when the datagram
/// is not a well-formed query we can answer.
///
/// A and ANY queries get a single A record pointing at `ip`; other types get
/// an empty NOERROR answer so resolvers move on instead of retrying.
pub fn build_response(query: &[u8], ip: [u8; 4]) -> Option<Vec<u8>> {
    if query.len() < 12 {
        return None;
    }
    // QR must be 0 (a query) and QDCOUNT at least 1.
    if query[2] & 0x80 != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([query[4], query[5]]);
    if qdcount == 0 {
        return None;
    }

    // Walk the first question's name to find QTYPE/QCLASS.
    let mut pos = 12;
    loop {
        let len = *query.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        // Compressed names do not appear in question sections.
        if len & 0xC0 != 0 {
            return None;
        }
        pos += 1 + len;
    }
    let qtype = u16::from_be_bytes([*query.get(pos)?, *query.get(pos + 1)?]);
    let question_end = pos + 4;
    if question_end > query.len() {
        return None;
    }

    let answerable = qtype == TYPE_A || qtype == TYPE_ANY;

    let mut response = Vec::with_capacity(question_end + 16);
    response.extend_from_slice(&query[0..2]); // transaction id
    response.extend_from_slice(&[0x81, 0x80]); // standard response, no error
    response.extend_from_slice(&[0x00, 0x01]); // one question
    response.extend_from_slice(&[0x00, u8::from(answerable)]); // answers
    response.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // no authority/extra
    response.extend_from_slice(&query[12..question_end]);

    if answerable {
        response.extend_from_slice(&[0xC0, 0x0C]); // pointer to the question name
        response.extend_from_slice(&TYPE_A.to_be_bytes());
        response.extend_from_slice(&[0x00, 0x01]); // class IN
        response.extend_from_slice(&ANSWER_TTL.to_be_bytes());
        response.extend_from_slice(&[0x00, 0x04]);
        response.extend_from_slice(&ip);
    }

    Some(response)
}

/// UDP responder thread answering captive queries until stopped.
pub struct DnsResponder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DnsResponder {
    pub fn start(ip: [u8; 4]) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", DNS_PORT)).context("binding DNS socket")?;
        socket
            .set_read_timeout(Some(Duration::from_millis(250)))
            .context("setting DNS socket timeout")?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("captive-dns".into())
            .stack_size(4096)
            .spawn(move || {
                let mut buf = [0u8; MAX_QUERY_LEN];
                while !stop_flag.load(Ordering::Relaxed) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, peer)) => {
                            if let Some(response) = build_response(&buf[..len], ip) {
                                if let Err(err) = socket.send_to(&response, peer) {
                                    warn!("DNS answer to {} failed: {}", peer, err);
                                }
                            } else {
                                debug!("Ignoring malformed DNS datagram from {}", peer);
                            }
                        }
                        // Timeout: loop back and check the stop flag.
                        Err(_) => {}
                    }
                }
            })
            .context("spawning captive DNS thread")?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DnsResponder {
    fn drop(&mut self) {
        self.stop();
    }
}
