// HTTP transport seam
// The transport delivers raw responses; interpretation into `ApiStatus` is
// the api module's job. Body payloads are bounded by the implementation's
// reception buffer, and exceeding it is distinguishable from having no
// response at all because the recovery action differs.

use anyhow::Result;

use crate::models::AuthToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

/// A response that did arrive. `payload` is `None` for empty bodies.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No response at all: radio down, DNS, TCP, TLS, or request write
    /// failure. Maps to `ApiStatus::ConnectionIssues`.
    ConnectionFailed,
    /// A response arrived but its body exceeds the reception buffer. Maps to
    /// `ApiStatus::BrokenServer`.
    ResponseTooLarge,
    /// The body transfer or a local sink write aborted midway. Maps to
    /// `ApiStatus::BrokenServer`.
    Interrupted,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed => write!(f, "no transport response"),
            Self::ResponseTooLarge => write!(f, "response exceeds reception buffer"),
            Self::Interrupted => write!(f, "transfer interrupted"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Receives a firmware image streamed by `HttpTransport::download`. The sink
/// drives the transfer: it pulls chunks through the provided reader callback
/// and commits the image only when the stream ends cleanly.
pub trait FirmwareSink {
    /// `read_chunk` fills the provided buffer and returns the byte count,
    /// `0` at end of stream.
    fn apply(
        &mut self,
        expected_len: Option<usize>,
        read_chunk: &mut dyn FnMut(&mut [u8]) -> Result<usize>,
    ) -> Result<()>;
}

pub trait HttpTransport {
    fn is_connected(&mut self) -> bool;
    fn mac_address(&mut self) -> String;
    fn disconnect(&mut self);

    /// One request against the backend; `path` is relative to the configured
    /// host, `token` travels as a bearer credential, `body` is already-encoded
    /// JSON.
    fn request(
        &mut self,
        method: HttpMethod,
        path: &str,
        token: Option<&AuthToken>,
        body: Option<&str>,
    ) -> Result<Response, TransportError>;

    /// GET with a streamed body. On 200 the body is fed through `sink`
    /// (including commit); on any other status the sink is untouched and the
    /// status is returned for classification. `current_version` travels as an
    /// `x-version` header so the server can answer 304.
    fn download(
        &mut self,
        path: &str,
        token: &AuthToken,
        current_version: &str,
        sink: &mut dyn FirmwareSink,
    ) -> Result<u16, TransportError>;
}
