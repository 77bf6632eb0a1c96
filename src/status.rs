// API status protocol
// Every network operation in this firmware resolves to this closed taxonomy;
// callers branch on it and nothing else. Raw HTTP codes never cross a module
// boundary.

use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStatus {
    /// The operation succeeded (2xx with the expected payload shape).
    Ok,
    /// The auth token was refused. The caller erases it so the device
    /// re-provisions on a later tick.
    Forbidden,
    /// A dependent identifier (plant id) is no longer valid server-side.
    NotFound,
    /// The event was accepted but the firmware is outdated (412).
    MustUpgrade,
    /// A request payload did not fit its bounded buffer. Raised locally with
    /// no network round-trip; this is a logic/config bug, not a server fault.
    ClientBufferOverflow,
    /// A response arrived but is unusable: unexpected status code, payload
    /// missing or malformed, or larger than the reception buffer.
    BrokenServer,
    /// No transport response at all.
    ConnectionIssues,
}

impl ApiStatus {
    /// Classifies an HTTP status code that did arrive.
    pub fn from_http(code: u16) -> Self {
        match code {
            200 => Self::Ok,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            412 => Self::MustUpgrade,
            _ => Self::BrokenServer,
        }
    }

    /// Classifies the absence or corruption of a transport response.
    pub fn from_transport(err: &TransportError) -> Self {
        match err {
            TransportError::ConnectionFailed => Self::ConnectionIssues,
            TransportError::ResponseTooLarge => Self::BrokenServer,
            TransportError::Interrupted => Self::BrokenServer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not found",
            Self::MustUpgrade => "must upgrade",
            Self::ClientBufferOverflow => "client buffer overflow",
            Self::BrokenServer => "broken server",
            Self::ConnectionIssues => "connection issues",
        }
    }
}

impl std::fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map_to_their_variant() {
        assert_eq!(ApiStatus::from_http(200), ApiStatus::Ok);
        assert_eq!(ApiStatus::from_http(403), ApiStatus::Forbidden);
        assert_eq!(ApiStatus::from_http(404), ApiStatus::NotFound);
        assert_eq!(ApiStatus::from_http(412), ApiStatus::MustUpgrade);
    }

    #[test]
    fn anything_else_is_a_broken_server() {
        for code in [201, 301, 400, 401, 418, 500, 502] {
            assert_eq!(ApiStatus::from_http(code), ApiStatus::BrokenServer);
        }
    }

    #[test]
    fn transport_failures_split_local_and_remote() {
        assert_eq!(
            ApiStatus::from_transport(&TransportError::ConnectionFailed),
            ApiStatus::ConnectionIssues
        );
        assert_eq!(
            ApiStatus::from_transport(&TransportError::ResponseTooLarge),
            ApiStatus::BrokenServer
        );
        assert_eq!(
            ApiStatus::from_transport(&TransportError::Interrupted),
            ApiStatus::BrokenServer
        );
    }
}
