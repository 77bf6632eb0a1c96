// Bounded JSON encoder
// Request payloads are serialized into a stack-allocated, fixed-capacity
// buffer. If the serialized form does not fit, the encode fails as a value;
// it never truncates and never allocates past the cap. The capacity is chosen
// per endpoint by the caller.

use std::io;

use serde::Serialize;

/// Fixed-capacity, null-terminated text buffer. The terminator counts toward
/// the capacity, so at most `N - 1` payload bytes are accepted.
#[derive(Debug)]
pub struct BoundedBuffer<const N: usize> {
    buf: [u8; N],
    len: usize,
}

/// The serialized payload would have exceeded the buffer capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    pub capacity: usize,
}

impl std::fmt::Display for Overflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "payload exceeds bounded buffer of {} bytes", self.capacity)
    }
}

impl std::error::Error for Overflow {}

impl<const N: usize> BoundedBuffer<N> {
    pub fn new() -> Self {
        Self {
            buf: [0u8; N],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload without the terminator.
    pub fn as_str(&self) -> &str {
        // Only ever filled by serde_json, which emits valid UTF-8, and writes
        // are all-or-nothing so no partial code point can be stored.
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl<const N: usize> Default for BoundedBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> io::Write for BoundedBuffer<N> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        // All-or-nothing: rejecting the whole chunk keeps the buffer free of
        // truncated output when the encode is abandoned.
        if self.len + data.len() > N.saturating_sub(1) {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "bounded buffer capacity exceeded",
            ));
        }
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serializes `value` as JSON into a fresh buffer of capacity `N`, appending
/// the null terminator. Overflow is reported as a value; the caller maps it to
/// `ApiStatus::ClientBufferOverflow` and abandons the operation.
pub fn encode_json<const N: usize, T: Serialize>(value: &T) -> Result<BoundedBuffer<N>, Overflow> {
    let mut buf = BoundedBuffer::<N>::new();
    // Our payload types serialize infallibly, so the only failure mode
    // reaching here is the io error raised by the capacity check above.
    serde_json::to_writer(&mut buf, value).map_err(|_| Overflow { capacity: N })?;
    // `write` guarantees len <= N - 1, so the terminator always fits.
    buf.buf[buf.len] = 0;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Sample<'a> {
        msg: &'a str,
    }

    #[test]
    fn small_payload_fits_and_is_null_terminated() {
        let buf = encode_json::<64, _>(&Sample { msg: "hi" }).unwrap();
        assert_eq!(buf.as_str(), r#"{"msg":"hi"}"#);
        assert_eq!(buf.buf[buf.len], 0);
        assert_eq!(buf.len(), buf.as_str().len());
    }

    #[test]
    fn oversized_payload_is_an_overflow_not_a_truncation() {
        let long = "x".repeat(128);
        let err = encode_json::<64, _>(&Sample { msg: &long }).unwrap_err();
        assert_eq!(err.capacity, 64);
    }

    #[test]
    fn exact_fit_accounts_for_the_terminator() {
        // {"msg":"…"} is 10 bytes of syntax; with the terminator the JSON must
        // stay at N - 1 bytes or less.
        let msg = "a".repeat(21);
        let json_len = 10 + msg.len();
        assert_eq!(json_len, 31);
        assert!(encode_json::<32, _>(&Sample { msg: &msg }).is_ok());

        let msg = "a".repeat(22);
        assert!(encode_json::<32, _>(&Sample { msg: &msg }).is_err());
    }

    #[test]
    fn encoder_survives_overflow_without_panicking() {
        // Hammer it with growing payloads around the boundary.
        for n in 0..64 {
            let msg = "b".repeat(n);
            let _ = encode_json::<32, _>(&Sample { msg: &msg });
        }
    }
}
