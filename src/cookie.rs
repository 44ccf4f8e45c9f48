//! Loading and constant-time comparison of the listener's shared-secret
//! authentication cookie.

use std::fs;
use std::io;
use std::path::Path;

/// Cookie length in bytes.
///
/// Matches the original protocol's `PA_NATIVE_COOKIE_LENGTH`.
pub const COOKIE_LEN: usize = 16;

/// The listener's shared secret, compared against the `cookie` argument of
/// an inbound `AUTH` command.
#[derive(Clone)]
pub struct Cookie([u8; COOKIE_LEN]);

impl Cookie {
    /// Wraps an already-loaded cookie value.
    pub fn new(bytes: [u8; COOKIE_LEN]) -> Cookie {
        Cookie(bytes)
    }

    /// Reads a cookie from a file, failing if it is not exactly
    /// [`COOKIE_LEN`] bytes.
    pub fn load(path: &Path) -> io::Result<Cookie> {
        let data = fs::read(path)?;
        if data.len() != COOKIE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "cookie file {} has length {}, expected {COOKIE_LEN}",
                    path.display(),
                    data.len()
                ),
            ));
        }

        let mut bytes = [0u8; COOKIE_LEN];
        bytes.copy_from_slice(&data);
        Ok(Cookie(bytes))
    }

    /// Compares `candidate` against this cookie in constant time,
    /// regardless of where the two values first differ.
    pub fn matches(&self, candidate: &[u8]) -> bool {
        if candidate.len() != COOKIE_LEN {
            return false;
        }

        let mut diff = 0u8;
        for (a, b) in self.0.iter().zip(candidate.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}
