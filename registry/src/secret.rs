//! Monitor credential handling.
//!
//! The proxy's credential store owns the at-rest format of monitor
//! passwords; this module only models the contract the monitor needs:
//! the stored form is opaque, and the plaintext exists in a short-lived
//! buffer that zeroes itself when dropped.

use std::fmt;

/// A stored monitor password in the credential store's at-rest form.
///
/// When the proxy runs without an encryption key the stored form is the
/// plaintext itself; either way, callers must go through [`Secret::expose`]
/// and hold the result only for the duration of one connection attempt.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(stored: impl Into<String>) -> Self {
        Secret(stored.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Materialize the plaintext. The returned buffer is zeroed on drop.
    pub fn expose(&self) -> Plaintext {
        Plaintext {
            bytes: self.0.clone().into_bytes(),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(*****)")
    }
}

/// A decrypted password buffer. Zeroed when dropped.
pub struct Plaintext {
    bytes: Vec<u8>,
}

impl Plaintext {
    pub fn as_str(&self) -> &str {
        // The stored form is valid UTF-8 by construction.
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

impl Drop for Plaintext {
    fn drop(&mut self) {
        // Volatile writes so the wipe is not optimized away.
        for byte in self.bytes.iter_mut() {
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
    }
}

impl fmt::Debug for Plaintext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Plaintext(*****)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expose_returns_plaintext() {
        let secret = Secret::new("hunter2");
        assert_eq!(secret.expose().as_str(), "hunter2");
    }

    #[test]
    fn test_debug_redacts() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(*****)");
        assert_eq!(format!("{:?}", secret.expose()), "Plaintext(*****)");
    }

    #[test]
    fn test_empty() {
        assert!(Secret::default().is_empty());
        assert!(!Secret::new("x").is_empty());
    }
}
