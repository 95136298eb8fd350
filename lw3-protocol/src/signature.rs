//! Request signatures.

use crate::error::ProtocolError;
use std::fmt;
use std::str::FromStr;

/// A 4-hex-digit tag correlating a request with its response block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(u16);

impl Signature {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    /// Returns the following signature, wrapping at 0x10000.
    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for Signature {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 4 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidSignature(s.to_string()));
        }
        u16::from_str_radix(s, 16)
            .map(Signature)
            .map_err(|_| ProtocolError::InvalidSignature(s.to_string()))
    }
}

/// Hands out consecutive signatures for one connection.
#[derive(Debug, Default)]
pub struct SignatureCounter {
    next: u16,
}

impl SignatureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next signature and advances the counter.
    pub fn allocate(&mut self) -> Signature {
        let sig = Signature(self.next);
        self.next = self.next.wrapping_add(1);
        sig
    }

    /// Restarts the sequence at `0000`.
    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// Splits an optional `SSSS#` prefix off a request line.
///
/// A line is signed when its fifth character is `#` and the first four are
/// hex digits; anything else is returned unchanged as an unsigned line.
pub fn split_signature(line: &str) -> (Option<Signature>, &str) {
    if line.len() > 4 && line.as_bytes()[4] == b'#' {
        if let Ok(sig) = line[..4].parse() {
            return (Some(sig), &line[5..]);
        }
    }
    (None, line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_upper_hex() {
        assert_eq!(Signature::new(0).to_string(), "0000");
        assert_eq!(Signature::new(0x00ab).to_string(), "00AB");
        assert_eq!(Signature::new(0xffff).to_string(), "FFFF");
    }

    #[test]
    fn test_parse() {
        assert_eq!("00ab".parse::<Signature>().unwrap(), Signature::new(0xab));
        assert_eq!("1F2E".parse::<Signature>().unwrap(), Signature::new(0x1f2e));
        assert!("123".parse::<Signature>().is_err());
        assert!("12G4".parse::<Signature>().is_err());
        assert!("+123".parse::<Signature>().is_err());
    }

    #[test]
    fn test_counter_wraps() {
        let mut counter = SignatureCounter::new();
        assert_eq!(counter.allocate().to_string(), "0000");
        assert_eq!(counter.allocate().to_string(), "0001");

        counter.next = 0xffff;
        assert_eq!(counter.allocate().to_string(), "FFFF");
        assert_eq!(counter.allocate().to_string(), "0000");

        counter.reset();
        assert_eq!(counter.allocate(), Signature::new(0));
    }

    #[test]
    fn test_split_signature() {
        assert_eq!(
            split_signature("0001#GET /A"),
            (Some(Signature::new(1)), "GET /A")
        );
        assert_eq!(split_signature("GET /A"), (None, "GET /A"));
        assert_eq!(split_signature("zzzz#GET /A"), (None, "zzzz#GET /A"));
        assert_eq!(split_signature("0001#"), (Some(Signature::new(1)), ""));
        assert_eq!(split_signature("ab"), (None, "ab"));
    }
}
