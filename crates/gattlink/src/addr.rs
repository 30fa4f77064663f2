//! Device address types
//!
//! A BLE peer is identified by a 6-byte link-layer address plus an address
//! type tag. There is no default address type: the stack cannot know
//! whether a peripheral advertises with a public or a random address, so
//! every connect call takes it explicitly.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Link-layer address type for a BLE device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Public,
    Random,
}

/// A 6-byte Bluetooth device address.
///
/// Bytes are stored in transmission order (little-endian), so
/// `bytes[5]` is the most significant byte shown in the usual
/// `AA:BB:CC:DD:EE:FF` rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// Error parsing a textual device address.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid device address: {0:?}")]
pub struct ParseAddrError(pub String);

impl FromStr for BdAddr {
    type Err = ParseAddrError;

    /// Parses the colon-separated form, e.g. `"00:11:22:33:FF:EE"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseAddrError(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ParseAddrError(s.to_string()));
            }
            // Display order is reversed relative to storage order
            bytes[5 - i] =
                u8::from_str_radix(part, 16).map_err(|_| ParseAddrError(s.to_string()))?;
        }

        Ok(Self { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let addr: BdAddr = "00:11:22:33:FF:EE".parse().unwrap();
        assert_eq!(addr.bytes, [0xEE, 0xFF, 0x33, 0x22, 0x11, 0x00]);
        assert_eq!(addr.to_string(), "00:11:22:33:FF:EE");
    }

    #[test]
    fn parse_accepts_lowercase() {
        let addr: BdAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!("00:11:22:33:FF".parse::<BdAddr>().is_err());
        assert!("00:11:22:33:FF:EE:77".parse::<BdAddr>().is_err());
        assert!("00:11:22:33:FF:GG".parse::<BdAddr>().is_err());
        assert!("001122:33:FF:EE".parse::<BdAddr>().is_err());
        assert!("".parse::<BdAddr>().is_err());
    }

    #[test]
    fn from_slice_requires_six_bytes() {
        assert!(BdAddr::from_slice(&[1, 2, 3]).is_none());
        let addr = BdAddr::from_slice(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
        assert_eq!(addr.bytes, [1, 2, 3, 4, 5, 6]);
    }
}
