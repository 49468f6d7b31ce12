// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use std::net::Ipv4Addr;

/// The OUI prefixed to every VTEP hardware address.
pub const VTEP_MAC_PREFIX: [u8; 2] = [0xEE, 0xEE];

/// A MAC address.
///
/// On the wire and in kernel tooling output this is always the
/// lower-case, colon-separated form, e.g. `ee:ee:0a:ff:07:00`.
#[derive(Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct MacAddr {
    inner: [u8; 6],
}

impl MacAddr {
    pub const BROADCAST: Self = Self { inner: [0xFF; 6] };
    pub const ZERO: Self = Self { inner: [0x00; 6] };

    /// Return the bytes of the MAC address.
    #[inline]
    pub fn bytes(&self) -> [u8; 6] {
        self.inner
    }

    pub const fn from_const(bytes: [u8; 6]) -> Self {
        Self { inner: bytes }
    }

    /// Derive the hardware address of the VTEP whose overlay address
    /// is `ip`: the fixed [`VTEP_MAC_PREFIX`] followed by the four
    /// octets of the address.
    pub fn for_vtep(ip: Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        Self { inner: [VTEP_MAC_PREFIX[0], VTEP_MAC_PREFIX[1], a, b, c, d] }
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self { inner: bytes }
    }
}

impl AsRef<[u8]> for MacAddr {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<u8> = s
            .split(':')
            .map(|s| {
                u8::from_str_radix(s, 16).map_err(|_| format!("bad octet: {s}"))
            })
            .collect::<Result<Vec<u8>, _>>()?;

        if octets.len() != 6 {
            return Err(format!("incorrect number of bytes: {}", octets.len()));
        }

        let bytes =
            [octets[0], octets[1], octets[2], octets[3], octets[4], octets[5]];

        Ok(MacAddr { inner: bytes })
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.inner[0],
            self.inner[1],
            self.inner[2],
            self.inner[3],
            self.inner[4],
            self.inner[5]
        )
    }
}

// There's no reason to view the MAC address as its raw array, so just
// present it in a human-friendly manner.
impl Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn vtep_mac_embeds_address() {
        let mac = MacAddr::for_vtep("10.255.7.0".parse().unwrap());
        assert_eq!(mac.to_string(), "ee:ee:0a:ff:07:00");
    }

    #[test]
    fn parse_accepts_either_case() {
        let lower: MacAddr = "ee:ee:0a:ff:07:00".parse().unwrap();
        let upper: MacAddr = "EE:EE:0A:FF:07:00".parse().unwrap();
        assert_eq!(lower, upper);
        assert!("ee:ee:0a".parse::<MacAddr>().is_err());
        assert!("ee:ee:0a:ff:07:zz".parse::<MacAddr>().is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let mac = MacAddr::from_const([0xEE, 0xEE, 0x0A, 0xFF, 0x09, 0x00]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"ee:ee:0a:ff:09:00\"");
    }
}
