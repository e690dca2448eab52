// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Three-byte device address on the power-line/RF network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress([u8; 3]);

impl DeviceAddress {
    #[must_use]
    pub const fn new(high: u8, middle: u8, low: u8) -> Self {
        Self([high, middle, low])
    }

    #[must_use]
    pub fn bytes(&self) -> [u8; 3] {
        self.0
    }

    /// Low byte; carries the group number for all-link broadcasts.
    #[must_use]
    pub fn low(&self) -> u8 {
        self.0[2]
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}.{:02X}.{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

impl FromStr for DeviceAddress {
    type Err = String;

    /// Accepts `AA.BB.CC` or `AABBCC`, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.trim().chars().filter(|c| *c != '.').collect();
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("invalid device address: {}", s));
        }
        let mut bytes = [0u8; 3];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|e| format!("invalid device address {}: {}", s, e))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(value: DeviceAddress) -> Self {
        value.to_string()
    }
}
