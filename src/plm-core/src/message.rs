// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Protocol messages as seen by the scheduling core.
//!
//! Framing and checksums belong to the transport; by the time a message
//! reaches this layer it is already decoded into addresses, a message type
//! and the two command bytes.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::address::DeviceAddress;

/// Quiet time after a standard-length direct or broadcast message.
pub const QUIET_TIME_STANDARD: Duration = Duration::from_millis(1000);
/// Quiet time after an extended-length message.
pub const QUIET_TIME_EXTENDED: Duration = Duration::from_millis(2000);

/// All-link broadcast cmd1 announcing that cleanup completed.
pub const CMD1_SUCCESS_REPORT: u8 = 0x06;

/// Message type carried in the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Direct,
    AckOfDirect,
    NackOfDirect,
    Broadcast,
    AllLinkBroadcast,
    AllLinkCleanup,
    AckOfCleanup,
    NackOfCleanup,
}

impl MsgType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Direct => "DIRECT",
            Self::AckOfDirect => "ACK_OF_DIRECT",
            Self::NackOfDirect => "NACK_OF_DIRECT",
            Self::Broadcast => "BROADCAST",
            Self::AllLinkBroadcast => "ALL_LINK_BROADCAST",
            Self::AllLinkCleanup => "ALL_LINK_CLEANUP",
            Self::AckOfCleanup => "ACK_OF_CLEANUP",
            Self::NackOfCleanup => "NACK_OF_CLEANUP",
        }
    }
}

/// Position of a message within a broadcast / cleanup / success sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupMessageKind {
    Bcast,
    Clean,
    Success,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Msg {
    pub from: DeviceAddress,
    pub to: DeviceAddress,
    pub msg_type: MsgType,
    pub cmd1: u8,
    pub cmd2: u8,
    pub user_data: Option<[u8; 14]>,
    quiet_time: Duration,
}

/// Explicit identity of a message, independent of its quiet time.
///
/// Two messages with the same key ask the same device for the same thing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MsgKey {
    pub to: DeviceAddress,
    pub msg_type: MsgType,
    pub cmd1: u8,
    pub cmd2: u8,
    pub user_data: Option<[u8; 14]>,
}

impl Msg {
    pub fn new(
        from: DeviceAddress,
        to: DeviceAddress,
        msg_type: MsgType,
        cmd1: u8,
        cmd2: u8,
        user_data: Option<[u8; 14]>,
    ) -> Self {
        let quiet_time = if user_data.is_some() {
            QUIET_TIME_EXTENDED
        } else {
            QUIET_TIME_STANDARD
        };
        Self {
            from,
            to,
            msg_type,
            cmd1,
            cmd2,
            user_data,
            quiet_time,
        }
    }

    /// Outbound standard direct message.
    pub fn direct(to: DeviceAddress, cmd1: u8, cmd2: u8) -> Self {
        Self::new(DeviceAddress::default(), to, MsgType::Direct, cmd1, cmd2, None)
    }

    /// Outbound extended direct message.
    pub fn direct_extended(to: DeviceAddress, cmd1: u8, cmd2: u8, data: [u8; 14]) -> Self {
        Self::new(
            DeviceAddress::default(),
            to,
            MsgType::Direct,
            cmd1,
            cmd2,
            Some(data),
        )
    }

    /// Outbound all-link broadcast to a group.
    pub fn group_broadcast(group: u8, cmd1: u8, cmd2: u8) -> Self {
        Self::new(
            DeviceAddress::default(),
            DeviceAddress::new(0, 0, group),
            MsgType::AllLinkBroadcast,
            cmd1,
            cmd2,
            None,
        )
    }

    #[must_use]
    pub fn with_quiet_time(mut self, quiet_time: Duration) -> Self {
        self.quiet_time = quiet_time;
        self
    }

    /// Minimum channel idle time after sending this message.
    pub fn quiet_time(&self) -> Duration {
        self.quiet_time
    }

    pub fn is_extended(&self) -> bool {
        self.user_data.is_some()
    }

    /// Broadcast-class messages expect no direct reply and never occupy
    /// the query slot.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self.msg_type,
            MsgType::Broadcast | MsgType::AllLinkBroadcast
        )
    }

    pub fn is_ack_of_direct(&self) -> bool {
        self.msg_type == MsgType::AckOfDirect
    }

    pub fn is_nack_of_direct(&self) -> bool {
        self.msg_type == MsgType::NackOfDirect
    }

    pub fn is_reply(&self) -> bool {
        self.is_ack_of_direct() || self.is_nack_of_direct()
    }

    /// Group number for all-link broadcast and cleanup messages.
    pub fn group(&self) -> Option<u8> {
        match self.msg_type {
            MsgType::AllLinkBroadcast => Some(self.to.low()),
            MsgType::AllLinkCleanup => Some(self.cmd2),
            _ => None,
        }
    }

    /// Classify a group message for duplicate suppression.
    pub fn group_kind(&self) -> Option<(u8, GroupMessageKind)> {
        let group = self.group()?;
        let kind = match self.msg_type {
            MsgType::AllLinkBroadcast if self.cmd1 == CMD1_SUCCESS_REPORT => {
                GroupMessageKind::Success
            }
            MsgType::AllLinkBroadcast => GroupMessageKind::Bcast,
            _ => GroupMessageKind::Clean,
        };
        Some((group, kind))
    }

    pub fn key(&self) -> MsgKey {
        MsgKey {
            to: self.to,
            msg_type: self.msg_type,
            cmd1: self.cmd1,
            cmd2: self.cmd2,
            user_data: self.user_data,
        }
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{} cmd1={:02X} cmd2={:02X}",
            self.msg_type.label(),
            self.from,
            self.to,
            self.cmd1,
            self.cmd2
        )?;
        if let Some(data) = &self.user_data {
            write!(f, " data=")?;
            for byte in data {
                write!(f, "{:02X}", byte)?;
            }
        }
        Ok(())
    }
}
