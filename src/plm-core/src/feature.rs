// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Addressable device features and their query lifecycle status.

use std::fmt;

use serde::Serialize;

use crate::address::DeviceAddress;
use crate::message::{Msg, MsgKey, MsgType};

/// Index of a feature within its device's ordered feature list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FeatureId(pub usize);

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a feature's direct query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    #[default]
    NeverQueried,
    Scheduled,
    Queued,
    Sent,
    Acked,
    Answered,
    NotPollable,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NeverQueried => "NEVER_QUERIED",
            Self::Scheduled => "SCHEDULED",
            Self::Queued => "QUEUED",
            Self::Sent => "SENT",
            Self::Acked => "ACKED",
            Self::Answered => "ANSWERED",
            Self::NotPollable => "NOT_POLLABLE",
        };
        f.write_str(label)
    }
}

/// Builds the query message a feature sends when polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollHandler {
    None,
    /// Standard status request (cmd1 0x19).
    Status { cmd2: u8 },
    /// Id request used as a liveness check (cmd1 0x0F).
    Ping,
    /// Engine version request (cmd1 0x0D).
    Engine,
    /// Extended request carrying the feature group in the first data byte.
    Extended { cmd1: u8, cmd2: u8 },
}

impl PollHandler {
    pub fn is_pollable(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn make_msg(&self, address: DeviceAddress, group: Option<u8>) -> Option<Msg> {
        match self {
            Self::None => None,
            Self::Status { cmd2 } => Some(Msg::direct(address, 0x19, *cmd2)),
            Self::Ping => Some(Msg::direct(address, 0x0f, 0x00)),
            Self::Engine => Some(Msg::direct(address, 0x0d, 0x00)),
            Self::Extended { cmd1, cmd2 } => {
                let mut data = [0u8; 14];
                data[0] = group.unwrap_or(0);
                Some(Msg::direct_extended(address, *cmd1, *cmd2, data))
            }
        }
    }
}

/// Recognizes the incoming message that answers a feature's own query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerHandler {
    None,
    /// The direct acknowledgment carries the answer.
    Ack,
    /// A separate extended direct message with the queried cmd1 follows the ack.
    ExtendedReply,
}

impl AnswerHandler {
    pub fn is_answer(&self, msg: &Msg, query: &MsgKey) -> bool {
        match self {
            Self::None => false,
            Self::Ack => msg.is_ack_of_direct() && msg.cmd1 == query.cmd1,
            Self::ExtendedReply => {
                msg.msg_type == MsgType::Direct && msg.is_extended() && msg.cmd1 == query.cmd1
            }
        }
    }
}

/// Static description of one device feature.
#[derive(Debug, Clone)]
pub struct DeviceFeature {
    name: String,
    group: Option<u8>,
    poll_always: bool,
    poll: PollHandler,
    answer: AnswerHandler,
}

impl DeviceFeature {
    pub fn new(name: impl Into<String>, poll: PollHandler, answer: AnswerHandler) -> Self {
        Self {
            name: name.into(),
            group: None,
            poll_always: true,
            poll,
            answer,
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: u8) -> Self {
        self.group = Some(group);
        self
    }

    /// Only poll this feature until it has been queried once.
    #[must_use]
    pub fn poll_once(mut self) -> Self {
        self.poll_always = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> Option<u8> {
        self.group
    }

    pub fn poll_always(&self) -> bool {
        self.poll_always
    }

    pub fn poll_handler(&self) -> &PollHandler {
        &self.poll
    }

    pub fn is_pollable(&self) -> bool {
        self.poll.is_pollable()
    }

    pub fn is_ping(&self) -> bool {
        self.poll == PollHandler::Ping
    }

    pub fn poll_msg(&self, address: DeviceAddress) -> Option<Msg> {
        self.poll.make_msg(address, self.group)
    }

    pub fn is_answer(&self, msg: &Msg, query: &MsgKey) -> bool {
        self.answer.is_answer(msg, query)
    }

    pub fn initial_status(&self) -> QueryStatus {
        if self.is_pollable() {
            QueryStatus::NeverQueried
        } else {
            QueryStatus::NotPollable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: DeviceAddress = DeviceAddress::new(0x0a, 0x0b, 0x0c);

    #[test]
    fn test_poll_messages() {
        let status = PollHandler::Status { cmd2: 0x01 }.make_msg(DEV, None).unwrap();
        assert_eq!((status.cmd1, status.cmd2), (0x19, 0x01));
        assert!(!status.is_broadcast());

        let ext = PollHandler::Extended {
            cmd1: 0x2e,
            cmd2: 0x00,
        }
        .make_msg(DEV, Some(3))
        .unwrap();
        assert!(ext.is_extended());
        assert_eq!(ext.user_data.unwrap()[0], 3);

        assert!(PollHandler::None.make_msg(DEV, None).is_none());
    }

    #[test]
    fn test_answer_handlers() {
        let query = Msg::direct_extended(DEV, 0x2e, 0x00, [0; 14]).key();
        let ack = Msg::new(DEV, DeviceAddress::default(), MsgType::AckOfDirect, 0x2e, 0, None);
        let reply = Msg::new(
            DEV,
            DeviceAddress::default(),
            MsgType::Direct,
            0x2e,
            0,
            Some([1; 14]),
        );

        assert!(AnswerHandler::Ack.is_answer(&ack, &query));
        assert!(!AnswerHandler::ExtendedReply.is_answer(&ack, &query));
        assert!(AnswerHandler::ExtendedReply.is_answer(&reply, &query));
        assert!(!AnswerHandler::None.is_answer(&reply, &query));

        let other = Msg::new(DEV, DeviceAddress::default(), MsgType::AckOfDirect, 0x19, 0, None);
        assert!(!AnswerHandler::Ack.is_answer(&other, &query));
    }

    #[test]
    fn test_initial_status() {
        let pollable = DeviceFeature::new("status", PollHandler::Ping, AnswerHandler::Ack);
        let passive = DeviceFeature::new("button", PollHandler::None, AnswerHandler::None);
        assert_eq!(pollable.initial_status(), QueryStatus::NeverQueried);
        assert_eq!(passive.initial_status(), QueryStatus::NotPollable);
    }
}
