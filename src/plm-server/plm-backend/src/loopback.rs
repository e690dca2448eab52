// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Simulated modem for development and testing.
//!
//! Confirms every write immediately and answers direct messages on behalf of
//! the addressed device after a configurable delay. On/off commands update
//! an in-memory level that status requests report back. No hardware or
//! serial port required.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use plm_core::transport::{Transport, TransportEvent, WriteFuture};
use plm_core::{DeviceAddress, Msg, MsgType};

const CMD1_ON: u8 = 0x11;
const CMD1_OFF: u8 = 0x13;
const CMD1_STATUS: u8 = 0x19;
const CMD1_EXTENDED_GET: u8 = 0x2e;

pub struct LoopbackModem {
    events: mpsc::UnboundedSender<TransportEvent>,
    modem: DeviceAddress,
    reply_delay: Duration,
    levels: Arc<Mutex<HashMap<DeviceAddress, u8>>>,
}

impl LoopbackModem {
    pub fn new(
        events: mpsc::UnboundedSender<TransportEvent>,
        modem: DeviceAddress,
        reply_delay: Duration,
    ) -> Self {
        Self {
            events,
            modem,
            reply_delay,
            levels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replies the addressed device would send for `msg`.
    fn replies(&self, msg: &Msg) -> Vec<Msg> {
        if msg.msg_type != MsgType::Direct {
            return Vec::new();
        }
        let device = msg.to;
        let mut levels = self.levels.lock().expect("loopback level mutex poisoned");
        let ack_cmd2 = match msg.cmd1 {
            CMD1_ON => {
                levels.insert(device, msg.cmd2);
                msg.cmd2
            }
            CMD1_OFF => {
                levels.insert(device, 0x00);
                0x00
            }
            CMD1_STATUS => levels.get(&device).copied().unwrap_or(0x00),
            _ => msg.cmd2,
        };

        let mut replies = vec![Msg::new(
            device,
            self.modem,
            MsgType::AckOfDirect,
            msg.cmd1,
            ack_cmd2,
            None,
        )];
        if msg.cmd1 == CMD1_EXTENDED_GET {
            let mut data = [0u8; 14];
            if let Some(request) = &msg.user_data {
                data[0] = request[0];
            }
            data[1] = 0x01;
            replies.push(Msg::new(
                device,
                self.modem,
                MsgType::Direct,
                CMD1_EXTENDED_GET,
                0x00,
                Some(data),
            ));
        }
        replies
    }
}

impl Transport for LoopbackModem {
    fn name(&self) -> &str {
        "loopback"
    }

    fn write<'a>(&'a mut self, msg: &'a Msg) -> WriteFuture<'a> {
        Box::pin(async move {
            self.events.send(TransportEvent::Sent {
                msg: msg.clone(),
                at: Instant::now(),
            })?;

            let replies = self.replies(msg);
            if replies.is_empty() {
                return Ok(());
            }
            trace!("loopback answering {} with {} messages", msg, replies.len());
            let events = self.events.clone();
            let delay = self.reply_delay;
            tokio::spawn(async move {
                for reply in replies {
                    time::sleep(delay).await;
                    if events.send(TransportEvent::Received(reply)).is_err() {
                        debug!("loopback reply dropped, driver gone");
                        break;
                    }
                }
            });
            Ok(())
        })
    }
}
