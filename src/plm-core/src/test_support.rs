// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Shared fixtures for the scheduler and driver tests.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::address::DeviceAddress;
use crate::device::Device;
use crate::feature::{AnswerHandler, DeviceFeature, PollHandler};
use crate::message::{Msg, MsgType};
use crate::scheduler::RequestScheduler;
use crate::transport::{Transport, TransportEvent, WriteFuture};

pub type WriteLog = Arc<Mutex<Vec<(Instant, Msg)>>>;

/// A mains-powered device with a single status feature.
pub fn status_device(address: DeviceAddress, scheduler: &RequestScheduler) -> Arc<Device> {
    Arc::new(Device::new(
        address,
        vec![DeviceFeature::new(
            "status",
            PollHandler::Status { cmd2: 0 },
            AnswerHandler::Ack,
        )],
        false,
        scheduler.clone(),
    ))
}

/// Records every write with the time it happened.
pub struct RecordingTransport {
    log: WriteLog,
}

impl RecordingTransport {
    pub fn new() -> (Self, WriteLog) {
        let log = WriteLog::default();
        (Self { log: log.clone() }, log)
    }
}

impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    fn write<'a>(&'a mut self, msg: &'a Msg) -> WriteFuture<'a> {
        Box::pin(async move {
            self.log
                .lock()
                .expect("write log mutex poisoned")
                .push((Instant::now(), msg.clone()));
            Ok(())
        })
    }
}

/// Fails every write and counts the attempts.
pub struct FailingTransport {
    attempts: Arc<Mutex<usize>>,
}

impl FailingTransport {
    pub fn new() -> (Self, Arc<Mutex<usize>>) {
        let attempts = Arc::new(Mutex::new(0));
        (
            Self {
                attempts: attempts.clone(),
            },
            attempts,
        )
    }
}

impl Transport for FailingTransport {
    fn name(&self) -> &str {
        "failing"
    }

    fn write<'a>(&'a mut self, _msg: &'a Msg) -> WriteFuture<'a> {
        Box::pin(async move {
            *self.attempts.lock().expect("attempts mutex poisoned") += 1;
            Err("serial port gone".into())
        })
    }
}

/// Reports every write as sent and acknowledges direct messages at once.
pub struct EchoTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl EchoTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { events }
    }
}

impl Transport for EchoTransport {
    fn name(&self) -> &str {
        "echo"
    }

    fn write<'a>(&'a mut self, msg: &'a Msg) -> WriteFuture<'a> {
        Box::pin(async move {
            self.events.send(TransportEvent::Sent {
                msg: msg.clone(),
                at: Instant::now(),
            })?;
            if msg.msg_type == MsgType::Direct {
                let ack = Msg::new(
                    msg.to,
                    DeviceAddress::default(),
                    MsgType::AckOfDirect,
                    msg.cmd1,
                    msg.cmd2,
                    None,
                );
                self.events.send(TransportEvent::Received(ack))?;
            }
            Ok(())
        })
    }
}
