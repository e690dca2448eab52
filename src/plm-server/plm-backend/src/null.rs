// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Transport that confirms every write and never hears a reply.
//!
//! Useful for watching queries time out.

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use plm_core::transport::{Transport, TransportEvent, WriteFuture};
use plm_core::Msg;

pub struct NullTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl NullTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { events }
    }
}

impl Transport for NullTransport {
    fn name(&self) -> &str {
        "null"
    }

    fn write<'a>(&'a mut self, msg: &'a Msg) -> WriteFuture<'a> {
        Box::pin(async move {
            trace!("null write: {}", msg);
            self.events.send(TransportEvent::Sent {
                msg: msg.clone(),
                at: Instant::now(),
            })?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plm_core::DeviceAddress;

    #[tokio::test]
    async fn test_only_echoes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = NullTransport::new(tx);
        let msg = Msg::direct(DeviceAddress::new(1, 2, 3), 0x19, 0x00);
        transport.write(&msg).await.unwrap();

        assert!(matches!(rx.recv().await, Some(TransportEvent::Sent { msg: m, .. }) if m == msg));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_is_an_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut transport = NullTransport::new(tx);
        let msg = Msg::direct(DeviceAddress::new(1, 2, 3), 0x19, 0x00);
        assert!(transport.write(&msg).await.is_err());
    }
}
