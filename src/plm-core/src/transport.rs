// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::future::Future;
use std::pin::Pin;

use tokio::time::Instant;

use crate::message::Msg;
use crate::DynResult;

/// Alias to reduce type complexity in Transport.
pub type WriteFuture<'a> = Pin<Box<dyn Future<Output = DynResult<()>> + Send + 'a>>;

/// Channel to the modem. Framing and checksums are handled below this trait.
///
/// Only the request scheduler's worker writes; everything the modem reports
/// back is delivered as [`TransportEvent`]s on a channel handed to the driver.
pub trait Transport: Send {
    fn name(&self) -> &str;

    fn write<'a>(&'a mut self, msg: &'a Msg) -> WriteFuture<'a>;
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The modem confirmed `msg` went out on the wire.
    Sent { msg: Msg, at: Instant },
    /// A decoded message arrived from a device.
    Received(Msg),
    /// Input that failed to decode; logged and dropped.
    Malformed(String),
}
