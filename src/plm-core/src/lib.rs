// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod address;
pub mod device;
pub mod driver;
pub mod events;
pub mod feature;
pub mod handler;
pub mod message;
pub mod scheduler;
pub mod transport;

#[cfg(test)]
mod test_support;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use address::DeviceAddress;
pub use device::{Device, Dispatch, Incoming};
pub use driver::Driver;
pub use events::{DriverEventEmitter, DriverListener, ListenerId};
pub use feature::{AnswerHandler, DeviceFeature, FeatureId, PollHandler, QueryStatus};
pub use handler::{FeatureConfig, HandlerError, HandlerParams, HandlerRegistry};
pub use message::{GroupMessageKind, Msg, MsgKey, MsgType};
pub use scheduler::{PollScheduler, RequestScheduler, MIN_POLL_SPACING};
pub use transport::{Transport, TransportEvent, WriteFuture};
