// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod poll;
pub mod request;

pub use poll::{PollQueue, PollScheduler, MIN_POLL_SPACING};
pub use request::{RequestSchedule, RequestScheduler};
