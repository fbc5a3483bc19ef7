// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event/Command wire types, subject layout, and pattern matching.
//!
//! This crate is the stable contract shared by the bus, the sandbox API,
//! and every external agent: it defines [`Event`] and [`Command`], the
//! `sekia.*` subject grammar, and the canonical JSON form used for
//! command signing and manifest hashing. It has no knowledge of *how*
//! messages are transported (see `sekia-bus`) or signed (see
//! `sekia-security`).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod canonical;
mod command;
mod event;
pub mod subject;

pub use canonical::canonical_json;
pub use command::{Command, DEFAULT_FRESHNESS_WINDOW_SECS};
pub use event::{new_event_id, Event, Payload};
