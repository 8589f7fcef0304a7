//! Central-side link manager for a split wireless keyboard.
//!
//! The central half owns one [`slot::SlotRegistry`] slot per bonded
//! peripheral and alternates between scanning and connecting until every
//! slot has a link. After a connection comes up, [`discovery`] walks the
//! split GATT service, records value handles and subscribes to the
//! notify characteristics. Inbound notifications land in bounded queues
//! ([`bridge`]) and are re-published as typed events from worker
//! context; outbound writes (behaviors, layout, layers, indicators) are
//! funneled through [`dispatch`].
//!
//! The BLE stack itself sits behind the [`transport::Transport`] trait,
//! so the whole state machine runs on the host under `cargo test` with
//! the `mock` feature's in-memory transport.

#![cfg_attr(not(test), no_std)]

// This mod must go first so the log macros are visible everywhere.
mod fmt;

pub mod adv;
pub mod bridge;
pub mod central;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod slot;
pub mod transport;
pub mod uuid;

#[cfg(feature = "mock")]
pub mod mock;

pub use central::{Central, SplitApi};
pub use error::{Error, TransportError};
