//! Mobile Adapter GB emulation.
//!
//! [`Adapter`] is the protocol engine. It is fed one serial byte at a time and
//! hands blocking work (sockets, configuration storage) to a separate action
//! context through [`Job`]s. The [`bgb`] and [`tunnel`] modules attach it to the
//! outside world.

pub mod action;
pub mod adapter;
pub mod bgb;
pub mod board;
pub mod commands;
pub mod serial;
pub mod settings;
pub mod tunnel;

pub use action::{ActionKind, Completion, Job};
pub use adapter::{Adapter, AdapterConfig, AdapterDevice, AdapterError};
pub use serial::{Command, Packet};
