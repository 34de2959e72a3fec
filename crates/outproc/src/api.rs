// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Contract seams between the binding and its collaborators.
//!
//! The gateway's broker, its in-memory message type and the user module
//! hosted in the remote process are all external to this crate. Each is
//! bound through a trait here:
//!
//! - [`Broker`] -- what the proxy publishes received messages into.
//! - [`Message`] -- the in-memory message: cloneable, serializable, and
//!   reconstructable from wire bytes. Destruction is `Drop`.
//! - [`BrokerModule`] -- the module contract the broker drives; the proxy
//!   ([`crate::proxy::OutprocModule`]) is one implementation of it.
//! - [`HostedModule`] -- the contract the host drives on the real module
//!   inside the remote process.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::host::HostOutput;

/// Identifies one module instance toward the broker, so published messages
/// can be attributed to their source without handing the broker a reference
/// back into the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(u64);

impl ModuleId {
    /// Allocate a fresh process-unique id.
    pub fn next() -> ModuleId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ModuleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Error from the external message codec.
#[derive(Debug, Clone)]
pub struct MessageError {
    reason: String,
}

impl MessageError {
    pub fn new(reason: impl Into<String>) -> MessageError {
        MessageError {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message codec error: {}", self.reason)
    }
}

impl std::error::Error for MessageError {}

/// The gateway's in-memory message type. The binding never interprets the
/// serialized form; it forwards the bytes unchanged.
pub trait Message: Clone + Send + 'static {
    /// Serialize for transmission on the message channel.
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError>;

    /// Reconstruct from bytes received on the message channel.
    fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError>;
}

/// The gateway's in-process message bus.
pub trait Broker: Send + Sync + 'static {
    type Msg: Message;

    /// Deliver a message published by the module identified by `source`.
    fn publish(&self, source: ModuleId, message: Self::Msg);
}

/// The module contract the broker calls. Implementations present a module
/// to the gateway; the out-of-process proxy is one such implementation.
pub trait BrokerModule<B: Broker>: Sized + Send + 'static {
    /// Parsed configuration consumed by [`create`](Self::create).
    type Config;
    /// Creation failure; `create` failing is the only creation-time
    /// observable the broker gets.
    type CreateError: std::error::Error;

    /// Clone the configuration text for later use. Structure is not parsed
    /// here; the caller supplies the parsed form through `create`.
    fn parse_configuration(text: Option<&str>) -> Option<String> {
        text.map(str::to_owned)
    }

    /// Release a configuration produced by
    /// [`parse_configuration`](Self::parse_configuration). No-op on `None`.
    fn free_configuration(config: Option<String>) {
        drop(config);
    }

    fn create(broker: Arc<B>, config: &Self::Config) -> Result<Self, Self::CreateError>;

    fn start(&self) {}

    /// Hand the module a message from the broker. The caller keeps
    /// ownership; implementations clone what they need to retain.
    fn receive(&self, message: &B::Msg);

    fn destroy(self) {
        drop(self);
    }
}

/// The user module the host process embeds and drives. Creation and
/// configuration failures surface as a non-zero status in the reply to the
/// Create directive; destruction is `Drop`.
pub trait HostedModule: Send + 'static {
    type Msg: Message;
    type Config: Send;
    type Error: fmt::Display;

    /// Parse the opaque argument string carried by the Create directive.
    fn parse_configuration(args: &str) -> Result<Self::Config, Self::Error>;

    /// Instantiate the module. `output` is the module's path for pushing
    /// messages back to the gateway; it stays valid until the module is
    /// dropped.
    fn create(config: Self::Config, output: HostOutput<Self::Msg>) -> Result<Self, Self::Error>
    where
        Self: Sized;

    fn start(&mut self) {}

    fn receive(&mut self, message: Self::Msg);
}
