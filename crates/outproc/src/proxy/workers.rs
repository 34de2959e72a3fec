// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The proxy's long-lived worker loops.
//!
//! Three threads run per started proxy:
//!
//! - **receiver** -- drains the message channel and publishes into the
//!   broker.
//! - **sender** -- drains the outgoing queue onto the message channel, but
//!   only once a session exists: messages received before the remote
//!   module is up wait in the queue instead of being dropped.
//! - **supervisor** -- polls the control channel for module replies and
//!   re-runs the create handshake (then Start) when the remote reports
//!   failure or termination.
//!
//! Every loop iteration re-snapshots its socket from the shared channels
//! state; a `None` snapshot means teardown has begun. Stop flags are
//! checked before any I/O.

use std::sync::Arc;
use std::thread;

use crate::api::{Broker, Message};
use crate::protocol::ControlFrame;
use crate::slot::{lock_recovered, ThreadSlot};
use crate::transport::IoMode;

use super::handshake::{run_create_handshake, HandshakeError};
use super::ProxyShared;

/// Spawn a named worker into its slot. A spawn failure is logged and the
/// slot stays empty; the rest of the proxy keeps working.
pub(crate) fn spawn_worker(
    slot: &ThreadSlot,
    f: impl FnOnce() + Send + 'static,
) {
    match thread::Builder::new().name(slot.name().into()).spawn(f) {
        Ok(handle) => slot.install(handle),
        Err(e) => log::error!("[PROXY] failed to spawn {} thread: {}", slot.name(), e),
    }
}

/// Send a Start directive on the control channel, interrupt-safe. Failures
/// are logged; the worker threads keep running either way.
pub(crate) fn send_start<B: Broker>(shared: &ProxyShared<B>) {
    let control = {
        let channels = lock_recovered(&shared.channels, "channels");
        channels.control.clone()
    };
    let Some(control) = control else {
        log::warn!("[PROXY] control channel closed, start message not sent");
        return;
    };
    match ControlFrame::ModuleStart.to_bytes() {
        Ok(buf) => {
            if let Err(e) = control.send(&buf, IoMode::Blocking) {
                log::error!("[PROXY] unable to send start message: {}", e);
            }
        }
        Err(e) => log::error!("[PROXY] unable to encode start message: {}", e),
    }
}

/// Receiver loop: message channel → broker.
pub(crate) fn receiver_loop<B: Broker>(shared: Arc<ProxyShared<B>>) {
    loop {
        if shared.receiver.stop_requested() {
            break;
        }
        let socket = {
            let channels = lock_recovered(&shared.channels, "channels");
            channels.message.clone()
        };
        let Some(socket) = socket else { break };

        match socket.recv(IoMode::Blocking) {
            Ok(bytes) => match <B::Msg as Message>::from_bytes(&bytes) {
                Ok(message) => shared.broker.publish(shared.id, message),
                Err(e) => {
                    log::error!(
                        "[PROXY] dropping undecodable gateway message ({} bytes): {}",
                        bytes.len(),
                        e
                    );
                }
            },
            Err(e) if e.is_transient() => {}
            Err(e) => {
                log::debug!("[PROXY] receiver exiting on message channel error: {}", e);
                break;
            }
        }
        thread::sleep(shared.timing.data_poll);
    }
    log::debug!("[PROXY] {} receiver thread finished", shared.id);
}

/// Sender loop: outgoing queue → message channel.
pub(crate) fn sender_loop<B: Broker>(shared: Arc<ProxyShared<B>>) {
    loop {
        if shared.sender.stop_requested() {
            break;
        }
        let socket = {
            let channels = lock_recovered(&shared.channels, "channels");
            channels.message.clone()
        };
        let Some(socket) = socket else { break };

        // Hold queued messages until the remote end is reachable; popping
        // while the session is down would turn a slow host start into
        // message loss.
        if !socket.ready() {
            thread::sleep(shared.timing.data_poll);
            continue;
        }

        let message = {
            let mut channels = lock_recovered(&shared.channels, "channels");
            channels.outgoing.pop()
        };
        if let Some(message) = message {
            match message.to_bytes() {
                Ok(buf) => {
                    if let Err(e) = socket.send(&buf, IoMode::Blocking) {
                        log::error!("[PROXY] unable to send message to remote: {}", e);
                    }
                }
                Err(e) => log::error!("[PROXY] unable to serialize outgoing message: {}", e),
            }
            // The popped message drops here, sent or not.
        }
        thread::sleep(shared.timing.data_poll);
    }
    log::debug!("[PROXY] {} sender thread finished", shared.id);
}

/// Supervisor loop: watch the control channel, re-attach on remote failure.
pub(crate) fn supervisor_loop<B: Broker>(shared: Arc<ProxyShared<B>>) {
    let mut needs_reattach = false;
    loop {
        if shared.supervisor.stop_requested() {
            break;
        }

        if needs_reattach {
            match run_create_handshake(&shared, &shared.supervisor) {
                Ok(()) => {
                    log::info!("[PROXY] {} reattached to remote module host", shared.id);
                    send_start(&shared);
                    needs_reattach = false;
                }
                Err(HandshakeError::Stopped) => break,
                Err(e) => {
                    // Flag stays set; the next pass retries.
                    log::error!("[PROXY] attempt to reattach to remote failed: {}", e);
                }
            }
        }

        let socket = {
            let channels = lock_recovered(&shared.channels, "channels");
            channels.control.clone()
        };
        let Some(socket) = socket else { break };

        match socket.recv(IoMode::NonBlocking) {
            Err(e) if e.is_transient() => {}
            Err(e) => {
                log::debug!("[PROXY] supervisor exiting on control channel error: {}", e);
                break;
            }
            Ok(bytes) => match ControlFrame::decode(&bytes) {
                Ok(ControlFrame::ModuleReply { status }) if status != 0 => {
                    log::warn!(
                        "[PROXY] {} remote module reported status {}; scheduling reattach",
                        shared.id,
                        status
                    );
                    needs_reattach = true;
                }
                Ok(_) => {}
                Err(e) => log::debug!("[PROXY] dropping undecodable control frame: {}", e),
            },
        }
        thread::sleep(shared.timing.supervisor_poll);
    }
    log::debug!("[PROXY] {} supervisor thread finished", shared.id);
}
