// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The create handshake, shared by the creator thread and the supervisor's
//! re-attach path.

use std::fmt;
use std::thread;

use crate::api::Broker;
use crate::protocol::{ControlFrame, WireError};
use crate::slot::{lock_recovered, ThreadSlot};
use crate::transport::{IoMode, TransportError};

use super::ProxyShared;

/// Why a handshake round ended without a session.
#[derive(Debug)]
pub enum HandshakeError {
    /// The owning slot was told to stop; shutdown wins over re-attach.
    Stopped,
    /// Attempt limit reached without any reply from the host.
    Exhausted,
    /// The host replied with a non-zero status.
    Rejected(i32),
    /// The host replied with something other than a well-formed reply.
    BadReply,
    /// The control channel is gone or failed hard.
    Transport(TransportError),
    /// The Create frame could not be encoded.
    Wire(WireError),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Stopped => write!(f, "handshake stopped by shutdown"),
            HandshakeError::Exhausted => write!(f, "handshake attempts exhausted"),
            HandshakeError::Rejected(status) => {
                write!(f, "remote module creation failed with status {}", status)
            }
            HandshakeError::BadReply => write!(f, "unexpected reply on control channel"),
            HandshakeError::Transport(e) => write!(f, "control channel failed: {}", e),
            HandshakeError::Wire(e) => write!(f, "unable to encode create message: {}", e),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Run the create handshake: send the Create frame and wait for the host's
/// reply, retrying while the peer is unreachable or silent.
///
/// The frame is built once; the loop re-sends it on every transient
/// failure. `slot` is whichever worker is driving the handshake (the
/// creator thread at module creation, the supervisor on re-attach) -- its
/// stop flag is honored on every iteration so shutdown is never delayed by
/// a retry loop. One round is bounded by `timing.handshake_attempts`.
pub(crate) fn run_create_handshake<B: Broker>(
    shared: &ProxyShared<B>,
    slot: &ThreadSlot,
) -> Result<(), HandshakeError> {
    let control = {
        let channels = lock_recovered(&shared.channels, "channels");
        channels.control.clone()
    };
    let control = control.ok_or(HandshakeError::Transport(TransportError::Closed))?;

    let frame = ControlFrame::create(&shared.message_url, &shared.module_args);
    let create = frame.to_bytes().map_err(HandshakeError::Wire)?;
    let wait = shared.remote_wait;
    control.set_recv_timeout(Some(wait));

    let max_attempts = shared.timing.handshake_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        if slot.stop_requested() {
            return Err(HandshakeError::Stopped);
        }
        if attempt >= max_attempts {
            return Err(HandshakeError::Exhausted);
        }
        attempt += 1;

        match control.send(&create, IoMode::NonBlocking) {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                log::debug!(
                    "[CTRL] create send not accepted ({}), retrying in {:?}",
                    e,
                    wait
                );
                thread::sleep(wait);
                continue;
            }
            Err(e) => return Err(HandshakeError::Transport(e)),
        }

        // Bounded by the receive timeout set above.
        match control.recv(IoMode::Blocking) {
            Err(e) if e.is_transient() => continue,
            Err(e) => return Err(HandshakeError::Transport(e)),
            Ok(bytes) => {
                return match ControlFrame::decode(&bytes) {
                    Ok(ControlFrame::ModuleReply { status: 0 }) => {
                        log::debug!("[CTRL] remote module created after {} attempt(s)", attempt);
                        Ok(())
                    }
                    Ok(ControlFrame::ModuleReply { status }) => Err(HandshakeError::Rejected(status)),
                    Ok(frame) => {
                        log::warn!("[CTRL] expected a module reply, got {:?}", frame);
                        Err(HandshakeError::BadReply)
                    }
                    Err(e) => {
                        log::warn!("[CTRL] undecodable frame during create handshake: {}", e);
                        Err(HandshakeError::BadReply)
                    }
                };
            }
        }
    }
}
