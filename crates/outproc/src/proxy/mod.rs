// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The in-process half of the binding.
//!
//! [`OutprocModule`] looks like any other module to the broker and forwards
//! everything to the remote host process:
//!
//! ```text
//! broker ──receive()──► outgoing queue ──sender──► message channel ──► host
//! broker ◄──publish()── receiver ◄──────────────── message channel ◄── host
//!                        creator/supervisor ◄─────► control channel
//! ```
//!
//! One handle owns two pair sockets, the outgoing queue and four worker
//! slots. The channels mutex guards the sockets and the queue and is held
//! only for snapshots and queue operations, never across I/O. Worker stop
//! flags are atomics and take part in no lock ordering.

mod handshake;
mod workers;

pub use handshake::HandshakeError;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::api::{Broker, BrokerModule, ModuleId};
use crate::config::{ConfigError, Lifecycle, ProxyConfig, Timing};
use crate::protocol::ControlFrame;
use crate::queue::OutgoingQueue;
use crate::slot::{lock_recovered, ThreadSlot};
use crate::transport::{IoMode, PairSocket, TransportError};

use handshake::run_create_handshake;

/// Why `create` failed. Creation failures release every resource acquired
/// up to the failing step before returning.
#[derive(Debug)]
pub enum CreateError {
    Config(ConfigError),
    Transport(TransportError),
    /// The creator thread could not be spawned.
    Spawn(io::Error),
    /// The create handshake ended without a session (sync mode only).
    Handshake(HandshakeError),
    /// The creator thread panicked (sync mode only).
    CreatorPanic,
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateError::Config(e) => write!(f, "invalid configuration: {}", e),
            CreateError::Transport(e) => write!(f, "connection setup failed: {}", e),
            CreateError::Spawn(e) => write!(f, "unable to spawn creator thread: {}", e),
            CreateError::Handshake(e) => write!(f, "{}", e),
            CreateError::CreatorPanic => write!(f, "creator thread panicked"),
        }
    }
}

impl std::error::Error for CreateError {}

impl From<ConfigError> for CreateError {
    fn from(e: ConfigError) -> Self {
        CreateError::Config(e)
    }
}

impl From<TransportError> for CreateError {
    fn from(e: TransportError) -> Self {
        CreateError::Transport(e)
    }
}

/// Socket and queue state guarded by the channels mutex.
pub(crate) struct Channels<M> {
    pub control: Option<Arc<PairSocket>>,
    pub message: Option<Arc<PairSocket>>,
    pub outgoing: OutgoingQueue<M>,
    /// Set once teardown has begun; late `receive` calls drop their clone.
    pub closed: bool,
}

/// State shared between the handle and its worker threads.
pub(crate) struct ProxyShared<B: Broker> {
    pub id: ModuleId,
    pub broker: Arc<B>,
    pub channels: Mutex<Channels<B::Msg>>,
    pub message_url: String,
    pub module_args: String,
    pub remote_wait: Duration,
    pub timing: Timing,
    pub started: AtomicBool,
    pub shutdown_done: AtomicBool,
    pub receiver: ThreadSlot,
    pub sender: ThreadSlot,
    pub supervisor: ThreadSlot,
    pub creator: ThreadSlot,
}

/// Module handle binding one remote module into the gateway.
pub struct OutprocModule<B: Broker> {
    shared: Arc<ProxyShared<B>>,
}

impl<B: Broker> OutprocModule<B> {
    /// Connect both channels and run the create handshake.
    ///
    /// In [`Lifecycle::Sync`] mode this waits for the remote module to
    /// confirm creation and fails if it does not. In [`Lifecycle::Async`]
    /// mode the handshake keeps running on the creator thread and the
    /// handle is returned immediately; a peer that never appears manifests
    /// later as dropped sends.
    pub fn create(broker: Arc<B>, config: &ProxyConfig) -> Result<Self, CreateError> {
        config.validate()?;

        let message = PairSocket::connect(&config.message_url)?;
        message.set_recv_timeout(Some(config.remote_wait));
        let control = PairSocket::connect(&config.control_url)?;

        let shared = Arc::new(ProxyShared {
            id: ModuleId::next(),
            broker,
            channels: Mutex::new(Channels {
                control: Some(Arc::new(control)),
                message: Some(Arc::new(message)),
                outgoing: OutgoingQueue::new(),
                closed: false,
            }),
            message_url: config.message_url.clone(),
            module_args: config.module_args.clone(),
            remote_wait: config.remote_wait,
            timing: config.timing.clone(),
            started: AtomicBool::new(false),
            shutdown_done: AtomicBool::new(false),
            receiver: ThreadSlot::new("outproc-recv"),
            sender: ThreadSlot::new("outproc-send"),
            supervisor: ThreadSlot::new("outproc-ctrl"),
            creator: ThreadSlot::new("outproc-create"),
        });

        // From here on, any failure path drops `module`, whose teardown
        // releases everything acquired above.
        let module = OutprocModule {
            shared: Arc::clone(&shared),
        };

        match config.lifecycle {
            Lifecycle::Sync => {
                let worker = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name("outproc-create".into())
                    .spawn(move || run_create_handshake(&worker, &worker.creator))
                    .map_err(CreateError::Spawn)?;
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        log::error!("[PROXY] {} create handshake failed: {}", shared.id, e);
                        return Err(CreateError::Handshake(e));
                    }
                    Err(_) => return Err(CreateError::CreatorPanic),
                }
            }
            Lifecycle::Async => {
                let worker = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name("outproc-create".into())
                    .spawn(move || match run_create_handshake(&worker, &worker.creator) {
                        Ok(()) => {
                            log::debug!("[PROXY] {} async create handshake complete", worker.id)
                        }
                        Err(HandshakeError::Stopped) => {}
                        Err(e) => {
                            log::warn!("[PROXY] {} async create handshake failed: {}", worker.id, e)
                        }
                    })
                    .map_err(CreateError::Spawn)?;
                shared.creator.install(handle);
            }
        }

        log::debug!("[PROXY] {} created ({:?})", shared.id, config.lifecycle);
        Ok(module)
    }

    /// Spawn the three worker threads and send the Start directive. A
    /// second call is a no-op: the workers must never be double-spawned.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            log::warn!("[PROXY] {} start called twice; ignoring", self.shared.id);
            return;
        }
        let shared = &self.shared;
        {
            let worker = Arc::clone(shared);
            workers::spawn_worker(&shared.receiver, move || workers::receiver_loop(worker));
        }
        {
            let worker = Arc::clone(shared);
            workers::spawn_worker(&shared.sender, move || workers::sender_loop(worker));
        }
        {
            let worker = Arc::clone(shared);
            workers::spawn_worker(&shared.supervisor, move || workers::supervisor_loop(worker));
        }
        workers::send_start(shared);
    }

    /// Queue a message for the remote module. The caller keeps ownership of
    /// `message`; the queued clone is dropped if teardown already began.
    pub fn receive(&self, message: &B::Msg) {
        let queued = message.clone();
        let mut channels = lock_recovered(&self.shared.channels, "channels");
        if channels.closed {
            log::debug!(
                "[PROXY] {} dropping message received after shutdown",
                self.shared.id
            );
            return;
        }
        channels.outgoing.push(queued);
    }

    /// Tear the binding down: best-effort Destroy notification, close both
    /// channels, stop and join every worker, drop queued messages.
    /// Idempotent; also run by `Drop`.
    pub fn shutdown(&self) {
        if self.shared.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = &self.shared;
        log::debug!("[PROXY] {} shutting down", shared.id);

        // The host process may already be gone, so telling it to destroy
        // its module is a bounded best-effort attempt.
        let control = {
            let channels = lock_recovered(&shared.channels, "channels");
            channels.control.clone()
        };
        if let Some(control) = control {
            match ControlFrame::ModuleDestroy.to_bytes() {
                Ok(buf) => {
                    let mut attempts = 0;
                    loop {
                        match control.send(&buf, IoMode::NonBlocking) {
                            Ok(_) => break,
                            Err(e) => {
                                attempts += 1;
                                if attempts > shared.timing.destroy_retries {
                                    log::error!(
                                        "[PROXY] unable to send destroy message ({}), continuing with teardown",
                                        e
                                    );
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    log::error!(
                        "[PROXY] unable to encode destroy message ({}), continuing with teardown",
                        e
                    );
                }
            }
        }

        // Closing the channels wakes any worker blocked in recv.
        {
            let mut channels = lock_recovered(&shared.channels, "channels");
            channels.closed = true;
            if let Some(socket) = channels.control.take() {
                socket.shutdown();
            }
            if let Some(socket) = channels.message.take() {
                socket.shutdown();
            }
        }

        for slot in [
            &shared.receiver,
            &shared.sender,
            &shared.supervisor,
            &shared.creator,
        ] {
            slot.request_stop();
            slot.join();
        }

        {
            let mut channels = lock_recovered(&shared.channels, "channels");
            let undelivered = channels.outgoing.len();
            channels.outgoing.clear();
            if undelivered > 0 {
                log::debug!(
                    "[PROXY] {} dropped {} undelivered message(s)",
                    shared.id,
                    undelivered
                );
            }
        }
    }

    /// Identity this proxy publishes under.
    pub fn id(&self) -> ModuleId {
        self.shared.id
    }
}

impl<B: Broker> Drop for OutprocModule<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<B: Broker> BrokerModule<B> for OutprocModule<B> {
    type Config = ProxyConfig;
    type CreateError = CreateError;

    fn create(broker: Arc<B>, config: &ProxyConfig) -> Result<Self, CreateError> {
        OutprocModule::create(broker, config)
    }

    fn start(&self) {
        OutprocModule::start(self);
    }

    fn receive(&self, message: &B::Msg) {
        OutprocModule::receive(self, message);
    }
}

impl<B: Broker> fmt::Debug for OutprocModule<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutprocModule({})", self.shared.id)
    }
}
