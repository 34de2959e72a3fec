// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The out-of-process half of the binding.
//!
//! [`ModuleHost`] runs inside the remote process. It binds the same two
//! endpoints in the reply role, waits for the proxy's control directives,
//! and drives the embedded [`HostedModule`]:
//!
//! - `ModuleCreate` → parse configuration, instantiate the module, reply
//!   with a status, open the message channel named in the frame.
//! - `ModuleStart` → `module.start()`.
//! - `ModuleDestroy` → drop the module, close the message channel, keep
//!   serving control until detached.
//!
//! Scheduling is caller-owned: [`do_work`](ModuleHost::do_work) services
//! one control poll and one data poll non-blockingly, and
//! [`start_worker_thread`](ModuleHost::start_worker_thread) wraps it in a
//! background loop for hosts that do not run their own.

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::api::{HostedModule, Message};
use crate::config::Timing;
use crate::protocol::{ControlFrame, GATEWAY_MESSAGE_VERSION, URI_KIND_PAIR};
use crate::slot::{lock_recovered, ThreadSlot};
use crate::transport::{IoMode, PairListener, PairSocket, TransportError};

/// Status reported to the gateway when the host detaches: any non-zero
/// status tells the proxy's supervisor the remote module is gone.
const STATUS_TERMINATED: i32 = 1;
/// Status reported when module creation fails.
const STATUS_CREATE_FAILED: i32 = 1;

/// Host-side API error.
#[derive(Debug)]
pub enum HostError {
    /// The connection id is empty, over-long or not an `ipc://` endpoint.
    InvalidEndpoint(String),
    /// Binding the control endpoint failed.
    Bind(TransportError),
    /// `start_worker_thread` while the worker is running.
    WorkerAlreadyRunning,
    /// `halt_worker_thread` without a running worker.
    WorkerNotRunning,
    /// The worker thread could not be spawned.
    Spawn(io::Error),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::InvalidEndpoint(reason) => write!(f, "invalid connection id: {}", reason),
            HostError::Bind(e) => write!(f, "unable to bind control endpoint: {}", e),
            HostError::WorkerAlreadyRunning => write!(f, "worker thread already running"),
            HostError::WorkerNotRunning => write!(f, "worker thread not running"),
            HostError::Spawn(e) => write!(f, "unable to spawn worker thread: {}", e),
        }
    }
}

impl std::error::Error for HostError {}

/// One bound endpoint plus its currently accepted peer connection.
struct Plane {
    listener: PairListener,
    conn: Option<Arc<PairSocket>>,
}

impl Plane {
    fn bound(listener: PairListener) -> Plane {
        Plane {
            listener,
            conn: None,
        }
    }

    /// Current connection, accepting a waiting peer if there is none.
    fn poll_conn(&mut self) -> Option<Arc<PairSocket>> {
        if self.conn.is_none() {
            match self.listener.accept() {
                Ok(conn) => self.conn = Some(Arc::new(conn)),
                Err(TransportError::WouldBlock) => {}
                Err(e) => log::error!(
                    "[HOST] accept on {} failed: {}",
                    self.listener.path().display(),
                    e
                ),
            }
        }
        self.conn.as_ref().map(Arc::clone)
    }

    fn clear_conn(&mut self) {
        self.conn = None;
    }
}

struct HostShared<M: HostedModule> {
    control: Mutex<Plane>,
    /// `None` until a Create directive names the message endpoint; shared
    /// with every [`HostOutput`] handed to the module.
    data: Arc<Mutex<Option<Plane>>>,
    module: Mutex<Option<M>>,
    /// Serializes `do_work` between the caller and the worker thread.
    work: Mutex<()>,
    worker: ThreadSlot,
    poll: Duration,
}

/// Outbound path handed to the hosted module: serialize and send one
/// message to the gateway. Cheap to clone; failures are logged and the
/// message is dropped, mirroring the proxy's data-send policy.
pub struct HostOutput<Msg: Message> {
    plane: Arc<Mutex<Option<Plane>>>,
    _marker: PhantomData<fn(&Msg)>,
}

impl<Msg: Message> Clone for HostOutput<Msg> {
    fn clone(&self) -> Self {
        HostOutput {
            plane: Arc::clone(&self.plane),
            _marker: PhantomData,
        }
    }
}

impl<Msg: Message> HostOutput<Msg> {
    /// Push one message to the gateway.
    pub fn send(&self, message: &Msg) {
        let conn = {
            let mut plane = lock_recovered(&self.plane, "data plane");
            plane.as_mut().and_then(Plane::poll_conn)
        };
        let Some(conn) = conn else {
            log::error!("[HOST] message channel not open; dropping outbound message");
            return;
        };
        match message.to_bytes() {
            Ok(buf) => {
                if let Err(e) = conn.send(&buf, IoMode::Blocking) {
                    log::error!("[HOST] unable to send message to gateway: {}", e);
                }
            }
            Err(e) => log::error!("[HOST] unable to serialize outbound message: {}", e),
        }
    }
}

/// Handle embedding one user module behind the wire protocol.
pub struct ModuleHost<M: HostedModule> {
    shared: Arc<HostShared<M>>,
}

impl<M: HostedModule> ModuleHost<M> {
    /// Bind the control endpoint in the reply role. The module contract
    /// itself (create / receive / destroy) is guaranteed by the
    /// [`HostedModule`] bound, so only the connection id needs validating.
    pub fn attach(control_endpoint: &str) -> Result<ModuleHost<M>, HostError> {
        let listener = PairListener::bind(control_endpoint).map_err(|e| match e {
            TransportError::Addr(reason) => HostError::InvalidEndpoint(reason),
            other => HostError::Bind(other),
        })?;
        log::debug!("[HOST] attached at {}", control_endpoint);
        Ok(ModuleHost {
            shared: Arc::new(HostShared {
                control: Mutex::new(Plane::bound(listener)),
                data: Arc::new(Mutex::new(None)),
                module: Mutex::new(None),
                work: Mutex::new(()),
                worker: ThreadSlot::new("outproc-host"),
                poll: Timing::from_env().data_poll,
            }),
        })
    }

    /// Service one control message and one data message, non-blockingly.
    pub fn do_work(&self) {
        self.shared.do_work();
    }

    /// Run [`do_work`](Self::do_work) on a background thread until
    /// [`halt_worker_thread`](Self::halt_worker_thread).
    pub fn start_worker_thread(&self) -> Result<(), HostError> {
        let shared = &self.shared;
        if shared.worker.is_running() {
            return Err(HostError::WorkerAlreadyRunning);
        }
        shared.worker.reset();
        let worker = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name("outproc-host".into())
            .spawn(move || {
                while !worker.worker.stop_requested() {
                    worker.do_work();
                    thread::sleep(worker.poll);
                }
            })
            .map_err(HostError::Spawn)?;
        shared.worker.install(handle);
        Ok(())
    }

    /// Stop and join the background worker.
    pub fn halt_worker_thread(&self) -> Result<(), HostError> {
        let shared = &self.shared;
        if !shared.worker.is_running() {
            return Err(HostError::WorkerNotRunning);
        }
        shared.worker.request_stop();
        shared.worker.join();
        Ok(())
    }

    /// Detach from the gateway: halt the worker, notify the gateway that
    /// the module is gone, drop the module and close both channels.
    pub fn detach(self) {
        let shared = &self.shared;
        shared.worker.request_stop();
        shared.worker.join();

        let conn = {
            let mut control = lock_recovered(&shared.control, "control plane");
            control.poll_conn()
        };
        if let Some(conn) = conn {
            send_reply(&conn, STATUS_TERMINATED);
        }

        let module = lock_recovered(&shared.module, "module").take();
        drop(module);
        *lock_recovered(&shared.data, "data plane") = None;
        log::debug!("[HOST] detached");
    }
}

impl<M: HostedModule> Drop for ModuleHost<M> {
    fn drop(&mut self) {
        self.shared.worker.request_stop();
        self.shared.worker.join();
    }
}

impl<M: HostedModule> fmt::Debug for ModuleHost<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleHost")
    }
}

impl<M: HostedModule> HostShared<M> {
    fn do_work(&self) {
        let _work = lock_recovered(&self.work, "work");
        self.poll_control();
        self.poll_data();
    }

    fn poll_control(&self) {
        let conn = {
            let mut control = lock_recovered(&self.control, "control plane");
            control.poll_conn()
        };
        let Some(conn) = conn else { return };

        match conn.recv(IoMode::NonBlocking) {
            Err(TransportError::WouldBlock) => {}
            Err(e) => {
                log::debug!("[HOST] control peer lost ({}), awaiting reconnect", e);
                lock_recovered(&self.control, "control plane").clear_conn();
            }
            Ok(bytes) => match ControlFrame::decode(&bytes) {
                Ok(frame) => self.dispatch_control(frame, &conn),
                Err(e) => log::debug!("[HOST] dropping undecodable control frame: {}", e),
            },
        }
    }

    fn dispatch_control(&self, frame: ControlFrame, conn: &Arc<PairSocket>) {
        match frame {
            ControlFrame::ModuleCreate {
                gateway_message_version,
                uri,
                uri_kind,
                args,
            } => {
                let status = self.handle_create(gateway_message_version, &uri, uri_kind, &args);
                send_reply(conn, status);
            }
            ControlFrame::ModuleStart => {
                let mut module = lock_recovered(&self.module, "module");
                match module.as_mut() {
                    Some(module) => module.start(),
                    None => log::debug!("[HOST] start directive before create; ignoring"),
                }
            }
            ControlFrame::ModuleDestroy => {
                log::debug!("[HOST] destroy directive; dropping module");
                let module = lock_recovered(&self.module, "module").take();
                drop(module);
                *lock_recovered(&self.data, "data plane") = None;
            }
            ControlFrame::ModuleReply { status } => {
                log::debug!("[HOST] ignoring unexpected reply (status {})", status);
            }
        }
    }

    /// Run the create directive, returning the status for the reply.
    fn handle_create(&self, gateway_message_version: u8, uri: &str, uri_kind: u8, args: &str) -> i32 {
        if gateway_message_version != GATEWAY_MESSAGE_VERSION {
            log::error!(
                "[HOST] gateway message version {} not supported (expected {})",
                gateway_message_version,
                GATEWAY_MESSAGE_VERSION
            );
            return STATUS_CREATE_FAILED;
        }
        if uri_kind != URI_KIND_PAIR {
            log::error!("[HOST] unsupported message uri kind {}", uri_kind);
            return STATUS_CREATE_FAILED;
        }
        if lock_recovered(&self.module, "module").is_some() {
            // A retried Create whose reply was lost; the module is up, so
            // confirm rather than wedge the session.
            log::debug!("[HOST] duplicate create directive; module already running");
            return 0;
        }

        let config = match M::parse_configuration(args) {
            Ok(config) => config,
            Err(e) => {
                log::error!("[HOST] module configuration rejected: {}", e);
                return STATUS_CREATE_FAILED;
            }
        };
        let output = HostOutput {
            plane: Arc::clone(&self.data),
            _marker: PhantomData,
        };
        let module = match M::create(config, output) {
            Ok(module) => module,
            Err(e) => {
                log::error!("[HOST] module create failed: {}", e);
                return STATUS_CREATE_FAILED;
            }
        };

        // The uri carried in the frame overrides whatever this host was
        // started with. Drop any previous plane before rebinding the path.
        *lock_recovered(&self.data, "data plane") = None;
        let listener = match PairListener::bind(uri) {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("[HOST] unable to open message channel at {}: {}", uri, e);
                return STATUS_CREATE_FAILED;
            }
        };
        *lock_recovered(&self.data, "data plane") = Some(Plane::bound(listener));
        *lock_recovered(&self.module, "module") = Some(module);
        log::debug!("[HOST] module created, message channel at {}", uri);
        0
    }

    fn poll_data(&self) {
        let conn = {
            let mut plane = lock_recovered(&self.data, "data plane");
            plane.as_mut().and_then(Plane::poll_conn)
        };
        let Some(conn) = conn else { return };

        match conn.recv(IoMode::NonBlocking) {
            Err(TransportError::WouldBlock) => {}
            Err(e) => {
                log::debug!("[HOST] message peer lost ({}), awaiting reconnect", e);
                if let Some(plane) = lock_recovered(&self.data, "data plane").as_mut() {
                    plane.clear_conn();
                }
            }
            Ok(bytes) => match <M::Msg as Message>::from_bytes(&bytes) {
                Ok(message) => {
                    let mut module = lock_recovered(&self.module, "module");
                    match module.as_mut() {
                        Some(module) => module.receive(message),
                        None => log::debug!("[HOST] dropping message received before create"),
                    }
                }
                Err(e) => log::debug!("[HOST] dropping undecodable gateway message: {}", e),
            },
        }
    }
}

/// Reply on the control channel, interrupt-safe, best-effort.
fn send_reply(conn: &Arc<PairSocket>, status: i32) {
    match (ControlFrame::ModuleReply { status }).to_bytes() {
        Ok(buf) => {
            if let Err(e) = conn.send(&buf, IoMode::Blocking) {
                log::error!("[HOST] unable to send reply (status {}): {}", status, e);
            }
        }
        Err(e) => log::error!("[HOST] unable to encode reply: {}", e),
    }
}
