//! Link session ownership: hosting, joining, fan-out send and teardown.
//!
//! The session manager is a single actor task. The application talks to it
//! through a cloneable [`LinkSessionHandle`]; accepted streams, connection
//! events and reconnect timers arrive over internal channels, so the
//! connection registry is only ever touched by the actor.
//!
//! ```text
//!            start_hosting            stop
//!   Idle ────────────────► Hosting ─────────► Idle
//!     │      join_host (Ready)          stop
//!     └──────────────────────► Joined ─────────► Idle
//!                                │  redials used up
//!                                └──────────────► Idle
//! ```

use super::config::LinkSettings;
use super::connection::{ConnectionEvent, ConnectionHandle, ConnectionId};
use super::discovery::{Advertiser, ServiceAnnouncement};
use super::error::LinkError;
use super::frame_codec::{CodecError, Frame, FrameKind, MAX_PAYLOAD_LEN};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionRole {
    #[default]
    Idle,
    Hosting,
    Joined,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Idle => write!(f, "idle"),
            SessionRole::Hosting => write!(f, "hosting"),
            SessionRole::Joined => write!(f, "joined"),
        }
    }
}

/// Read-only snapshot published on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub role: SessionRole,
    /// Connections in the Ready state.
    pub peers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    RoleChanged(SessionRole),
    PeerReady { peer: ConnectionId, address: SocketAddr },
    FrameReceived { peer: ConnectionId, frame: Frame },
    PeerFailed { peer: ConnectionId, reason: String },
    PeerClosed { peer: ConnectionId },
    /// The joined connection dropped; redial number `attempt` starts after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
}

enum Command {
    StartHosting {
        response_tx: oneshot::Sender<Result<SocketAddr, LinkError>>,
    },
    JoinHost {
        address: String,
        response_tx: oneshot::Sender<Result<(), LinkError>>,
    },
    SendData {
        payload: Vec<u8>,
        response_tx: oneshot::Sender<Result<usize, LinkError>>,
    },
    Stop {
        response_tx: oneshot::Sender<()>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::StartHosting { .. } => "start_hosting",
            Command::JoinHost { .. } => "join_host",
            Command::SendData { .. } => "send_data",
            Command::Stop { .. } => "stop",
        }
    }
}

struct HostingState {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    listener_task: JoinHandle<()>,
    _advertiser: Option<Advertiser>,
}

struct PendingJoin {
    id: ConnectionId,
    response_tx: oneshot::Sender<Result<(), LinkError>>,
}

/// Where a joined session redials after losing its connection.
struct JoinTarget {
    address: String,
    connection: ConnectionId,
    attempt: u32,
}

struct LinkSessionManager {
    settings: LinkSettings,
    role: SessionRole,
    registry: HashMap<ConnectionId, ConnectionHandle>,
    next_id: u64,
    hosting: Option<HostingState>,
    pending_join: Option<PendingJoin>,
    join: Option<JoinTarget>,
    redial_timer: Option<JoinHandle<()>>,
    /// Bumped on stop so stale redial ticks are ignored.
    generation: u64,
    events_tx: mpsc::Sender<LinkEvent>,
    /// Events the application has not made room for yet. While this holds
    /// `event_queue_len` entries no connection events are read, which stalls
    /// the connection tasks and, through them, the sockets.
    backlog: VecDeque<LinkEvent>,
    status_tx: watch::Sender<LinkStatus>,
    connection_tx: mpsc::Sender<ConnectionEvent>,
    accepted_tx: mpsc::Sender<TcpStream>,
    redial_tx: mpsc::Sender<u64>,
}

impl LinkSessionManager {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut connection_rx: mpsc::Receiver<ConnectionEvent>,
        mut accepted_rx: mpsc::Receiver<TcpStream>,
        mut redial_rx: mpsc::Receiver<u64>,
    ) {
        info!("Link session manager started");
        let backlog_limit = self.settings.event_queue_len.max(1);
        let events_tx = self.events_tx.clone();
        loop {
            let backlog_full = self.backlog.len() >= backlog_limit;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All session handles dropped");
                        break;
                    }
                },
                permit = events_tx.reserve(), if !self.backlog.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(event) = self.backlog.pop_front() {
                            permit.send(event);
                        }
                        self.flush_backlog();
                    }
                    Err(_) => {
                        debug!("Event receiver dropped, discarding {} event(s)", self.backlog.len());
                        self.backlog.clear();
                    }
                },
                Some(event) = connection_rx.recv(), if !backlog_full => self.handle_connection_event(event),
                Some(stream) = accepted_rx.recv() => self.register_inbound(stream),
                Some(generation) = redial_rx.recv() => self.redial(generation),
            }
        }
        self.teardown().await;
        while let Some(event) = self.backlog.pop_front() {
            if self.events_tx.send(event).await.is_err() {
                break;
            }
        }
        info!("Link session manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        debug!("Session command: {}", command.name());
        match command {
            Command::StartHosting { response_tx } => {
                let result = self.start_hosting().await;
                let _ = response_tx.send(result);
            }
            Command::JoinHost {
                address,
                response_tx,
            } => self.join_host(address, response_tx),
            Command::SendData {
                payload,
                response_tx,
            } => {
                let _ = response_tx.send(self.send_data(payload));
            }
            Command::Stop { response_tx } => {
                self.teardown().await;
                let _ = response_tx.send(());
            }
        }
    }

    async fn start_hosting(&mut self) -> Result<SocketAddr, LinkError> {
        if let Some(hosting) = &self.hosting {
            debug!("Already hosting on {}", hosting.local_addr);
            return Ok(hosting.local_addr);
        }
        if self.role != SessionRole::Idle || self.pending_join.is_some() {
            return Err(LinkError::invalid_state("start_hosting", self.role));
        }

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.settings.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| LinkError::Listener(format!("bind {}: {}", bind_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| LinkError::Listener(e.to_string()))?;

        let advertiser = if self.settings.advertise {
            let announcement = ServiceAnnouncement::link_service(local_addr.port());
            let advertiser = Advertiser::broadcast(&announcement, self.settings.discovery_port)
                .await
                .map_err(|e| LinkError::Listener(format!("advertise: {}", e)))?;
            Some(advertiser)
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let listener_task = tokio::spawn(accept_loop(
            listener,
            self.accepted_tx.clone(),
            cancel.clone(),
        ));
        self.hosting = Some(HostingState {
            local_addr,
            cancel,
            listener_task,
            _advertiser: advertiser,
        });

        info!("Hosting link session on {}", local_addr);
        self.set_role(SessionRole::Hosting);
        Ok(local_addr)
    }

    fn join_host(&mut self, address: String, response_tx: oneshot::Sender<Result<(), LinkError>>) {
        if self.role != SessionRole::Idle || self.pending_join.is_some() {
            let _ = response_tx.send(Err(LinkError::invalid_state("join_host", self.role)));
            return;
        }

        info!("Joining link session at {}", address);
        let id = self.dial(&address);
        self.pending_join = Some(PendingJoin { id, response_tx });
        self.join = Some(JoinTarget {
            address,
            connection: id,
            attempt: 0,
        });
    }

    fn send_data(&mut self, payload: Vec<u8>) -> Result<usize, LinkError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            }
            .into());
        }

        let mut queued = 0;
        for handle in self.registry.values().filter(|h| h.is_ready()) {
            match handle.enqueue(FrameKind::InputDelta, payload.clone()) {
                Ok(()) => queued += 1,
                Err(e) => warn!("Skipping {}: {}", handle.id(), e),
            }
        }
        debug!("Queued {} byte payload on {} connection(s)", payload.len(), queued);
        Ok(queued)
    }

    /// Stops everything. Safe to call in any role, any number of times.
    async fn teardown(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.redial_timer.take() {
            timer.abort();
        }
        self.join = None;

        if let Some(pending) = self.pending_join.take() {
            let _ = pending
                .response_tx
                .send(Err(LinkError::Connect("join cancelled by stop".into())));
        }

        if let Some(hosting) = self.hosting.take() {
            hosting.cancel.cancel();
            if let Err(e) = hosting.listener_task.await {
                warn!("Listener task ended abnormally: {}", e);
            }
            info!("Stopped hosting on {}", hosting.local_addr);
        }

        let handles: Vec<ConnectionHandle> = self.registry.drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            info!("Closing {} connection(s)", handles.len());
        }
        for handle in handles {
            handle.close().await;
        }

        self.set_role(SessionRole::Idle);
    }

    fn register_inbound(&mut self, stream: TcpStream) {
        if self.role != SessionRole::Hosting {
            debug!("Dropping connection accepted after hosting stopped");
            return;
        }
        let id = self.allocate_id();
        let handle = ConnectionHandle::accept(id, stream, &self.settings, self.connection_tx.clone());
        info!("Accepted {} from {}", id, handle.endpoint());
        self.registry.insert(id, handle);
    }

    fn dial(&mut self, address: &str) -> ConnectionId {
        let id = self.allocate_id();
        let handle = ConnectionHandle::connect(id, address, &self.settings, self.connection_tx.clone());
        self.registry.insert(id, handle);
        id
    }

    fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        if !self.registry.contains_key(&event.id()) {
            debug!("Ignoring event from evicted {}", event.id());
            return;
        }

        match event {
            ConnectionEvent::Ready { id, peer } => {
                if self.pending_join.as_ref().is_some_and(|p| p.id == id) {
                    if let Some(pending) = self.pending_join.take() {
                        let _ = pending.response_tx.send(Ok(()));
                    }
                    self.set_role(SessionRole::Joined);
                }
                if let Some(join) = self.join.as_mut().filter(|j| j.connection == id) {
                    join.attempt = 0;
                }
                self.emit(LinkEvent::PeerReady { peer: id, address: peer });
                self.publish_status();
            }
            ConnectionEvent::Frame { id, frame } => {
                self.emit(LinkEvent::FrameReceived { peer: id, frame });
            }
            ConnectionEvent::Failed { id, error } => {
                self.registry.remove(&id);
                let reason = error.to_string();

                if self.pending_join.as_ref().is_some_and(|p| p.id == id) {
                    warn!("Join failed: {}", reason);
                    self.join = None;
                    if let Some(pending) = self.pending_join.take() {
                        let _ = pending.response_tx.send(Err(error));
                    }
                    return;
                }

                error!("{} failed: {}", id, reason);
                self.emit(LinkEvent::PeerFailed { peer: id, reason });
                self.publish_status();

                if self.join.as_ref().is_some_and(|j| j.connection == id) {
                    self.schedule_redial();
                }
            }
            ConnectionEvent::Closed { id } => {
                self.registry.remove(&id);
                self.emit(LinkEvent::PeerClosed { peer: id });
                self.publish_status();
            }
        }
    }

    fn schedule_redial(&mut self) {
        let Some(join) = self.join.as_mut() else {
            return;
        };
        let attempt = join.attempt;
        match self.settings.reconnect.delay_for(attempt) {
            Some(delay) => {
                join.attempt += 1;
                info!(
                    "Redialing {} in {:?} (attempt {})",
                    join.address,
                    delay,
                    attempt + 1
                );
                let redial_tx = self.redial_tx.clone();
                let generation = self.generation;
                self.redial_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = redial_tx.send(generation).await;
                }));
                self.emit(LinkEvent::Reconnecting {
                    attempt: attempt + 1,
                    delay,
                });
            }
            None => {
                warn!("Giving up on {} after {} redial(s)", join.address, attempt);
                self.join = None;
                self.set_role(SessionRole::Idle);
            }
        }
    }

    fn redial(&mut self, generation: u64) {
        if generation != self.generation || self.role != SessionRole::Joined {
            debug!("Ignoring stale redial");
            return;
        }
        let Some(address) = self.join.as_ref().map(|j| j.address.clone()) else {
            return;
        };
        self.redial_timer = None;
        let id = self.dial(&address);
        if let Some(join) = self.join.as_mut() {
            join.connection = id;
        }
    }

    fn set_role(&mut self, role: SessionRole) {
        if self.role != role {
            info!("Session role: {} -> {}", self.role, role);
            self.role = role;
            self.emit(LinkEvent::RoleChanged(role));
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = LinkStatus {
            role: self.role,
            peers: self.registry.values().filter(|h| h.is_ready()).count(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Queues an event behind any backlog. Nothing is dropped while the
    /// application still holds the receiver.
    fn emit(&mut self, event: LinkEvent) {
        self.backlog.push_back(event);
        self.flush_backlog();
    }

    fn flush_backlog(&mut self) {
        while let Some(event) = self.backlog.pop_front() {
            match self.events_tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.backlog.clear();
                    break;
                }
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    accepted_tx: mpsc::Sender<TcpStream>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Incoming connection from {}", peer);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = accepted_tx.send(stream) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
    debug!("Listener stopped");
}

/// Cloneable front end of the session manager.
#[derive(Clone)]
pub struct LinkSessionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<LinkStatus>,
}

impl LinkSessionHandle {
    /// Spawns the manager task. Returns the handle and the event stream.
    pub fn spawn(settings: LinkSettings) -> (Self, mpsc::Receiver<LinkEvent>) {
        let queue_len = settings.event_queue_len.max(1);
        let (command_tx, command_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::channel(queue_len);
        let (connection_tx, connection_rx) = mpsc::channel(queue_len);
        let (accepted_tx, accepted_rx) = mpsc::channel(16);
        let (redial_tx, redial_rx) = mpsc::channel(4);
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());

        let manager = LinkSessionManager {
            settings,
            role: SessionRole::Idle,
            registry: HashMap::new(),
            next_id: 1,
            hosting: None,
            pending_join: None,
            join: None,
            redial_timer: None,
            generation: 0,
            events_tx,
            backlog: VecDeque::new(),
            status_tx,
            connection_tx,
            accepted_tx,
            redial_tx,
        };
        tokio::spawn(manager.run(command_rx, connection_rx, accepted_rx, redial_rx));

        (
            Self {
                commands: command_tx,
                status: status_rx,
            },
            events_rx,
        )
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LinkError> {
        let (response_tx, response_rx) = oneshot::channel();
        let command = build(response_tx);
        let name = command.name();
        self.commands
            .send(command)
            .await
            .map_err(|_| LinkError::ChannelClosed(format!("{}: manager gone", name)))?;
        response_rx
            .await
            .map_err(|_| LinkError::ChannelClosed(format!("{}: no response", name)))
    }

    /// Listens on the configured port and advertises the session.
    /// Returns the bound address. A no-op while already hosting.
    pub async fn start_hosting(&self) -> Result<SocketAddr, LinkError> {
        self.request(|response_tx| Command::StartHosting { response_tx })
            .await?
    }

    /// Connects to `address` and completes once the connection is Ready.
    pub async fn join_host(&self, address: &str) -> Result<(), LinkError> {
        let address = address.to_string();
        self.request(|response_tx| Command::JoinHost {
            address,
            response_tx,
        })
        .await?
    }

    /// Queues `payload` as an input-delta frame on every Ready connection.
    pub async fn send_data(&self, payload: Vec<u8>) -> Result<usize, LinkError> {
        self.request(|response_tx| Command::SendData {
            payload,
            response_tx,
        })
        .await?
    }

    pub async fn stop(&self) -> Result<(), LinkError> {
        self.request(|response_tx| Command::Stop { response_tx })
            .await
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }
}
