//! Per-peer connection state machine.
//!
//! ```text
//! Connecting ──(transport ready)──► Ready ──(local stop)──► Closing ──► Closed
//!     │                               │
//!     └────────(transport error)──────┴──────────────────► Failed
//! ```
//!
//! Each connection runs in its own task. The [`ConnectionHandle`] kept by the
//! session manager only holds the send queue, the observable state and the
//! cancellation token; decoded frames and state changes travel back to the
//! manager as [`ConnectionEvent`]s.

use super::config::LinkSettings;
use super::error::LinkError;
use super::frame_codec::{encode, CodecError, Frame, FrameDecoder, FrameKind};
use statum::{machine, state};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 64 * 1024;
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Observable state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// Notifications from a connection task to its owner.
#[derive(Debug)]
pub enum ConnectionEvent {
    Ready { id: ConnectionId, peer: SocketAddr },
    Frame { id: ConnectionId, frame: Frame },
    Failed { id: ConnectionId, error: LinkError },
    Closed { id: ConnectionId },
}

impl ConnectionEvent {
    pub fn id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Ready { id, .. }
            | ConnectionEvent::Frame { id, .. }
            | ConnectionEvent::Failed { id, .. }
            | ConnectionEvent::Closed { id } => *id,
        }
    }
}

/// A frame waiting for its sequence number.
#[derive(Debug)]
struct Outbound {
    kind: FrameKind,
    payload: Vec<u8>,
}

/// Resolves `address` to candidate endpoints.
///
/// Accepts `ip`, `ip:port`, `[v6]:port`, `host` and `host:port`; a missing port
/// is filled with `default_port`.
pub async fn resolve_endpoint(address: &str, default_port: u16) -> Result<Vec<SocketAddr>, LinkError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(LinkError::Connect("empty address".into()));
    }
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(vec![addr]);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, default_port)]);
    }

    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| LinkError::Connect(format!("invalid port in '{}'", address)))?;
            (host, port)
        }
        _ => (address, default_port),
    };

    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| LinkError::Connect(format!("failed to resolve '{}': {}", host, e)))?
        .collect();
    if resolved.is_empty() {
        return Err(LinkError::Connect(format!("'{}' resolved to no address", host)));
    }
    Ok(resolved)
}

#[state]
#[derive(Debug, Clone)]
enum LinkPhase {
    Connecting,
    Ready,
    Closing,
    Closed,
    Failed,
}

#[machine]
struct ConnectionTask<S: LinkPhase> {
    id: ConnectionId,
    endpoint: String,
    stream: Option<TcpStream>,
    settings: LinkSettings,
    outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    decoder: FrameDecoder,
    next_tx_sequence: u32,
    next_rx_sequence: u32,
}

enum Established {
    Ready(ConnectionTask<Ready>),
    Cancelled(ConnectionTask<Closing>),
}

impl<S: LinkPhase> ConnectionTask<S> {
    fn publish(&self, state: ConnectionState) {
        debug!("{} -> {:?}", self.id, state);
        self.state_tx.send_replace(state);
    }

    /// Delivers an event, waiting for room in the owner's queue. Gives up once
    /// the connection is cancelled.
    async fn emit(&self, event: ConnectionEvent) {
        tokio::select! {
            biased;
            sent = self.events.send(event) => {
                if sent.is_err() {
                    debug!("{}: owner dropped the event channel", self.id);
                }
            }
            _ = self.cancel.cancelled() => {
                debug!("{}: cancelled, event not delivered", self.id);
            }
        }
    }
}

impl ConnectionTask<Connecting> {
    async fn establish(mut self) -> Result<Established, (ConnectionTask<Failed>, LinkError)> {
        if self.stream.is_none() {
            let dialed = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("{}: cancelled while connecting to {}", self.id, self.endpoint);
                    return Ok(Established::Cancelled(self.transition()));
                }
                dialed = dial(&self.endpoint, self.settings.port, self.settings.connect_timeout()) => dialed,
            };
            match dialed {
                Ok(stream) => self.stream = Some(stream),
                Err(e) => return Err((self.transition(), e)),
            }
        }

        let peer = match self.stream.as_ref().map(TcpStream::peer_addr) {
            Some(Ok(peer)) => peer,
            Some(Err(e)) => return Err((self.transition(), LinkError::Transport(e.to_string()))),
            None => {
                return Err((
                    self.transition(),
                    LinkError::Transport("no stream after connect".into()),
                ))
            }
        };
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("{}: failed to disable Nagle: {}", self.id, e);
            }
        }

        info!("{}: connection ready with {}", self.id, peer);
        self.publish(ConnectionState::Ready);
        self.emit(ConnectionEvent::Ready { id: self.id, peer }).await;
        Ok(Established::Ready(self.transition()))
    }
}

impl ConnectionTask<Ready> {
    /// Receive loop. Returns once the owner cancels or the transport fails.
    async fn run(mut self) -> Result<ConnectionTask<Closing>, (ConnectionTask<Failed>, LinkError)> {
        let Some(mut stream) = self.stream.take() else {
            return Err((self.transition(), LinkError::Transport("stream missing".into())));
        };

        let mut heartbeat = self.settings.heartbeat_interval().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let peer_timeout = self.settings.peer_timeout();
        let mut last_heard = Instant::now();
        let mut buf = vec![0u8; READ_CHUNK];

        let outcome: Result<(), LinkError> = {
            let (mut reader, mut writer) = stream.split();
            loop {
                let deadline = peer_timeout.map(|t| last_heard + t);
                tokio::select! {
                    _ = self.cancel.cancelled() => break Ok(()),
                    read = reader.read(&mut buf) => {
                        let n = match read {
                            Ok(0) => break Err(LinkError::Transport("peer closed the connection".into())),
                            Ok(n) => n,
                            Err(e) => break Err(LinkError::Transport(e.to_string())),
                        };
                        last_heard = Instant::now();
                        self.decoder.extend(&buf[..n]);
                        if let Err(e) = self.drain_frames().await {
                            break Err(e);
                        }
                        if self.cancel.is_cancelled() {
                            break Ok(());
                        }
                    }
                    queued = self.outbound.recv() => {
                        // The handle owns the sender; None means it was dropped.
                        let Some(queued) = queued else { break Ok(()) };
                        let frame = Frame::new(self.take_tx_sequence(), queued.kind, queued.payload);
                        let bytes = match encode(&frame) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!("{}: dropping unencodable frame: {}", self.id, e);
                                continue;
                            }
                        };
                        tokio::select! {
                            _ = self.cancel.cancelled() => break Ok(()),
                            written = writer.write_all(&bytes) => {
                                if let Err(e) = written {
                                    break Err(LinkError::Transport(e.to_string()));
                                }
                            }
                        }
                    }
                    _ = tick(&mut heartbeat) => {
                        let bytes = match encode(&Frame::heartbeat(self.take_tx_sequence())) {
                            Ok(bytes) => bytes,
                            Err(e) => break Err(e.into()),
                        };
                        tokio::select! {
                            _ = self.cancel.cancelled() => break Ok(()),
                            written = writer.write_all(&bytes) => {
                                if let Err(e) = written {
                                    break Err(LinkError::Transport(e.to_string()));
                                }
                            }
                        }
                    }
                    _ = sleep_until(deadline) => {
                        break Err(LinkError::Transport("peer timed out".into()));
                    }
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.stream = Some(stream);
                Ok(self.transition())
            }
            Err(e) => Err((self.transition(), e)),
        }
    }

    fn take_tx_sequence(&mut self) -> u32 {
        let sequence = self.next_tx_sequence;
        self.next_tx_sequence = self.next_tx_sequence.wrapping_add(1);
        sequence
    }

    async fn drain_frames(&mut self) -> Result<(), LinkError> {
        while let Some(frame) = self.decoder.next_frame()? {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if frame.sequence != self.next_rx_sequence {
                return Err(CodecError::OutOfSequence {
                    expected: self.next_rx_sequence,
                    got: frame.sequence,
                }
                .into());
            }
            self.next_rx_sequence = self.next_rx_sequence.wrapping_add(1);

            if frame.kind == FrameKind::Heartbeat {
                continue;
            }
            debug!(
                "{}: received {} frame #{} ({} bytes)",
                self.id,
                frame.kind,
                frame.sequence,
                frame.payload.len()
            );
            self.emit(ConnectionEvent::Frame { id: self.id, frame }).await;
        }
        Ok(())
    }
}

impl ConnectionTask<Closing> {
    async fn close(mut self) -> ConnectionTask<Closed> {
        self.publish(ConnectionState::Closing);
        if let Some(mut stream) = self.stream.take() {
            match tokio::time::timeout(CLOSE_GRACE, stream.shutdown()).await {
                Ok(Ok(())) => debug!("{}: write side shut down", self.id),
                Ok(Err(e)) => debug!("{}: shutdown failed: {}", self.id, e),
                Err(_) => debug!("{}: shutdown timed out", self.id),
            }
        }
        self.transition()
    }
}

impl ConnectionTask<Closed> {
    async fn finish(self) {
        info!("{}: closed", self.id);
        self.publish(ConnectionState::Closed);
        self.emit(ConnectionEvent::Closed { id: self.id }).await;
    }
}

impl ConnectionTask<Failed> {
    async fn finish(mut self, error: LinkError) {
        warn!("{}: failed: {}", self.id, error);
        self.stream = None;
        self.publish(ConnectionState::Failed);
        self.emit(ConnectionEvent::Failed { id: self.id, error }).await;
    }
}

async fn drive(task: ConnectionTask<Connecting>) {
    let closing = match task.establish().await {
        Ok(Established::Ready(ready)) => match ready.run().await {
            Ok(closing) => closing,
            Err((failed, error)) => return failed.finish(error).await,
        },
        Ok(Established::Cancelled(closing)) => closing,
        Err((failed, error)) => return failed.finish(error).await,
    };
    closing.close().await.finish().await;
}

async fn dial(address: &str, default_port: u16, timeout: Duration) -> Result<TcpStream, LinkError> {
    let candidates = resolve_endpoint(address, default_port).await?;
    let mut last_error = None;
    for candidate in candidates {
        debug!("Connecting to {}", candidate);
        match tokio::time::timeout(timeout, TcpStream::connect(candidate)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_error = Some(format!("{}: {}", candidate, e)),
            Err(_) => last_error = Some(format!("{}: timed out", candidate)),
        }
    }
    Err(LinkError::Connect(
        last_error.unwrap_or_else(|| format!("no endpoint for '{}'", address)),
    ))
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Owner-side view of one connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    direction: Direction,
    endpoint: String,
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    /// Wraps an accepted inbound stream.
    pub fn accept(
        id: ConnectionId,
        stream: TcpStream,
        settings: &LinkSettings,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        let endpoint = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".into());
        Self::spawn(id, Direction::Inbound, endpoint, Some(stream), settings, events)
    }

    /// Starts dialing `address`; the handle reports Ready once connected.
    pub fn connect(
        id: ConnectionId,
        address: &str,
        settings: &LinkSettings,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        Self::spawn(id, Direction::Outbound, address.to_string(), None, settings, events)
    }

    fn spawn(
        id: ConnectionId,
        direction: Direction,
        endpoint: String,
        stream: Option<TcpStream>,
        settings: &LinkSettings,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.send_queue_len.max(1));
        let cancel = CancellationToken::new();

        let task = ConnectionTask::<Connecting>::new(
            id,
            endpoint.clone(),
            stream,
            settings.clone(),
            outbound_rx,
            events,
            state_tx,
            cancel.clone(),
            FrameDecoder::new(),
            0, // next_tx_sequence
            0, // next_rx_sequence
        );
        debug!("{}: spawning {:?} connection to {}", id, direction, endpoint);
        let task = tokio::spawn(drive(task));

        Self {
            id,
            direction,
            endpoint,
            state,
            outbound: outbound_tx,
            cancel,
            task: Some(task),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Queues a frame. The sequence number is assigned when it is written.
    pub fn enqueue(&self, kind: FrameKind, payload: Vec<u8>) -> Result<(), LinkError> {
        self.outbound
            .try_send(Outbound { kind, payload })
            .map_err(|e| LinkError::Transport(format!("{}: send queue: {}", self.id, e)))
    }

    /// Requests a local stop: Ready → Closing → Closed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels and waits for the task to release its socket.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("{}: connection task ended abnormally: {}", self.id, e);
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn quiet_settings() -> LinkSettings {
        LinkSettings {
            heartbeat_interval_ms: 0,
            peer_timeout_ms: 0,
            advertise: false,
            ..LinkSettings::default()
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn resolves_addresses_with_and_without_port() {
        let with_port = resolve_endpoint("127.0.0.1:9000", 8888).await.unwrap();
        assert_eq!(with_port, vec!["127.0.0.1:9000".parse().unwrap()]);

        let bare = resolve_endpoint("127.0.0.1", 8888).await.unwrap();
        assert_eq!(bare, vec!["127.0.0.1:8888".parse().unwrap()]);

        let v6 = resolve_endpoint("::1", 8888).await.unwrap();
        assert_eq!(v6, vec!["[::1]:8888".parse().unwrap()]);

        let host = resolve_endpoint("localhost:7000", 8888).await.unwrap();
        assert!(host.iter().all(|addr| addr.port() == 7000));

        assert!(matches!(
            resolve_endpoint("localhost:notaport", 8888).await,
            Err(LinkError::Connect(_))
        ));
        assert!(matches!(
            resolve_endpoint("  ", 8888).await,
            Err(LinkError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn frames_flow_both_ways_with_sequences() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let settings = quiet_settings();

        let outbound = ConnectionHandle::connect(
            ConnectionId(1),
            &addr.to_string(),
            &settings,
            events_tx.clone(),
        );
        let (stream, _) = listener.accept().await.unwrap();
        let inbound = ConnectionHandle::accept(ConnectionId(2), stream, &settings, events_tx);

        let mut ready = Vec::new();
        while ready.len() < 2 {
            if let ConnectionEvent::Ready { id, .. } = next_event(&mut events_rx).await {
                ready.push(id);
            }
        }
        assert!(outbound.is_ready());
        assert!(inbound.is_ready());

        outbound.enqueue(FrameKind::InputDelta, vec![1]).unwrap();
        outbound.enqueue(FrameKind::Control, vec![2, 3]).unwrap();

        let mut received = Vec::new();
        while received.len() < 2 {
            if let ConnectionEvent::Frame { id, frame } = next_event(&mut events_rx).await {
                assert_eq!(id, ConnectionId(2));
                received.push(frame);
            }
        }
        assert_eq!(received[0], Frame::new(0, FrameKind::InputDelta, vec![1]));
        assert_eq!(received[1], Frame::new(1, FrameKind::Control, vec![2, 3]));

        outbound.close().await;
        inbound.close().await;
    }

    #[tokio::test]
    async fn local_stop_closes_and_peer_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let settings = quiet_settings();

        let outbound =
            ConnectionHandle::connect(ConnectionId(1), &addr.to_string(), &settings, events_tx.clone());
        let (stream, _) = listener.accept().await.unwrap();
        let inbound = ConnectionHandle::accept(ConnectionId(2), stream, &settings, events_tx);

        let mut ready = 0;
        while ready < 2 {
            if matches!(next_event(&mut events_rx).await, ConnectionEvent::Ready { .. }) {
                ready += 1;
            }
        }

        let mut outbound_state = outbound.subscribe();
        outbound.cancel();
        let mut saw_closed = false;
        let mut saw_failed = false;
        while !(saw_closed && saw_failed) {
            match next_event(&mut events_rx).await {
                ConnectionEvent::Closed { id } => {
                    assert_eq!(id, ConnectionId(1));
                    saw_closed = true;
                }
                ConnectionEvent::Failed { id, error } => {
                    assert_eq!(id, ConnectionId(2));
                    assert!(error.is_connection_local());
                    saw_failed = true;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        outbound_state
            .wait_for(|s| *s == ConnectionState::Closed)
            .await
            .unwrap();
        assert_eq!(inbound.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn corrupt_frame_fails_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(64);

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let handle = ConnectionHandle::accept(ConnectionId(7), stream, &quiet_settings(), events_tx);

        let mut bytes = encode(&Frame::new(0, FrameKind::InputDelta, vec![9, 9, 9])).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xff;
        raw.write_all(&bytes).await.unwrap();

        loop {
            match next_event(&mut events_rx).await {
                ConnectionEvent::Ready { .. } => continue,
                ConnectionEvent::Failed { id, error } => {
                    assert_eq!(id, ConnectionId(7));
                    assert!(matches!(
                        error,
                        LinkError::Decode(CodecError::ChecksumMismatch { .. })
                    ));
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(handle.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn sequence_gap_fails_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(64);

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let _handle = ConnectionHandle::accept(ConnectionId(3), stream, &quiet_settings(), events_tx);

        raw.write_all(&encode(&Frame::new(5, FrameKind::Control, vec![])).unwrap())
            .await
            .unwrap();

        loop {
            match next_event(&mut events_rx).await {
                ConnectionEvent::Ready { .. } => continue,
                ConnectionEvent::Failed { error, .. } => {
                    assert!(matches!(
                        error,
                        LinkError::Decode(CodecError::OutOfSequence { expected: 0, got: 5 })
                    ));
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let settings = LinkSettings {
            heartbeat_interval_ms: 0,
            peer_timeout_ms: 100,
            ..LinkSettings::default()
        };

        let _raw = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let _handle = ConnectionHandle::accept(ConnectionId(4), stream, &settings, events_tx);

        loop {
            match next_event(&mut events_rx).await {
                ConnectionEvent::Ready { .. } => continue,
                ConnectionEvent::Failed { error, .. } => {
                    assert!(error.to_string().contains("timed out"));
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn refused_dial_fails() {
        // Grab a free port, then close the listener so nothing accepts on it.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let handle = ConnectionHandle::connect(
            ConnectionId(9),
            &format!("127.0.0.1:{}", port),
            &quiet_settings(),
            events_tx,
        );
        match next_event(&mut events_rx).await {
            ConnectionEvent::Failed { id, error } => {
                assert_eq!(id, ConnectionId(9));
                assert!(matches!(error, LinkError::Connect(_)));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(handle.state(), ConnectionState::Failed);
    }
}
