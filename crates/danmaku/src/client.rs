//! Async driver for a live room.
//!
//! [`LiveClient`] owns one session task per entered room. The task fetches the
//! socket credentials, opens the socket, and then runs a single `select!` loop over
//! socket reads, the heartbeat ticker and cancellation. Every state change goes
//! through [`Lifecycle`]; the task only carries out the effects it returns.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::api::LiveRoomApi;
use crate::compression::Unpacker;
use crate::config::LiveConfig;
use crate::error::{DanmakuError, Result};
use crate::event::{FailureReason, RoomChatEvent, RoomSnapshot, RoomStatus};
use crate::lifecycle::{ConnectionState, Effect, Lifecycle, LifecycleEvent};
use crate::message::{ChatCommand, decode_command};
use crate::packet::{self, Operation, ProtocolVersion};
use crate::transport::{Connector, Socket, WsConnector};

/// Callback receiving every decoded command.
pub type ChatHandler = Arc<dyn Fn(RoomChatEvent) + Send + Sync>;

const QUEUE_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Serialize)]
struct Handshake<'a> {
    uid: u64,
    roomid: u64,
    protover: u8,
    buvid: String,
    support_ack: bool,
    queue_uuid: String,
    scene: &'a str,
    platform: &'a str,
    #[serde(rename = "type")]
    kind: u8,
    key: &'a str,
}

/// Random client id shaped like a browser `buvid3`.
fn random_buvid() -> String {
    let u = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    let suffix: u32 = rand::rng().random_range(0..100_000);
    format!(
        "{}-{}-{}-{}-{}{suffix}infoc",
        &u[0..8],
        &u[8..12],
        &u[12..16],
        &u[16..20],
        &u[20..32]
    )
}

fn random_queue_id() -> String {
    let mut rng = rand::rng();
    (0..9)
        .map(|_| QUEUE_ID_CHARSET[rng.random_range(0..QUEUE_ID_CHARSET.len())] as char)
        .collect()
}

/// Build the handshake frame. Always sent with protocol tag 1.
pub fn handshake_frame(uid: u64, room_id: u64, token: &str) -> Result<Bytes> {
    let body = serde_json::to_vec(&Handshake {
        uid,
        roomid: room_id,
        protover: 3,
        buvid: random_buvid(),
        support_ack: true,
        queue_uuid: random_queue_id(),
        scene: "room",
        platform: "web",
        kind: 2,
        key: token,
    })?;
    Ok(packet::encode(
        Operation::Handshake,
        &body,
        ProtocolVersion::Raw,
    ))
}

/// Result code carried by a handshake reply. An empty or non-JSON body counts as success.
fn handshake_code(body: &[u8]) -> i64 {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("code").and_then(Value::as_i64))
        .unwrap_or(0)
}

/// Viewer count carried by a heartbeat reply.
fn online_count(body: &[u8]) -> Option<u32> {
    body.get(..4).map(BigEndian::read_u32)
}

struct ActiveSession {
    room_id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveSession {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            error!(room_id = self.room_id, "Session task panicked");
        }
    }
}

struct Inner<C> {
    config: LiveConfig,
    api: Arc<dyn LiveRoomApi>,
    connector: C,
    handler: ChatHandler,
    lifecycle: Mutex<Lifecycle>,
    online: AtomicU32,
    status_tx: broadcast::Sender<RoomStatus>,
    shutdown: CancellationToken,
    /// Serializes enter/leave
    active: tokio::sync::Mutex<Option<ActiveSession>>,
}

/// The effects of one transition, gathered for whoever carries them out.
///
/// Notifications are published while gathering. The session task executes the
/// rest; for `Leave` and `Dispose` the teardown is cancelling that task.
#[derive(Debug, Default)]
struct Actions {
    /// Generation of the session to open a socket for
    connect: Option<u64>,
    send_handshake: bool,
    start_heartbeat: bool,
    stop_heartbeat: bool,
    teardown: bool,
    reconnect: Option<Duration>,
    failure: Option<FailureReason>,
}

impl<C> Inner<C> {
    /// Run one transition and publish its notifications.
    fn transition(&self, event: LifecycleEvent) -> Result<Actions> {
        let effects = self.lifecycle.lock().handle(event)?;
        let mut actions = Actions::default();
        for effect in effects {
            match effect {
                Effect::Connect {
                    generation,
                    attempt,
                } => {
                    debug!(generation, attempt, "Connect requested");
                    actions.connect = Some(generation);
                }
                Effect::SendHandshake { .. } => actions.send_handshake = true,
                Effect::StartHeartbeat { .. } => actions.start_heartbeat = true,
                Effect::StopHeartbeat => actions.stop_heartbeat = true,
                Effect::Teardown => actions.teardown = true,
                Effect::ScheduleReconnect { attempt, delay, .. } => {
                    trace!(attempt, ?delay, "Reconnect scheduled");
                    actions.reconnect = Some(delay);
                }
                Effect::Notify(status) => {
                    if let RoomStatus::Failed { reason, .. } = &status {
                        actions.failure = Some(*reason);
                    }
                    // No subscribers is fine.
                    let _ = self.status_tx.send(status);
                }
            }
        }
        Ok(actions)
    }

    fn on(&self, event: LifecycleEvent) -> Actions {
        self.transition(event).unwrap_or_else(|e| {
            warn!(error = %e, "Lifecycle rejected event");
            Actions::default()
        })
    }
}

/// Client for one live room at a time.
///
/// `enter_room` and `leave_room` are serialized internally. `dispose` can be called
/// from anywhere, including outside the runtime, and stops any pending reconnect.
pub struct LiveClient<C: Connector = WsConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for LiveClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl LiveClient<WsConnector> {
    pub fn new<F>(api: Arc<dyn LiveRoomApi>, config: LiveConfig, handler: F) -> Self
    where
        F: Fn(RoomChatEvent) + Send + Sync + 'static,
    {
        Self::with_connector(api, WsConnector, config, handler)
    }
}

impl<C: Connector> LiveClient<C> {
    pub fn with_connector<F>(
        api: Arc<dyn LiveRoomApi>,
        connector: C,
        config: LiveConfig,
        handler: F,
    ) -> Self
    where
        F: Fn(RoomChatEvent) + Send + Sync + 'static,
    {
        let (status_tx, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                lifecycle: Mutex::new(Lifecycle::new(config.reconnect)),
                config,
                api,
                connector,
                handler: Arc::new(handler),
                online: AtomicU32::new(0),
                status_tx,
                shutdown: CancellationToken::new(),
                active: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Enter `room_id` and wait until the handshake is accepted.
    ///
    /// Leaves the current room first if it is a different one. Entering the room that
    /// is already active returns immediately. A socket that drops before the handshake
    /// reply is retried under the reconnect policy, and this call keeps waiting; an
    /// unreachable server or an unanswered handshake on the first attempt fails it.
    pub async fn enter_room(&self, room_id: u64) -> Result<()> {
        let ready = {
            let mut active = self.inner.active.lock().await;
            {
                let lifecycle = self.inner.lifecycle.lock();
                if lifecycle.session().disposed {
                    return Err(DanmakuError::Disposed);
                }
                if lifecycle.is_active_in(room_id) {
                    debug!(room_id, "Already in room");
                    return Ok(());
                }
            }

            if let Some(previous) = active.take() {
                self.inner.on(LifecycleEvent::Leave);
                previous.stop().await;
            }

            let actions = self.inner.transition(LifecycleEvent::Enter { room_id })?;
            let Some(generation) = actions.connect else {
                return Ok(());
            };
            self.inner.online.store(0, Ordering::Relaxed);

            let cancel = self.inner.shutdown.child_token();
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = SessionTask {
                inner: Arc::clone(&self.inner),
                room_id,
                generation,
                cancel: cancel.clone(),
                ready: Some(ready_tx),
                unpacker: Unpacker::new(),
                heartbeat: None,
                live: false,
            };
            *active = Some(ActiveSession {
                room_id,
                cancel,
                task: tokio::spawn(task.run()),
            });
            ready_rx
        };

        match ready.await {
            Ok(result) => result,
            Err(_) if self.inner.lifecycle.lock().session().disposed => Err(DanmakuError::Disposed),
            Err(_) => Err(DanmakuError::connection(format!(
                "Room {room_id} was left before it went live"
            ))),
        }
    }

    /// Leave the current room. The room id is cleared before the socket is torn down.
    pub async fn leave_room(&self) {
        self.inner.on(LifecycleEvent::Leave);
        self.inner.online.store(0, Ordering::Relaxed);

        let previous = self.inner.active.lock().await.take();
        if let Some(session) = previous {
            session.stop().await;
        }
    }

    /// Stop everything for good. Idempotent; later `enter_room` calls fail.
    pub fn dispose(&self) {
        self.inner.on(LifecycleEvent::Dispose);
        self.inner.shutdown.cancel();
    }

    pub fn current_room_id(&self) -> Option<u64> {
        self.inner.lifecycle.lock().current_room_id()
    }

    pub fn is_live(&self) -> bool {
        self.inner.lifecycle.lock().is_live()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.lock().state()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lifecycle.lock().session().reconnect_attempts
    }

    /// Last viewer count reported by a heartbeat reply.
    pub fn online_count(&self) -> u32 {
        self.inner.online.load(Ordering::Relaxed)
    }

    /// Connection status notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomStatus> {
        self.inner.status_tx.subscribe()
    }
}

/// Where and how to connect, resolved once per session.
struct Target {
    url: String,
    token: String,
    /// Real room id; the entered id may be a short alias
    room_id: u64,
    snapshot: RoomSnapshot,
}

struct SessionTask<C> {
    inner: Arc<Inner<C>>,
    room_id: u64,
    generation: u64,
    cancel: CancellationToken,
    /// Resolves the `enter_room` call that started this session
    ready: Option<oneshot::Sender<Result<()>>>,
    unpacker: Unpacker,
    heartbeat: Option<Interval>,
    live: bool,
}

impl<C: Connector> SessionTask<C> {
    async fn run(mut self) {
        let prepared = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            prepared = self.prepare() => prepared,
        };
        let target = match prepared {
            Ok(target) => target,
            Err(e) => {
                warn!(room_id = self.room_id, error = %e, "Failed to resolve chat server");
                let actions = self.inner.on(LifecycleEvent::ConnectFailed {
                    generation: self.generation,
                    reason: e.to_string(),
                });
                self.finish(&actions, e);
                return;
            }
        };

        loop {
            let Some(actions) = self.connect_once(&target).await else {
                return;
            };
            let Some(delay) = actions.reconnect else {
                return;
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let actions = self.inner.on(LifecycleEvent::ReconnectDue {
                generation: self.generation,
            });
            if actions.connect.is_none() {
                debug!(room_id = self.room_id, "Reconnect no longer wanted");
                return;
            }
        }
    }

    async fn prepare(&self) -> Result<Target> {
        let api = &self.inner.api;
        let info = api.room_info(self.room_id).await?;
        let room_id = if info.room_id == 0 {
            self.room_id
        } else {
            info.room_id
        };

        if let Err(e) = api.report_entry(room_id).await {
            debug!(room_id, error = %e, "Room entry report failed");
        }

        let danmu = api.danmu_info(room_id).await?;
        let url = danmu.server_url()?;
        info!(room_id, url = %url, title = %info.title, "Resolved chat server");
        Ok(Target {
            url,
            token: danmu.token,
            room_id,
            snapshot: RoomSnapshot::from(&info),
        })
    }

    /// One socket, from open to close.
    ///
    /// Returns the actions of the event that ended it, or `None` when the session
    /// was cancelled or superseded.
    async fn connect_once(&mut self, target: &Target) -> Option<Actions> {
        self.live = false;
        self.heartbeat = None;
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            connected = self.inner.connector.connect(&target.url) => connected,
        };
        let mut socket = match connected {
            Ok(socket) => socket,
            Err(e) => {
                warn!(room_id = self.room_id, error = %e, "Connection failed");
                let actions = self.inner.on(LifecycleEvent::ConnectFailed {
                    generation: self.generation,
                    reason: e.to_string(),
                });
                self.finish(&actions, e);
                return Some(actions);
            }
        };

        let actions = self.inner.on(LifecycleEvent::Opened {
            generation: self.generation,
        });
        if !actions.send_handshake {
            socket.close().await;
            return None;
        }

        let sent = match handshake_frame(self.inner.api.uid(), target.room_id, &target.token) {
            Ok(frame) => socket.send(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            return Some(self.end(&mut socket, e).await);
        }
        debug!(room_id = self.room_id, "Handshake sent");

        let deadline = tokio::time::sleep(self.inner.config.handshake_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.heartbeat = None;
                    socket.close().await;
                    return None;
                }
                _ = &mut deadline, if !self.live => {
                    warn!(room_id = self.room_id, "No handshake reply in time");
                    return Some(self.end(&mut socket, DanmakuError::HandshakeTimeout).await);
                }
                _ = next_tick(&mut self.heartbeat) => {
                    if let Err(e) = self.send_heartbeat(&mut socket, target).await {
                        return Some(self.end(&mut socket, e).await);
                    }
                }
                message = socket.recv() => match message {
                    Some(Ok(data)) => {
                        let actions = self.on_message(data, target);
                        self.apply_heartbeat(&actions);
                        if actions.teardown {
                            socket.close().await;
                            return Some(actions);
                        }
                    }
                    Some(Err(e)) => return Some(self.end(&mut socket, e).await),
                    None => {
                        let closed = DanmakuError::TransportClosed("closed by server".to_string());
                        return Some(self.end(&mut socket, closed).await);
                    }
                },
            }
        }
    }

    /// Report a lost connection and carry out what the lifecycle decides.
    async fn end(&mut self, socket: &mut C::Socket, error: DanmakuError) -> Actions {
        debug!(room_id = self.room_id, error = %error, "Connection ended");
        let event = match error {
            DanmakuError::HandshakeTimeout => LifecycleEvent::HandshakeTimedOut {
                generation: self.generation,
            },
            _ => LifecycleEvent::Closed {
                generation: self.generation,
                reason: error.to_string(),
            },
        };
        let actions = self.inner.on(event);
        self.apply_heartbeat(&actions);
        if actions.teardown {
            socket.close().await;
        }
        self.finish(&actions, error);
        actions
    }

    /// Fail the waiting `enter_room` unless another attempt is coming.
    fn finish(&mut self, actions: &Actions, error: DanmakuError) {
        if actions.reconnect.is_some() {
            return;
        }
        let error = match actions.failure {
            Some(FailureReason::ReconnectExhausted { attempts }) => {
                DanmakuError::ReconnectExhausted { attempts }
            }
            _ => error,
        };
        self.settle(Err(error));
    }

    fn apply_heartbeat(&mut self, actions: &Actions) {
        if actions.stop_heartbeat {
            self.heartbeat = None;
        }
        if actions.start_heartbeat {
            self.heartbeat = Some(self.heartbeat_interval());
        }
    }

    fn on_message(&mut self, data: Bytes, target: &Target) -> Actions {
        let mut actions = Actions::default();
        for packet in self.unpacker.unpack(data) {
            match packet.header.operation {
                Operation::HandshakeReply => {
                    let code = handshake_code(&packet.body);
                    if code != 0 {
                        let rejected = self.inner.on(LifecycleEvent::HandshakeRejected {
                            generation: self.generation,
                            code,
                        });
                        self.settle(Err(DanmakuError::AuthRejected { code }));
                        return rejected;
                    }
                    let accepted = self.inner.on(LifecycleEvent::HandshakeAccepted {
                        generation: self.generation,
                    });
                    if accepted.start_heartbeat {
                        self.live = true;
                        self.settle(Ok(()));
                        actions.start_heartbeat = true;
                    }
                }
                Operation::HeartbeatReply => {
                    if let Some(count) = online_count(&packet.body) {
                        trace!(room_id = self.room_id, online = count, "Heartbeat reply");
                        self.inner.online.store(count, Ordering::Relaxed);
                    }
                }
                op if op.carries_commands() => {
                    if !self.live {
                        trace!(room_id = self.room_id, "Dropping command received before auth");
                        continue;
                    }
                    match decode_command(&packet.body) {
                        Ok(command) => self.deliver(command, target),
                        Err(e) => warn!(room_id = self.room_id, error = %e, "Skipping message"),
                    }
                }
                other => trace!(?other, "Ignoring frame"),
            }
        }
        actions
    }

    fn deliver(&self, command: ChatCommand, target: &Target) {
        let event = RoomChatEvent {
            room_id: self.room_id,
            room: target.snapshot.clone(),
            command,
            received_at: Utc::now(),
        };
        let handler = &self.inner.handler;
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            error!(room_id = self.room_id, "Chat handler panicked");
        }
    }

    async fn send_heartbeat(&self, socket: &mut C::Socket, target: &Target) -> Result<()> {
        socket
            .send(packet::encode(
                Operation::Heartbeat,
                &[],
                ProtocolVersion::Raw,
            ))
            .await?;
        trace!(room_id = self.room_id, "Sent heartbeat");

        // Never awaited by the socket loop; dies with the session.
        let api = Arc::clone(&self.inner.api);
        let cancel = self.cancel.clone();
        let room_id = target.room_id;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = api.heartbeat(room_id) => {
                    if let Err(e) = result {
                        debug!(room_id, error = %e, "Web heartbeat failed");
                    }
                }
            }
        });
        Ok(())
    }

    fn heartbeat_interval(&self) -> Interval {
        let period = self.inner.config.heartbeat_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }

    fn settle(&mut self, result: Result<()>) {
        if let Some(ready) = self.ready.take() {
            // The caller may have given up waiting.
            let _ = ready.send(result);
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
