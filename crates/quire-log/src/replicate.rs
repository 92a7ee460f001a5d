use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use quire_types::DiscoveryKey;

use crate::error::{LogError, LogResult};
use crate::feed::Feed;
use crate::protocol::{read_frame, write_frame, FeedMessage, Frame, PROTOCOL_VERSION};

/// Replication session settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolOptions {
    /// Number of feeds both peers intend to replicate over this stream.
    pub expected_feeds: u32,
    /// Maximum outstanding block requests per feed.
    pub max_requests: usize,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            expected_feeds: 1,
            max_requests: 16,
        }
    }
}

/// State of a replication stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Open,
    /// Closed cleanly (`None`) or with an error message.
    Closed(Option<String>),
}

impl Status {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// A live replication stream multiplexing any number of feeds over one
/// byte transport.
///
/// Each side announces the feeds it adds; once both sides opened a feed
/// they exchange block infos and availability, then request missing blocks
/// the local feed wants. Replication stays live: appends and newly stored
/// blocks are announced as they happen, until either side closes.
#[derive(Clone)]
pub struct Replication {
    shared: Arc<Shared>,
}

struct Shared {
    options: ProtocolOptions,
    outgoing: mpsc::UnboundedSender<Frame>,
    state: Mutex<StreamState>,
    status: watch::Sender<Status>,
}

#[derive(Default)]
struct StreamState {
    remote_handshake: bool,
    remote_opens: u32,
    sessions: HashMap<DiscoveryKey, Session>,
}

#[derive(Default)]
struct Session {
    feed: Option<Feed>,
    remote_open: bool,
    /// Runs of blocks the peer holds, as last announced.
    remote_available: Vec<(u64, u64)>,
    inflight: HashSet<u64>,
    announced: bool,
    announced_len: u64,
    announced_available: Vec<(u64, u64)>,
}

impl Session {
    fn remote_has(&self, index: u64) -> bool {
        self.remote_available
            .iter()
            .any(|&(start, end)| start <= index && index < end)
    }
}

impl Replication {
    /// Start replicating over `transport`. Spawns the reader and writer
    /// tasks, so it must be called from within a Tokio runtime.
    pub fn new<T>(transport: T, options: ProtocolOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(transport);
        let (outgoing, queue) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(Status::Open);
        let shared = Arc::new(Shared {
            options,
            outgoing,
            state: Mutex::new(StreamState::default()),
            status,
        });

        shared.send(Frame::Handshake {
            version: PROTOCOL_VERSION,
            expected_feeds: shared.options.expected_feeds,
        });
        tokio::spawn(write_loop(writer, queue, shared.status.subscribe()));
        tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        debug!(expected_feeds = shared.options.expected_feeds, "replication started");
        Self { shared }
    }

    pub fn options(&self) -> &ProtocolOptions {
        &self.shared.options
    }

    /// Start replicating `feed` on this stream. Adding the same feed twice
    /// is a no-op.
    pub fn add_feed(&self, feed: &Feed) -> LogResult<()> {
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        let key = feed.discovery_key();
        {
            let mut state = self.shared.lock();
            let session = state.sessions.entry(key).or_default();
            if session.feed.is_some() {
                return Ok(());
            }
            session.feed = Some(feed.clone());
            self.shared.send(Frame::Feed {
                key,
                message: FeedMessage::Open,
            });
            if session.remote_open {
                self.shared.announce(key, session);
            }
            self.shared.schedule(key, session);
        }
        info!(feed = %feed.key().short_id(), "replicating feed");

        let changes = feed.subscribe();
        tokio::spawn(watch_feed(Arc::clone(&self.shared), key, changes));
        Ok(())
    }

    /// Current status of the stream.
    pub fn status(&self) -> Status {
        self.shared.status.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.status.borrow().is_closed()
    }

    /// Close the stream cleanly. Queued frames are still flushed.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Tear the stream down with an error.
    pub fn destroy(&self, reason: impl Into<String>) {
        self.shared.fail(reason.into());
    }

    /// Wait for the stream to close. Resolves to the error it was destroyed
    /// with, if any.
    pub async fn finished(&self) -> LogResult<()> {
        let mut status = self.shared.status.subscribe();
        closed(&mut status).await;
        let outcome = status.borrow().clone();
        match outcome {
            Status::Closed(Some(reason)) => Err(LogError::Replication(reason)),
            _ => Ok(()),
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().expect("replication lock poisoned")
    }

    fn send(&self, frame: Frame) {
        trace!(frame = frame.type_name(), "send");
        if self.outgoing.send(frame).is_err() {
            trace!("writer gone; dropping frame");
        }
    }

    fn close(&self) {
        let changed = self.status.send_if_modified(|status| {
            if status.is_closed() {
                return false;
            }
            *status = Status::Closed(None);
            true
        });
        if changed {
            info!("replication closed");
        }
    }

    fn fail(&self, reason: String) {
        let changed = self.status.send_if_modified(|status| {
            if status.is_closed() {
                return false;
            }
            *status = Status::Closed(Some(reason.clone()));
            true
        });
        if changed {
            warn!(%reason, "replication failed");
        }
    }

    fn handle(&self, frame: Frame) -> LogResult<()> {
        trace!(frame = frame.type_name(), "recv");
        let mut state = self.lock();
        match frame {
            Frame::Handshake {
                version,
                expected_feeds,
            } => {
                if state.remote_handshake {
                    return Err(LogError::Protocol("duplicate handshake".into()));
                }
                if version != PROTOCOL_VERSION {
                    return Err(LogError::Protocol(format!(
                        "protocol version {version}, expected {PROTOCOL_VERSION}"
                    )));
                }
                if expected_feeds != self.options.expected_feeds {
                    return Err(LogError::Protocol(format!(
                        "peer expects {expected_feeds} feeds, we expect {}",
                        self.options.expected_feeds
                    )));
                }
                state.remote_handshake = true;
                Ok(())
            }
            Frame::Feed { key, message } => {
                if !state.remote_handshake {
                    return Err(LogError::Protocol("feed message before handshake".into()));
                }
                self.handle_feed(&mut state, key, message)
            }
        }
    }

    fn handle_feed(
        &self,
        state: &mut StreamState,
        key: DiscoveryKey,
        message: FeedMessage,
    ) -> LogResult<()> {
        if let FeedMessage::Open = message {
            let already = state
                .sessions
                .get(&key)
                .is_some_and(|session| session.remote_open);
            if already {
                return Ok(());
            }
            state.remote_opens += 1;
            if state.remote_opens > self.options.expected_feeds {
                return Err(LogError::Protocol(format!(
                    "peer opened more than {} feeds",
                    self.options.expected_feeds
                )));
            }
            let session = state.sessions.entry(key).or_default();
            session.remote_open = true;
            debug!(key = %key.short_id(), "peer opened feed");
            if session.feed.is_some() {
                self.announce(key, session);
            }
            return Ok(());
        }

        let session = state
            .sessions
            .get_mut(&key)
            .filter(|session| session.remote_open && session.feed.is_some())
            .ok_or_else(|| {
                LogError::Protocol(format!("message for unopened feed {}", key.short_id()))
            })?;
        let Some(feed) = session.feed.clone() else {
            return Ok(());
        };

        match message {
            FeedMessage::Open => {}
            FeedMessage::Have {
                from,
                infos,
                available,
            } => {
                feed.learn(from, &infos)?;
                session.remote_available = available;
                self.schedule(key, session);
            }
            FeedMessage::Request { index } => match feed.get_local(index)? {
                Some(data) => self.send(Frame::Feed {
                    key,
                    message: FeedMessage::Data {
                        index,
                        data: data.to_vec(),
                    },
                }),
                None => debug!(key = %key.short_id(), index, "peer requested a block we lack"),
            },
            FeedMessage::Data { index, data } => {
                session.inflight.remove(&index);
                if feed.put(index, &data)? {
                    trace!(key = %key.short_id(), index, "block received");
                }
                self.schedule(key, session);
            }
        }
        Ok(())
    }

    /// Tell the peer about infos and blocks it has not heard of yet.
    fn announce(&self, key: DiscoveryKey, session: &mut Session) {
        let Some(feed) = session.feed.as_ref() else {
            return;
        };
        let infos = feed.infos_from(session.announced_len);
        let available = feed.present_ranges();
        if session.announced && infos.is_empty() && available == session.announced_available {
            return;
        }
        let from = session.announced_len;
        session.announced = true;
        session.announced_len += infos.len() as u64;
        session.announced_available = available.clone();
        self.send(Frame::Feed {
            key,
            message: FeedMessage::Have {
                from,
                infos,
                available,
            },
        });
    }

    /// Request wanted blocks the peer holds, up to the in-flight limit.
    fn schedule(&self, key: DiscoveryKey, session: &mut Session) {
        let Some(feed) = session.feed.as_ref() else {
            return;
        };
        if !session.remote_open {
            return;
        }
        let capacity = self.options.max_requests.saturating_sub(session.inflight.len());
        if capacity == 0 {
            return;
        }
        let wanted = feed.wanted_blocks(capacity, |index| {
            !session.inflight.contains(&index) && session.remote_has(index)
        });
        for index in wanted {
            session.inflight.insert(index);
            self.send(Frame::Feed {
                key,
                message: FeedMessage::Request { index },
            });
        }
    }

    /// React to a change of a local feed: appends, stored blocks, or
    /// changed download wants.
    fn feed_changed(&self, key: DiscoveryKey) {
        let mut state = self.lock();
        if let Some(session) = state.sessions.get_mut(&key) {
            if session.remote_open {
                self.announce(key, session);
                self.schedule(key, session);
            }
        }
    }
}

/// Wait until `status` reports the stream closed.
async fn closed(status: &mut watch::Receiver<Status>) {
    loop {
        if status.borrow_and_update().is_closed() {
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Frame>,
    mut status: watch::Receiver<Status>,
) where
    W: AsyncWrite + Unpin,
{
    let written = loop {
        tokio::select! {
            biased;
            frame = queue.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!(error = %e, "replication write failed");
                        break false;
                    }
                }
                None => break true,
            },
            _ = closed(&mut status) => break true,
        }
    };

    let drain = written && matches!(*status.borrow(), Status::Closed(None));
    if drain {
        while let Ok(frame) = queue.try_recv() {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut status = shared.status.subscribe();
    let outcome = loop {
        tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = shared.handle(frame) {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
            _ = closed(&mut status) => return,
        }
    };
    match outcome {
        Ok(()) => shared.close(),
        Err(e) => shared.fail(e.to_string()),
    }
}

async fn watch_feed(shared: Arc<Shared>, key: DiscoveryKey, mut changes: watch::Receiver<u64>) {
    let mut status = shared.status.subscribe();
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
                shared.feed_changed(key);
            }
            _ = closed(&mut status) => return,
        }
    }
}

impl fmt::Debug for Replication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Replication")
            .field("status", &*self.shared.status.borrow())
            .field("feeds", &state.sessions.len())
            .finish()
    }
}
