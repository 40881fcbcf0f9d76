//! Messaging Channel - full-duplex request/response over one connection.
//!
//! Each channel runs exactly two tasks:
//!
//! - **outbound**: drains the send queue and writes one JSON line per envelope
//! - **inbound**: reads lines, resolves responses and answers requests
//!
//! Callers never block: [`send_async`](MessagingChannel::send_async) registers
//! the pending call, pushes onto an unbounded queue and returns.
//!
//! # Dispatch
//!
//! ```text
//! response_expected = true                  → request: process, reply with same id
//! response_expected = false, id pending     → response: run the registered handler once
//! response_expected = false, id = 0         → notification: process, no reply
//! response_expected = false, id unknown     → stray response: logged, dropped
//! ```
//!
//! Replies always carry `response_expected = false`, so a response is never
//! itself answered.
//!
//! # Failure
//!
//! Losing the connection (EOF, IO error, undecodable line) closes the channel
//! for good: pending calls are abandoned without running their handlers and
//! later sends fail with [`Error::TransportFailure`]. There is no reconnection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::address::NodeAddress;
use crate::error::{Error, Result};
use crate::message::{CorrelationId, Envelope, Message, NOTIFICATION_ID};

/// Callback run with the response to a request.
pub type ResponseHandler = Box<dyn FnOnce(Message) + Send + 'static>;

/// Owner-side processing of inbound requests and notifications.
///
/// Runs on the channel's inbound task; it must return promptly and hand any
/// slow work to a spawned task.
pub trait MessageHandler: Send + Sync + 'static {
    fn process_incoming(&self, channel: &MessagingChannel, message: Message) -> Message;
}

/// Adapts a closure into a [`MessageHandler`].
pub struct HandlerFn<F>(pub F);

impl<F> MessageHandler for HandlerFn<F>
where
    F: Fn(&MessagingChannel, Message) -> Message + Send + Sync + 'static,
{
    fn process_incoming(&self, channel: &MessagingChannel, message: Message) -> Message {
        (self.0)(channel, message)
    }
}

/// Wrap a closure as a shared handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&MessagingChannel, Message) -> Message + Send + Sync + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Table of calls awaiting a response.
///
/// Once abandoned it refuses new registrations, so nothing can be registered
/// on a channel that will never deliver the response.
#[derive(Default)]
struct PendingCalls {
    inner: Mutex<PendingInner>,
}

#[derive(Default)]
struct PendingInner {
    calls: HashMap<CorrelationId, Option<ResponseHandler>>,
    abandoned: bool,
}

impl PendingCalls {
    fn register(&self, id: CorrelationId, handler: Option<ResponseHandler>) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.abandoned {
            return false;
        }
        inner.calls.insert(id, handler);
        true
    }

    /// Remove the entry for `id`; `None` when no such call is pending.
    fn take(&self, id: CorrelationId) -> Option<Option<ResponseHandler>> {
        self.inner.lock().ok()?.calls.remove(&id)
    }

    /// Drop every pending handler without running it.
    fn abandon(&self) -> usize {
        let dropped: Vec<_> = match self.inner.lock() {
            Ok(mut inner) => {
                inner.abandoned = true;
                inner.calls.drain().collect()
            }
            Err(_) => Vec::new(),
        };
        // Handlers are dropped outside the lock.
        dropped.len()
    }

    fn len(&self) -> usize {
        self.inner.lock().map(|i| i.calls.len()).unwrap_or(0)
    }
}

struct Shared {
    peer: String,
    next_id: AtomicU64,
    pending: PendingCalls,
    outbound: mpsc::UnboundedSender<Envelope>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn close(&self, reason: &str) {
        let already = self.shutdown.send_replace(true);
        let abandoned = self.pending.abandon();
        if !already {
            debug!(peer = %self.peer, reason, abandoned, "Channel closed");
        }
    }
}

/// Handle to a full-duplex channel. Cheap to clone; all clones share the
/// same connection, pending-call table and tasks.
#[derive(Clone)]
pub struct MessagingChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MessagingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingChannel")
            .field("peer", &self.shared.peer)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_calls())
            .finish()
    }
}

impl MessagingChannel {
    /// Start the inbound and outbound tasks over `stream`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn establish<S>(stream: S, peer: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let channel = Self {
            shared: Arc::new(Shared {
                peer: peer.into(),
                // 0 is reserved for notifications.
                next_id: AtomicU64::new(NOTIFICATION_ID + 1),
                pending: PendingCalls::default(),
                outbound: outbound_tx,
                shutdown: shutdown_tx,
            }),
        };

        let shutdown = channel.shared.shutdown.subscribe();
        tokio::spawn(run_outbound(writer, outbound_rx, shutdown, Arc::clone(&channel.shared)));

        let shutdown = channel.shared.shutdown.subscribe();
        tokio::spawn(run_inbound(reader, channel.clone(), handler, shutdown));

        debug!(peer = %channel.shared.peer, "Channel established");
        channel
    }

    /// Establish over an accepted or connected TCP stream.
    pub fn from_tcp(stream: TcpStream, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        let peer = stream
            .peer_addr()
            .map_err(|e| Error::TransportFailure(format!("peer address unavailable: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!(%peer, error = %e, "Could not set TCP_NODELAY");
        }
        Ok(Self::establish(stream, peer.to_string(), handler))
    }

    /// Connect to `address` and establish a channel.
    pub async fn connect(address: &NodeAddress, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|e| Error::TransportFailure(format!("connect to {address}: {e}")))?;
        Self::from_tcp(stream, handler)
    }

    /// Send a request without waiting.
    ///
    /// The pending call is registered before the envelope is queued, so a
    /// response can never overtake its own registration. `handler` runs at
    /// most once, on the inbound task; with `None` the response is consumed
    /// and discarded.
    pub fn send_async(&self, message: Message, handler: Option<ResponseHandler>) -> Result<CorrelationId> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        if !self.shared.pending.register(id, handler) {
            return Err(self.closed_error());
        }

        trace!(peer = %self.shared.peer, id, kind = %message.kind(), "Sending request");

        if self.shared.outbound.send(Envelope::request(id, message)).is_err() {
            self.shared.pending.take(id);
            return Err(self.closed_error());
        }

        Ok(id)
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, message: Message) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.send_async(
            message,
            Some(Box::new(move |response| {
                let _ = tx.send(response);
            })),
        )?;
        rx.await.map_err(|_| {
            Error::TransportFailure(format!(
                "channel to {} closed before the response arrived",
                self.shared.peer
            ))
        })
    }

    /// Send a one-way message. The receiver processes it and sends nothing back.
    pub fn notify(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        trace!(peer = %self.shared.peer, kind = %message.kind(), "Sending notification");
        self.shared
            .outbound
            .send(Envelope::notification(message))
            .map_err(|_| self.closed_error())
    }

    /// Close the channel. Queued envelopes are flushed; pending calls are abandoned.
    pub fn close(&self) {
        self.shared.close("closed locally");
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Resolves once the channel is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.shared.shutdown.subscribe();
        cancelled(&mut rx).await;
    }

    /// Remote endpoint, as seen on the connection.
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Number of requests still awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    fn closed_error(&self) -> Error {
        Error::TransportFailure(format!("channel to {} is closed", self.shared.peer))
    }

    fn respond(&self, id: CorrelationId, response: Message) {
        if self.shared.outbound.send(Envelope::response(id, response)).is_err() {
            debug!(peer = %self.shared.peer, id, "Response dropped, channel closing");
        }
    }

    fn dispatch(&self, handler: &dyn MessageHandler, envelope: Envelope) {
        let Envelope {
            id,
            response_expected,
            payload,
        } = envelope;

        if response_expected {
            trace!(peer = %self.shared.peer, id, kind = %payload.kind(), "Request received");
            let response = handler.process_incoming(self, payload);
            self.respond(id, response);
            return;
        }

        if id == NOTIFICATION_ID {
            trace!(peer = %self.shared.peer, kind = %payload.kind(), "Notification received");
            let reply = handler.process_incoming(self, payload);
            trace!(peer = %self.shared.peer, kind = %reply.kind(), "Notification reply discarded");
            return;
        }

        match self.shared.pending.take(id) {
            Some(Some(callback)) => callback(payload),
            Some(None) => trace!(peer = %self.shared.peer, id, "Response consumed without handler"),
            None => warn!(
                peer = %self.shared.peer,
                id,
                kind = %payload.kind(),
                "Dropping response for unknown call"
            ),
        }
    }
}

/// Resolves when the shutdown flag is (or becomes) set, or its sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = envelope.encode()?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| Error::TransportFailure(e.to_string()))
}

async fn run_outbound<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    let reason = loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(envelope) = next else {
                    break "send queue closed";
                };
                if let Err(e) = write_envelope(&mut writer, &envelope).await {
                    warn!(peer = %shared.peer, error = %e, "Write failed");
                    break "write failed";
                }
            }
            _ = cancelled(&mut shutdown) => {
                // Flush whatever was queued before the close.
                while let Ok(envelope) = queue.try_recv() {
                    if write_envelope(&mut writer, &envelope).await.is_err() {
                        break;
                    }
                }
                break "shutdown";
            }
        }
    };

    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    shared.close(reason);
}

async fn run_inbound<R>(
    reader: R,
    channel: MessagingChannel,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    let reason = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Envelope::decode(&line) {
                        Ok(envelope) => channel.dispatch(handler.as_ref(), envelope),
                        Err(e) => {
                            warn!(peer = %channel.peer(), error = %e, "Malformed message, closing channel");
                            break "malformed message";
                        }
                    }
                }
                Ok(None) => break "peer closed connection",
                Err(e) => {
                    warn!(peer = %channel.peer(), error = %e, "Read failed");
                    break "read failed";
                }
            },
            _ = cancelled(&mut shutdown) => break "shutdown",
        }
    };

    channel.shared.close(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{QueryMessage, STATUS_OK};
    use geogrid_topology::Location;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio_test::{assert_err, assert_ok};

    fn echo() -> Arc<dyn MessageHandler> {
        handler_fn(|_, message| message)
    }

    fn pair(left: Arc<dyn MessageHandler>, right: Arc<dyn MessageHandler>) -> (MessagingChannel, MessagingChannel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            MessagingChannel::establish(a, "left", left),
            MessagingChannel::establish(b, "right", right),
        )
    }

    fn load(i: usize) -> Message {
        Message::Load {
            address: NodeAddress::new("node", i as u16),
            load: i as f64,
        }
    }

    /// Raw peer speaking the line protocol by hand.
    struct RawPeer {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl RawPeer {
        async fn recv(&mut self) -> Envelope {
            let line = self.lines.next_line().await.unwrap().unwrap();
            Envelope::decode(&line).unwrap()
        }

        /// Write errors are ignored: some tests write after the channel hung up.
        async fn send_line(&mut self, line: &str) {
            let _ = self.writer.write_all(line.as_bytes()).await;
            let _ = self.writer.write_all(b"\n").await;
        }

        async fn send(&mut self, envelope: Envelope) {
            let line = envelope.encode().unwrap();
            self.send_line(&line).await;
        }
    }

    fn raw_pair(handler: Arc<dyn MessageHandler>) -> (MessagingChannel, RawPeer) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(b);
        (
            MessagingChannel::establish(a, "raw", handler),
            RawPeer {
                lines: BufReader::new(reader).lines(),
                writer,
            },
        )
    }

    #[tokio::test]
    async fn request_gets_its_response() {
        let (client, _server) = pair(echo(), handler_fn(|_, _| Message::ok()));

        let response = assert_ok!(client.request(Message::Activate).await);
        assert_eq!(response, Message::ok());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_each_get_exactly_one_response() {
        const K: usize = 200;
        let (client, _server) = pair(echo(), echo());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut senders = Vec::new();
        for worker in 0..4 {
            let client = client.clone();
            let tx = tx.clone();
            senders.push(tokio::spawn(async move {
                for i in (worker..K).step_by(4) {
                    let tx = tx.clone();
                    client
                        .send_async(load(i), Some(Box::new(move |response| {
                            let _ = tx.send((i, response));
                        })))
                        .unwrap();
                }
            }));
        }
        drop(tx);
        for s in senders {
            s.await.unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..K {
            let (i, response) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(response, load(i), "response routed to the wrong handler");
            assert!(seen.insert(i), "handler {i} invoked twice");
        }
        assert_eq!(seen.len(), K);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn both_sides_request_at_once_with_colliding_ids() {
        // Both counters start at 1, so ids overlap across directions.
        let (left, right) = pair(
            handler_fn(|_, _| Message::confirm(STATUS_OK, "from left")),
            handler_fn(|_, _| Message::confirm(STATUS_OK, "from right")),
        );

        let (a, b) = tokio::join!(left.request(Message::Activate), right.request(Message::Activate));
        assert_eq!(a.unwrap(), Message::confirm(STATUS_OK, "from right"));
        assert_eq!(b.unwrap(), Message::confirm(STATUS_OK, "from left"));
    }

    #[tokio::test]
    async fn request_without_handler_is_still_consumed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (client, _server) = pair(
            echo(),
            handler_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Message::ok()
            }),
        );

        assert_ok!(client.send_async(Message::Activate, None));
        // A follow-up round trip proves the first response was drained.
        assert_ok!(client.request(Message::Activate).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn notification_is_processed_but_not_answered() {
        let (client, mut peer) = raw_pair(echo());

        peer.send(Envelope::notification(Message::Shutdown)).await;
        // The next thing on the wire is our own request, not a reply.
        let sent = client.send_async(Message::Activate, None).unwrap();
        let envelope = peer.recv().await;
        assert_eq!(envelope.id, sent);
        assert!(envelope.response_expected);
        assert_eq!(envelope.payload, Message::Activate);
    }

    #[tokio::test]
    async fn notify_reaches_the_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (client, _server) = pair(
            echo(),
            handler_fn(move |_, message| {
                let _ = tx.send(message);
                Message::ok()
            }),
        );

        let q = QueryMessage::new(9, Location::new(1.0, 1.0), NodeAddress::new("c", 1), 3);
        assert_ok!(client.notify(Message::QueryMessage(q.clone())));
        assert_eq!(rx.recv().await.unwrap(), Message::QueryMessage(q));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn inbound_request_gets_one_reply_marked_as_response() {
        let (_channel, mut peer) = raw_pair(handler_fn(|_, _| Message::ok()));

        peer.send(Envelope::request(42, Message::Activate)).await;
        let reply = peer.recv().await;
        assert_eq!(reply, Envelope::response(42, Message::ok()));

        // A response from the peer for an unknown call is not answered either.
        peer.send(Envelope::response(77, Message::ok())).await;
        peer.send(Envelope::request(43, Message::Activate)).await;
        assert_eq!(peer.recv().await.id, 43);
    }

    #[tokio::test]
    async fn close_abandons_pending_calls() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let (client, mut peer) = raw_pair(echo());

        let flag = Arc::clone(&invoked);
        client
            .send_async(Message::Activate, Some(Box::new(move |_| {
                flag.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.request(Message::Activate).await })
        };

        // Make sure both requests hit the wire before closing.
        let first = peer.recv().await;
        let _second = peer.recv().await;
        client.close();

        assert_err!(waiting.await.unwrap());
        assert!(client.is_closed());
        assert_eq!(client.pending_calls(), 0);
        assert_err!(client.send_async(Message::Activate, None));
        assert_err!(client.notify(Message::Activate));

        // A late response is not delivered to the abandoned handler.
        peer.send(Envelope::response(first.id, Message::ok())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn peer_disconnect_closes_the_channel() {
        let (client, peer) = raw_pair(echo());
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.request(Message::Activate).await })
        };
        drop(peer);

        tokio::time::timeout(Duration::from_secs(5), client.closed()).await.unwrap();
        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn malformed_line_closes_the_channel() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (client, mut peer) = raw_pair(handler_fn(move |_, m| {
            counter.fetch_add(1, Ordering::SeqCst);
            m
        }));

        peer.send_line("{\"id\": 1, \"garbage\": true}").await;
        peer.send(Envelope::request(2, Message::Activate)).await;

        tokio::time::timeout(Duration::from_secs(5), client.closed()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn queued_messages_are_flushed_on_close() {
        let (client, mut peer) = raw_pair(echo());
        assert_ok!(client.notify(Message::Shutdown));
        client.close();

        let envelope = peer.recv().await;
        assert_eq!(envelope.payload, Message::Shutdown);
    }

    #[tokio::test]
    async fn handler_sees_the_channel_it_arrived_on() {
        let (client, _server) = pair(
            echo(),
            handler_fn(|channel, _| Message::confirm(STATUS_OK, channel.peer().to_string())),
        );
        let response = client.request(Message::Activate).await.unwrap();
        assert_eq!(response, Message::confirm(STATUS_OK, "right"));
    }

    #[tokio::test]
    async fn connect_over_tcp() {
        let listener = crate::bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = NodeAddress::from(listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            MessagingChannel::from_tcp(stream, handler_fn(|_, _| Message::ok())).unwrap()
        });

        let client = MessagingChannel::connect(&addr, echo()).await.unwrap();
        let _server = server.await.unwrap();
        assert_eq!(client.request(Message::Activate).await.unwrap(), Message::ok());
    }

    #[tokio::test]
    async fn connect_failure_is_a_transport_failure() {
        let listener = crate::bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = NodeAddress::from(listener.local_addr().unwrap());
        drop(listener);

        let err = MessagingChannel::connect(&addr, echo()).await.unwrap_err();
        assert!(err.is_transport());
    }
}
