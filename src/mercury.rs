//! Mercury request/response and publish/subscribe multiplexing.
//!
//! Mercury runs inside the encrypted access point channel. Every request is
//! tagged with a sequence id that the server echoes in its response, so many
//! requests can be in flight at once and responses may arrive in any order.
//! Pushes for subscribed URIs arrive as `MercuryEvent` packets and are routed
//! by URI prefix.
//!
//! # Wire format
//!
//! ```text
//! [seq length: u16][seq: seq length bytes][flags: u8][part count: u16]
//! ([part length: u16][part])*
//! ```
//!
//! The first part of a message is a protobuf `Header`; the remaining parts
//! are the payload. Flag `0x01` marks the final packet of a message, flag
//! `0x02` marks a packet whose last part continues in the next packet.
//!
//! # Concurrency
//!
//! [`Mercury`] is cheap to clone. The correlation tables sit behind one
//! mutex that is held only for single insertions, removals and lookups,
//! never across an await point. Dropping a request future removes its waiter
//! without affecting other requests.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use protobuf::Message;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    packet::PacketType,
    protocol::protos::{
        mercury::{Header, MercuryMultiGetReply, MercuryMultiGetRequest, MercuryRequest, UserField},
        pubsub::Subscription,
    },
};

/// Content type of a batched lookup.
pub const MULTI_GET_CONTENT_TYPE: &str = "vnd.spotify/mercury-mget-request";

/// Packet flag: last packet of a message.
const FLAG_FINAL: u8 = 0x01;

/// Packet flag: the last part continues in the next packet.
const FLAG_PARTIAL: u8 = 0x02;

/// Pushes kept waiting for their final packet. When full, the push with
/// the lowest sequence id is dropped.
const MAX_PARTIAL_EVENTS: usize = 32;

/// Outbound packets, drained by the connection's writer task.
pub type PacketSender = mpsc::UnboundedSender<(u8, Bytes)>;

/// Mercury request method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    /// Fetch a resource.
    Get,

    /// Start receiving pushes for a URI.
    Sub,

    /// Stop receiving pushes for a URI.
    Unsub,

    /// Deliver a payload.
    Send,
}

impl Method {
    /// Method name as carried in the header.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Sub => "SUB",
            Self::Unsub => "UNSUB",
            Self::Send => "SEND",
        }
    }

    /// Packet tag the request is sent with.
    #[must_use]
    pub fn packet_type(self) -> PacketType {
        match self {
            Self::Get | Self::Send => PacketType::MercuryReq,
            Self::Sub => PacketType::MercurySub,
            Self::Unsub => PacketType::MercuryUnsub,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound Mercury message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub content_type: Option<String>,

    /// Extra header fields, sent in order.
    pub user_fields: Vec<(String, Vec<u8>)>,

    /// Payload parts following the header.
    pub payload: Vec<Bytes>,
}

impl Request {
    /// Creates a request without content type, fields or payload.
    #[must_use]
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            content_type: None,
            user_fields: Vec::new(),
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::Get, uri)
    }

    #[must_use]
    pub fn send(uri: impl Into<String>) -> Self {
        Self::new(Method::Send, uri)
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_user_field(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.user_fields.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_payload(mut self, part: impl Into<Bytes>) -> Self {
        self.payload.push(part.into());
        self
    }

    fn header(&self) -> Header {
        let mut header = Header::new();
        header.set_uri(self.uri.clone());
        header.set_method(self.method.as_str().to_owned());
        if let Some(content_type) = &self.content_type {
            header.set_content_type(content_type.clone());
        }
        for (key, value) in &self.user_fields {
            let mut field = UserField::new();
            field.set_key(key.clone());
            field.set_value(value.clone());
            header.user_fields.push(field);
        }
        header
    }
}

/// Inbound Mercury message: a response to a request or a push.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub uri: String,

    /// HTTP-like status. Pushes carry zero.
    pub status_code: i32,
    pub content_type: Option<String>,
    pub user_fields: Vec<(String, Vec<u8>)>,
    pub payload: Vec<Bytes>,
}

impl Response {
    /// Whether the status code is in the success range.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// All payload parts concatenated.
    #[must_use]
    pub fn body(&self) -> Bytes {
        match self.payload.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            parts => {
                let mut body = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
                for part in parts {
                    body.extend_from_slice(part);
                }
                body.freeze()
            }
        }
    }

    /// Value of the first user field named `key`.
    #[must_use]
    pub fn user_field(&self, key: &str) -> Option<&[u8]> {
        self.user_fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_slice())
    }

    fn from_parts(mut parts: Vec<Bytes>) -> Result<Self> {
        if parts.is_empty() {
            return Err(Error::data_loss("mercury message without header"));
        }
        let header_bytes = parts.remove(0);
        let header = Header::parse_from_tokio_bytes(&header_bytes)?;

        Ok(Self {
            uri: header.uri().to_owned(),
            status_code: header.status_code(),
            content_type: header
                .has_content_type()
                .then(|| header.content_type().to_owned()),
            user_fields: header
                .user_fields
                .iter()
                .map(|field| (field.key().to_owned(), field.value().to_vec()))
                .collect(),
            payload: parts,
        })
    }
}

/// One Mercury packet.
///
/// A message larger than a packet spans several packets with the same
/// sequence id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Sequence id correlating requests and responses.
    pub seq: u64,

    /// `0x01` on the final packet, `0x02` when the last part continues.
    pub flags: u8,

    pub parts: Vec<Bytes>,
}

impl Packet {
    /// Encodes the packet with an eight byte sequence id.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when there are more than 65535 parts or a part is
    /// larger than 65535 bytes.
    pub fn encode(&self) -> Result<Bytes> {
        let count = u16::try_from(self.parts.len())
            .map_err(|_| Error::invalid_argument("too many mercury parts"))?;

        let size = 2 + 8 + 1 + 2 + self.parts.iter().map(|p| 2 + p.len()).sum::<usize>();
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u16(8);
        buf.put_u64(self.seq);
        buf.put_u8(self.flags);
        buf.put_u16(count);
        for part in &self.parts {
            let len = u16::try_from(part.len())
                .map_err(|_| Error::invalid_argument("mercury part too large"))?;
            buf.put_u16(len);
            buf.extend_from_slice(part);
        }
        Ok(buf.freeze())
    }

    /// Decodes a packet. Sequence ids of up to eight bytes are accepted.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        let truncated = || Error::data_loss("truncated mercury packet");

        if data.remaining() < 2 {
            return Err(truncated());
        }
        let seq_len = usize::from(data.get_u16());
        if seq_len > 8 {
            return Err(Error::data_loss(format!(
                "mercury sequence id of {seq_len} bytes"
            )));
        }
        if data.remaining() < seq_len + 3 {
            return Err(truncated());
        }
        let seq = data
            .split_to(seq_len)
            .iter()
            .fold(0u64, |seq, byte| (seq << 8) | u64::from(*byte));
        let flags = data.get_u8();
        let count = data.get_u16();

        let mut parts = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            if data.remaining() < 2 {
                return Err(truncated());
            }
            let len = usize::from(data.get_u16());
            if data.remaining() < len {
                return Err(truncated());
            }
            parts.push(data.split_to(len));
        }

        Ok(Self { seq, flags, parts })
    }
}

/// Result of one lookup in a batch.
pub type MultiGetResult = Result<Bytes>;

type Callback = oneshot::Sender<Result<Response>>;

#[derive(Default)]
struct Pending {
    parts: Vec<Bytes>,
    partial: Option<BytesMut>,
    callback: Option<Callback>,
}

struct Subscriber {
    /// URI passed to [`Mercury::subscribe`].
    subscription: String,
    uri_prefix: String,
    sender: mpsc::UnboundedSender<Response>,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    pending: HashMap<u64, Pending>,
    events: HashMap<u64, Pending>,
    subscribers: Vec<Subscriber>,
    invalidated: bool,
}

struct Shared {
    sender: PacketSender,
    state: Mutex<State>,
    timeout: Duration,
}

/// Mercury multiplexer for one connection.
#[derive(Clone)]
pub struct Mercury {
    shared: Arc<Shared>,
}

impl fmt::Debug for Mercury {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mercury")
            .field("timeout", &self.shared.timeout)
            .finish_non_exhaustive()
    }
}

/// Removes the waiter of a request when its future is dropped.
struct WaiterGuard<'a> {
    mercury: &'a Mercury,
    seq: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.mercury.shared.state.lock() {
            if state.pending.remove(&self.seq).is_some() {
                trace!("mercury: dropped waiter for sequence {}", self.seq);
            }
        }
    }
}

impl Mercury {
    /// Creates a multiplexer that sends packets through `sender` and bounds
    /// every round trip by `timeout`.
    #[must_use]
    pub fn new(sender: PacketSender, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                sender,
                state: Mutex::new(State::default()),
                timeout,
            }),
        }
    }

    /// Assigns a sequence id, registers the waiter and queues the packet.
    fn submit(&self, request: &Request) -> Result<(u64, oneshot::Receiver<Result<Response>>)> {
        let header = request.header().write_to_bytes()?;
        let mut parts = Vec::with_capacity(1 + request.payload.len());
        parts.push(Bytes::from(header));
        parts.extend(request.payload.iter().cloned());

        let (tx, rx) = oneshot::channel();
        let mut state = self.shared.state.lock()?;
        if state.invalidated {
            return Err(Error::transport("connection is closed"));
        }

        let seq = state.next_seq;
        let packet = Packet {
            seq,
            flags: FLAG_FINAL,
            parts,
        }
        .encode()?;

        // Queue while holding the lock so packets leave in sequence order.
        self.shared
            .sender
            .send((request.method.packet_type().into(), packet))
            .map_err(|_| Error::transport("connection is closed"))?;

        state.next_seq += 1;
        state.pending.insert(
            seq,
            Pending {
                callback: Some(tx),
                ..Pending::default()
            },
        );
        trace!("mercury: {} {} as sequence {seq}", request.method, request.uri);

        Ok((seq, rx))
    }

    /// Sends a request and waits for its response.
    ///
    /// # Errors
    ///
    /// * `MercuryStatus` when the response status is outside `200..300`
    /// * `DeadlineExceeded` when no response arrives in time
    /// * `Transport` when the connection closes first
    pub async fn send(&self, request: Request) -> Result<Response> {
        let (seq, rx) = self.submit(&request)?;
        let _guard = WaiterGuard { mercury: self, seq };

        match tokio::time::timeout(self.shared.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::transport("connection closed during request")),
            Err(_) => Err(Error::deadline_exceeded(format!(
                "no response to {} {}",
                request.method, request.uri
            ))),
        }
    }

    /// Like [`send`](Self::send), but gives up when `cancel` fires.
    ///
    /// Cancelling only removes this request's waiter; other requests and the
    /// connection are unaffected.
    pub async fn send_cancellable(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::cancelled("mercury request cancelled")),
            result = self.send(request) => result,
        }
    }

    /// Shorthand for a `GET` [`send`](Self::send).
    pub async fn get(&self, uri: impl Into<String>) -> Result<Response> {
        self.send(Request::get(uri)).await
    }

    /// Subscribes to pushes for `uri` and every URI below it.
    ///
    /// The server may confirm the subscription for several URIs; a
    /// subscriber is registered for each of them. Dropping the receiver
    /// stops delivery, but only [`unsubscribe`](Self::unsubscribe) tells the
    /// server.
    pub async fn subscribe(
        &self,
        uri: impl Into<String>,
    ) -> Result<mpsc::UnboundedReceiver<Response>> {
        let uri = uri.into();
        let response = self.send(Request::new(Method::Sub, uri.clone())).await?;

        let mut prefixes = Vec::with_capacity(response.payload.len());
        for part in &response.payload {
            let subscription = Subscription::parse_from_tokio_bytes(part)?;
            prefixes.push(subscription.uri().to_owned());
        }
        if prefixes.is_empty() {
            prefixes.push(uri.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock()?;
        if state.invalidated {
            return Err(Error::transport("connection is closed"));
        }
        for uri_prefix in prefixes {
            debug!("mercury: subscribed to {uri_prefix}");
            state.subscribers.push(Subscriber {
                subscription: uri.clone(),
                uri_prefix,
                sender: tx.clone(),
            });
        }

        Ok(rx)
    }

    /// Ends a subscription on the server and drops its local subscribers,
    /// including those for URIs the server confirmed in its place.
    pub async fn unsubscribe(&self, uri: impl Into<String>) -> Result<()> {
        let uri = uri.into();
        self.shared
            .state
            .lock()?
            .subscribers
            .retain(|subscriber| subscriber.subscription != uri);
        debug!("mercury: unsubscribed from {uri}");

        self.send(Request::new(Method::Unsub, uri)).await?;
        Ok(())
    }

    /// Looks up several URIs in one round trip.
    ///
    /// Results are returned in request order; a failed lookup does not fail
    /// the others.
    pub async fn multi_get(
        &self,
        uri: impl Into<String>,
        lookups: &[&str],
    ) -> Result<Vec<MultiGetResult>> {
        let mut batch = MercuryMultiGetRequest::new();
        for lookup in lookups {
            let mut request = MercuryRequest::new();
            request.set_uri((*lookup).to_owned());
            batch.request.push(request);
        }

        let request = Request::get(uri)
            .with_content_type(MULTI_GET_CONTENT_TYPE)
            .with_payload(batch.write_to_bytes()?);
        let response = self.send(request).await?;

        let replies = MercuryMultiGetReply::parse_from_tokio_bytes(&response.body())?;
        if replies.reply.len() != lookups.len() {
            return Err(Error::data_loss(format!(
                "{} replies to {} lookups",
                replies.reply.len(),
                lookups.len()
            )));
        }

        Ok(replies
            .reply
            .into_iter()
            .zip(lookups)
            .map(|(reply, lookup)| {
                let code = reply.status_code();
                let body = Bytes::from(reply.body().to_vec());
                if (200..300).contains(&code) {
                    Ok(body)
                } else {
                    Err(Error::mercury_status(code, *lookup, vec![body]))
                }
            })
            .collect())
    }

    /// Handles one inbound Mercury packet from the receive loop.
    pub fn dispatch(&self, packet_type: PacketType, payload: Bytes) -> Result<()> {
        let packet = Packet::decode(payload)?;
        let is_event = packet_type == PacketType::MercuryEvent;

        let mut state = self.shared.state.lock()?;
        let table = if is_event {
            &mut state.events
        } else {
            &mut state.pending
        };

        let mut pending = match table.remove(&packet.seq) {
            Some(pending) => pending,
            None if is_event => Pending::default(),
            None => {
                warn!(
                    "mercury: dropping {packet_type} for unknown sequence {}",
                    packet.seq
                );
                return Ok(());
            }
        };

        let count = packet.parts.len();
        for (i, part) in packet.parts.into_iter().enumerate() {
            let part = match pending.partial.take() {
                Some(mut partial) => {
                    partial.extend_from_slice(&part);
                    partial
                }
                None => BytesMut::from(&part[..]),
            };

            if i + 1 == count && packet.flags == FLAG_PARTIAL {
                pending.partial = Some(part);
            } else {
                pending.parts.push(part.freeze());
            }
        }

        if packet.flags != FLAG_FINAL {
            if is_event && table.len() >= MAX_PARTIAL_EVENTS {
                if let Some(oldest) = table.keys().min().copied() {
                    warn!("mercury: dropping incomplete push {oldest}");
                    table.remove(&oldest);
                }
            }
            table.insert(packet.seq, pending);
            return Ok(());
        }

        if is_event {
            let response = Response::from_parts(pending.parts)?;
            let subscribers: Vec<_> = state
                .subscribers
                .iter()
                .filter(|s| response.uri.starts_with(&s.uri_prefix))
                .map(|s| s.sender.clone())
                .collect();
            drop(state);
            self.publish(response, &subscribers);
        } else {
            drop(state);
            let result = Response::from_parts(pending.parts).and_then(|response| {
                if response.is_success() {
                    Ok(response)
                } else {
                    Err(Error::mercury_status(
                        response.status_code,
                        response.uri,
                        response.payload,
                    ))
                }
            });
            if let Some(callback) = pending.callback {
                // The caller may have given up in the meantime.
                let _ = callback.send(result);
            }
        }

        Ok(())
    }

    fn publish(&self, response: Response, subscribers: &[mpsc::UnboundedSender<Response>]) {
        if subscribers.is_empty() {
            debug!("mercury: no subscriber for {}", response.uri);
            return;
        }

        let mut closed = false;
        for subscriber in subscribers {
            closed |= subscriber.send(response.clone()).is_err();
        }

        if closed {
            if let Ok(mut state) = self.shared.state.lock() {
                state.subscribers.retain(|s| !s.sender.is_closed());
            }
        }
    }

    /// Fails every pending request and closes every subscription. Called by
    /// the connection when it dies; later requests fail immediately.
    pub fn invalidate(&self) {
        let Ok(mut state) = self.shared.state.lock() else {
            return;
        };
        state.invalidated = true;
        state.subscribers.clear();
        state.events.clear();
        let pending: Vec<_> = state.pending.drain().collect();
        drop(state);

        for (seq, pending) in pending {
            if let Some(callback) = pending.callback {
                trace!("mercury: failing sequence {seq}");
                let _ = callback.send(Err(Error::transport("connection closed")));
            }
        }
    }

    /// Number of requests waiting for a response.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().map_or(0, |state| state.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn mercury() -> (Mercury, mpsc::UnboundedReceiver<(u8, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Mercury::new(tx, TIMEOUT), rx)
    }

    fn header(uri: &str, status: i32) -> Bytes {
        let mut header = Header::new();
        header.set_uri(uri.to_owned());
        header.set_status_code(status);
        Bytes::from(header.write_to_bytes().unwrap())
    }

    fn response(seq: u64, uri: &str, status: i32, body: &'static [u8]) -> Bytes {
        Packet {
            seq,
            flags: FLAG_FINAL,
            parts: vec![header(uri, status), Bytes::from_static(body)],
        }
        .encode()
        .unwrap()
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<(u8, Bytes)>) -> (u8, Packet, Header) {
        let (cmd, payload) = rx.recv().await.unwrap();
        let packet = Packet::decode(payload).unwrap();
        let header = Header::parse_from_tokio_bytes(&packet.parts[0]).unwrap();
        (cmd, packet, header)
    }

    #[tokio::test]
    async fn sequence_ids_increase_in_submission_order() {
        let (mercury, mut rx) = mercury();

        let mut requests = Vec::new();
        for i in 0..5 {
            let mercury = mercury.clone();
            requests.push(tokio::spawn(async move {
                mercury.get(format!("hm://test/{i}")).await
            }));
            tokio::task::yield_now().await;
        }

        let mut seqs = Vec::new();
        for _ in 0..5 {
            let (cmd, packet, req_header) = next_request(&mut rx).await;
            assert_eq!(cmd, u8::from(PacketType::MercuryReq));
            assert_eq!(req_header.method(), "GET");
            seqs.push(packet.seq);
            mercury
                .dispatch(
                    PacketType::MercuryReq,
                    response(packet.seq, req_header.uri(), 200, b""),
                )
                .unwrap();
        }

        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
        assert_eq!(seqs[0], 0);
        for request in requests {
            request.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn responses_are_correlated_by_sequence_id() {
        let (mercury, mut rx) = mercury();

        let first = tokio::spawn({
            let mercury = mercury.clone();
            async move { mercury.get("hm://test/first").await }
        });
        let (_, first_packet, _) = next_request(&mut rx).await;
        let second = tokio::spawn({
            let mercury = mercury.clone();
            async move { mercury.get("hm://test/second").await }
        });
        let (_, second_packet, _) = next_request(&mut rx).await;

        // Answer out of order.
        mercury
            .dispatch(
                PacketType::MercuryReq,
                response(second_packet.seq, "hm://test/second", 200, b"two"),
            )
            .unwrap();
        mercury
            .dispatch(
                PacketType::MercuryReq,
                response(first_packet.seq, "hm://test/first", 200, b"one"),
            )
            .unwrap();

        assert_eq!(&first.await.unwrap().unwrap().body()[..], b"one");
        assert_eq!(&second.await.unwrap().unwrap().body()[..], b"two");
    }

    #[tokio::test]
    async fn unmatched_responses_are_dropped() {
        let (mercury, mut rx) = mercury();

        let request = tokio::spawn({
            let mercury = mercury.clone();
            async move { mercury.get("hm://test/pending").await }
        });
        let (_, packet, _) = next_request(&mut rx).await;

        mercury
            .dispatch(
                PacketType::MercuryReq,
                response(packet.seq + 100, "hm://test/stray", 200, b"stray"),
            )
            .unwrap();
        assert_eq!(mercury.pending(), 1);

        mercury
            .dispatch(
                PacketType::MercuryReq,
                response(packet.seq, "hm://test/pending", 200, b"ok"),
            )
            .unwrap();
        assert_eq!(&request.await.unwrap().unwrap().body()[..], b"ok");
    }

    #[tokio::test]
    async fn error_status_carries_code_and_payload() {
        let (mercury, mut rx) = mercury();

        let request = tokio::spawn({
            let mercury = mercury.clone();
            async move { mercury.get("hm://test/missing").await }
        });
        let (_, packet, _) = next_request(&mut rx).await;
        mercury
            .dispatch(
                PacketType::MercuryReq,
                response(packet.seq, "hm://test/missing", 404, b"not here"),
            )
            .unwrap();

        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::MercuryStatus);
        let status = err.status().unwrap();
        assert_eq!(status.code, 404);
        assert_eq!(status.payload, vec![Bytes::from_static(b"not here")]);
        assert!(!status.is_retryable());
    }

    #[tokio::test]
    async fn cancelling_removes_only_that_waiter() {
        let (mercury, mut rx) = mercury();
        let cancel = CancellationToken::new();

        let cancelled = tokio::spawn({
            let mercury = mercury.clone();
            let cancel = cancel.clone();
            async move {
                mercury
                    .send_cancellable(Request::get("hm://test/slow"), &cancel)
                    .await
            }
        });
        let (_, slow, _) = next_request(&mut rx).await;

        let other = tokio::spawn({
            let mercury = mercury.clone();
            async move { mercury.get("hm://test/fast").await }
        });
        let (_, fast, _) = next_request(&mut rx).await;
        assert_eq!(mercury.pending(), 2);

        cancel.cancel();
        let err = cancelled.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(mercury.pending(), 1);

        // A late answer to the cancelled request is dropped.
        mercury
            .dispatch(
                PacketType::MercuryReq,
                response(slow.seq, "hm://test/slow", 200, b"late"),
            )
            .unwrap();
        mercury
            .dispatch(
                PacketType::MercuryReq,
                response(fast.seq, "hm://test/fast", 200, b"fast"),
            )
            .unwrap();
        assert_eq!(&other.await.unwrap().unwrap().body()[..], b"fast");
    }

    #[tokio::test]
    async fn timeouts_fail_locally() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mercury = Mercury::new(tx, Duration::from_millis(20));

        let err = mercury.get("hm://test/silent").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
        assert_eq!(mercury.pending(), 0);
    }

    #[tokio::test]
    async fn partial_packets_are_reassembled() {
        let (mercury, mut rx) = mercury();

        let request = tokio::spawn({
            let mercury = mercury.clone();
            async move { mercury.get("hm://test/large").await }
        });
        let (_, packet, _) = next_request(&mut rx).await;

        let first = Packet {
            seq: packet.seq,
            flags: FLAG_PARTIAL,
            parts: vec![header("hm://test/large", 200), Bytes::from_static(b"hello ")],
        };
        let second = Packet {
            seq: packet.seq,
            flags: FLAG_FINAL,
            parts: vec![Bytes::from_static(b"world"), Bytes::from_static(b"!")],
        };
        mercury
            .dispatch(PacketType::MercuryReq, first.encode().unwrap())
            .unwrap();
        mercury
            .dispatch(PacketType::MercuryReq, second.encode().unwrap())
            .unwrap();

        let response = request.await.unwrap().unwrap();
        assert_eq!(response.payload.len(), 2);
        assert_eq!(&response.body()[..], b"hello world!");
    }

    #[tokio::test]
    async fn pushes_reach_prefix_subscribers() {
        let (mercury, mut rx) = mercury();

        let subscribe = tokio::spawn({
            let mercury = mercury.clone();
            async move { mercury.subscribe("hm://remote/user/alice/").await }
        });
        let (cmd, packet, sub) = next_request(&mut rx).await;
        assert_eq!(cmd, u8::from(PacketType::MercurySub));
        assert_eq!(sub.method(), "SUB");
        mercury
            .dispatch(
                PacketType::MercurySub,
                Packet {
                    seq: packet.seq,
                    flags: FLAG_FINAL,
                    parts: vec![header(sub.uri(), 200)],
                }
                .encode()
                .unwrap(),
            )
            .unwrap();
        let mut pushes = subscribe.await.unwrap().unwrap();

        let push = |uri: &str, body: &'static [u8]| {
            Packet {
                seq: 0,
                flags: FLAG_FINAL,
                parts: vec![header(uri, 0), Bytes::from_static(body)],
            }
            .encode()
            .unwrap()
        };
        mercury
            .dispatch(
                PacketType::MercuryEvent,
                push("hm://remote/user/alice/devices", b"match"),
            )
            .unwrap();
        mercury
            .dispatch(PacketType::MercuryEvent, push("hm://remote/user/bob/", b"other"))
            .unwrap();

        let received = pushes.recv().await.unwrap();
        assert_eq!(received.uri, "hm://remote/user/alice/devices");
        assert_eq!(&received.body()[..], b"match");
        assert!(pushes.try_recv().is_err());
    }

    fn push(seq: u64, flags: u8, uri: &str, body: &'static [u8]) -> Bytes {
        Packet {
            seq,
            flags,
            parts: vec![header(uri, 0), Bytes::from_static(body)],
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn unsubscribe_drops_server_confirmed_prefixes() {
        let (mercury, mut rx) = mercury();

        let subscribe = tokio::spawn({
            let mercury = mercury.clone();
            async move { mercury.subscribe("hm://remote/user/alice").await }
        });
        let (_, packet, _) = next_request(&mut rx).await;
        let mut confirmed = Subscription::new();
        confirmed.set_uri("hm://remote/user/alice/devices".to_owned());
        mercury
            .dispatch(
                PacketType::MercurySub,
                Packet {
                    seq: packet.seq,
                    flags: FLAG_FINAL,
                    parts: vec![
                        header("hm://remote/user/alice", 200),
                        Bytes::from(confirmed.write_to_bytes().unwrap()),
                    ],
                }
                .encode()
                .unwrap(),
            )
            .unwrap();
        let mut pushes = subscribe.await.unwrap().unwrap();

        let unsubscribe = tokio::spawn({
            let mercury = mercury.clone();
            async move { mercury.unsubscribe("hm://remote/user/alice").await }
        });
        let (cmd, packet, unsub) = next_request(&mut rx).await;
        assert_eq!(cmd, u8::from(PacketType::MercuryUnsub));
        assert_eq!(unsub.uri(), "hm://remote/user/alice");
        mercury
            .dispatch(
                PacketType::MercuryUnsub,
                response(packet.seq, "hm://remote/user/alice", 200, b""),
            )
            .unwrap();
        unsubscribe.await.unwrap().unwrap();

        mercury
            .dispatch(
                PacketType::MercuryEvent,
                push(0, FLAG_FINAL, "hm://remote/user/alice/devices", b"late"),
            )
            .unwrap();
        // Every sender is gone, so the channel reports closed.
        assert!(pushes.recv().await.is_none());
    }

    #[test]
    fn incomplete_pushes_are_bounded() {
        let (mercury, _rx) = mercury();

        let total = u64::try_from(MAX_PARTIAL_EVENTS).unwrap() + 10;
        for seq in 0..total {
            mercury
                .dispatch(
                    PacketType::MercuryEvent,
                    push(seq, FLAG_PARTIAL, "hm://remote/user/alice", b"part"),
                )
                .unwrap();
        }

        {
            let state = mercury.shared.state.lock().unwrap();
            assert_eq!(state.events.len(), MAX_PARTIAL_EVENTS);
            assert!(!state.events.contains_key(&0));
            assert!(state.events.contains_key(&(total - 1)));
        }

        mercury.invalidate();
        assert!(mercury.shared.state.lock().unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn invalidation_fails_waiters_and_closes_subscriptions() {
        let (mercury, mut rx) = mercury();

        let request = tokio::spawn({
            let mercury = mercury.clone();
            async move { mercury.get("hm://test/pending").await }
        });
        next_request(&mut rx).await;

        mercury.invalidate();
        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transport);

        let err = mercury.get("hm://test/after").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transport);
    }

    #[tokio::test]
    async fn multi_get_packs_lookups_into_one_request() {
        let (mercury, mut rx) = mercury();

        let request = tokio::spawn({
            let mercury = mercury.clone();
            async move {
                mercury
                    .multi_get("hm://metadata/4/tracks", &["hm://a", "hm://b"])
                    .await
            }
        });
        let (_, packet, req_header) = next_request(&mut rx).await;
        assert_eq!(req_header.content_type(), MULTI_GET_CONTENT_TYPE);
        let batch = MercuryMultiGetRequest::parse_from_tokio_bytes(&packet.parts[1]).unwrap();
        assert_eq!(batch.request.len(), 2);
        assert_eq!(batch.request[1].uri(), "hm://b");

        let mut replies = MercuryMultiGetReply::new();
        let mut ok = crate::protocol::protos::mercury::MercuryReply::new();
        ok.set_status_code(200);
        ok.set_body(b"track a".to_vec());
        let mut missing = crate::protocol::protos::mercury::MercuryReply::new();
        missing.set_status_code(404);
        replies.reply.push(ok);
        replies.reply.push(missing);

        let reply = Packet {
            seq: packet.seq,
            flags: FLAG_FINAL,
            parts: vec![
                header("hm://metadata/4/tracks", 200),
                Bytes::from(replies.write_to_bytes().unwrap()),
            ],
        };
        mercury
            .dispatch(PacketType::MercuryReq, reply.encode().unwrap())
            .unwrap();

        let results = request.await.unwrap().unwrap();
        assert_eq!(&results[0].as_ref().unwrap()[..], b"track a");
        assert_eq!(results[1].as_ref().unwrap_err().status().unwrap().code, 404);
    }

    #[test]
    fn short_sequence_ids_are_accepted() {
        let mut raw = BytesMut::new();
        raw.put_u16(2);
        raw.put_u16(0x0102);
        raw.put_u8(FLAG_FINAL);
        raw.put_u16(0);

        let packet = Packet::decode(raw.freeze()).unwrap();
        assert_eq!(packet.seq, 0x0102);
        assert!(packet.parts.is_empty());
    }
}
