//! The watchlist façade
//!
//! [`Watchlist`] owns every structure of the engine and is driven from one
//! thread: the application submits messages, the connection layer feeds in
//! decoded messages and channel transitions, and `dispatch` drains queued
//! work and expired timers.
//!
//! Item requests are queued on submit and reach the transport on the next
//! dispatch (or channel-up). A send that hits `NoBuffers` leaves its stream
//! queued, so nothing is lost while the transport is out of buffers.
//!
//! Responses for the application are queued as [`WatchlistEvent`]s, already
//! rewritten to the application's stream id.

mod control;
mod items;
mod posts;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use feed_types::domain::DomainType;
use feed_types::ids::{ServiceId, StreamId, DIRECTORY_STREAM_ID, LOGIN_STREAM_ID};
use feed_types::msg::{CloseMsg, Msg};
use tracing::{debug, error, info, trace, warn};

use crate::arena::{Arena, Handle};
use crate::codec::{Codec, JsonCodec};
use crate::config::WatchlistConfig;
use crate::error::WatchlistError;
use crate::events::{SubmitOptions, WatchlistEvent, WatchlistStats};
use crate::item_group::ItemGroupTable;
use crate::notifier::TimeoutNotifier;
use crate::pool::{ProviderIdAllocator, StreamPool};
use crate::post::PostKey;
use crate::request::{ItemRequest, RequestState, ServiceBinding};
use crate::service_cache::ServiceCache;
use crate::stream::{ItemStream, StreamAttributes};
use crate::timer::{TimerGroupId, TimerId, TimerManager};
use crate::transport::{SubmitStatus, Transport};

use control::{DirectoryStream, LoginStream};

/// Size hint for send buffers
const SEND_BUFFER_SIZE: usize = 512;

/// What a running timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOwner {
    /// Refresh expected on an item stream
    RequestTimeout(StreamId),
    /// Acknowledgement expected for a post sent on `stream_id`
    PostAck { stream_id: StreamId, key: PostKey },
}

/// Outcome of trying to send one queued stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Sent,
    /// Nothing left to send for this stream
    Skipped,
    /// Must wait (open window full or partial refresh in progress)
    Deferred,
}

/// Work left queued by `NoBuffers` is picked up by the next dispatch.
fn retry_later(err: WatchlistError) -> Result<(), WatchlistError> {
    if err.is_retryable() {
        debug!("Send deferred until buffers are available");
        Ok(())
    } else {
        Err(err)
    }
}

/// Consumer-side subscription multiplexer.
pub struct Watchlist<T: Transport, C: Codec = JsonCodec> {
    config: WatchlistConfig,
    transport: T,
    codec: C,
    channel_up: bool,

    streams: StreamPool<ItemStream>,
    /// Shareable streams by what they carry
    streams_by_attributes: HashMap<StreamAttributes, Handle>,
    requests: Arena<ItemRequest>,
    /// Application stream id -> request
    requests_by_id: BTreeMap<StreamId, Handle>,
    /// Requests with no matching service yet
    waiting: BTreeSet<StreamId>,
    pending_sends: VecDeque<Handle>,
    pending_closes: VecDeque<CloseMsg>,
    /// Streams awaiting a refresh, per service
    open_window: HashMap<ServiceId, u64>,

    services: ServiceCache,
    item_groups: ItemGroupTable,

    timers: TimerManager<TimerOwner>,
    request_timeouts: TimerGroupId,
    post_timeouts: TimerGroupId,
    outstanding_posts: usize,

    login: LoginStream,
    directory: DirectoryStream,

    provider_ids: ProviderIdAllocator,
    /// Symbol-list request -> symbol -> provider-driven child request id
    symbol_list_children: BTreeMap<StreamId, BTreeMap<String, StreamId>>,

    events: VecDeque<WatchlistEvent>,
    stats: WatchlistStats,
    notifier: Option<TimeoutNotifier>,
}

impl<T: Transport, C: Codec> Watchlist<T, C> {
    pub fn new(config: WatchlistConfig, transport: T, codec: C) -> Result<Self, WatchlistError> {
        config.validate()?;

        let mut timers = TimerManager::new();
        let request_timeouts = timers.add_group(config.request_timeout());
        let post_timeouts = timers.add_group(config.post_ack_timeout());

        info!(
            initial_streams = config.initial_stream_pool_size,
            max_streams = config.max_streams,
            single_open = config.single_open,
            "Watchlist created"
        );

        Ok(Self {
            streams: StreamPool::new(config.initial_stream_pool_size, config.max_streams),
            item_groups: ItemGroupTable::new(config.group_id_max_pooled_len),
            config,
            transport,
            codec,
            channel_up: false,
            streams_by_attributes: HashMap::new(),
            requests: Arena::new(),
            requests_by_id: BTreeMap::new(),
            waiting: BTreeSet::new(),
            pending_sends: VecDeque::new(),
            pending_closes: VecDeque::new(),
            open_window: HashMap::new(),
            services: ServiceCache::new(),
            timers,
            request_timeouts,
            post_timeouts,
            outstanding_posts: 0,
            login: LoginStream::default(),
            directory: DirectoryStream::default(),
            provider_ids: ProviderIdAllocator::new(),
            symbol_list_children: BTreeMap::new(),
            events: VecDeque::new(),
            stats: WatchlistStats::default(),
            notifier: None,
        })
    }

    // ------------------------------------------------------------------
    // Application entry points
    // ------------------------------------------------------------------

    /// Submit a request, close, post or generic message.
    pub fn submit_msg(&mut self, msg: Msg, options: &SubmitOptions) -> Result<(), WatchlistError> {
        self.submit_msg_at(msg, options, Instant::now())
    }

    pub fn submit_msg_at(
        &mut self,
        msg: Msg,
        options: &SubmitOptions,
        now: Instant,
    ) -> Result<(), WatchlistError> {
        let result = match msg {
            Msg::Request(request) => {
                if request.stream_id <= 0 {
                    Err(WatchlistError::invalid_usage("Stream id must be positive."))
                } else {
                    match request.domain {
                        DomainType::Login => self.submit_login(request),
                        DomainType::Source => self.submit_directory_request(request, options),
                        _ => self.submit_item_request(request, options),
                    }
                }
            }
            Msg::Close(close) => self.close_request(close.stream_id),
            Msg::Post(post) => self.submit_post(post, options, now),
            Msg::Generic(generic) => self.submit_generic(generic),
            other => Err(WatchlistError::invalid_usage(format!(
                "{} messages cannot be submitted.",
                other.class_label()
            ))),
        };
        self.publish_next_timeout();
        result
    }

    /// Tear down one application stream.
    pub fn close_request(&mut self, stream_id: StreamId) -> Result<(), WatchlistError> {
        if self.login.user_id() == Some(stream_id) {
            self.close_login();
            return Ok(());
        }
        if self.directory.requests.remove(&stream_id).is_some() {
            debug!(stream_id, "Directory request closed");
            return Ok(());
        }
        let handle = self
            .requests_by_id
            .get(&stream_id)
            .copied()
            .ok_or(WatchlistError::UnknownStream(stream_id))?;
        self.close_item_request(handle);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connection entry points
    // ------------------------------------------------------------------

    /// Route one decoded inbound message.
    pub fn read_msg(&mut self, msg: Msg) -> Result<(), WatchlistError> {
        self.read_msg_at(msg, Instant::now())
    }

    pub fn read_msg_at(&mut self, msg: Msg, now: Instant) -> Result<(), WatchlistError> {
        self.stats.msgs_received += 1;
        let stream_id = msg.stream_id();
        trace!(stream_id, class = msg.class_label(), "Message received");

        match stream_id {
            LOGIN_STREAM_ID => self.read_login_msg(msg),
            DIRECTORY_STREAM_ID => self.read_directory_msg(msg),
            _ => match self.streams.handle_for(stream_id) {
                Some(handle) => self.read_item_msg(handle, msg, now),
                None => {
                    warn!(stream_id, class = msg.class_label(), "Message for unknown stream dropped")
                }
            },
        }
        self.publish_next_timeout();
        Ok(())
    }

    /// Decode `bytes` with the codec and route the message.
    pub fn read_bytes(&mut self, bytes: &[u8]) -> Result<(), WatchlistError> {
        let msg = self.codec.decode(bytes)?;
        self.read_msg(msg)
    }

    /// Run expired timers and send queued work.
    pub fn dispatch(&mut self) -> Result<(), WatchlistError> {
        self.dispatch_at(Instant::now())
    }

    pub fn dispatch_at(&mut self, now: Instant) -> Result<(), WatchlistError> {
        while let Some((timer, owner)) = self.timers.try_get_expired_timer(now) {
            self.on_timeout(timer, owner);
        }
        let result = self.flush(now);
        self.publish_next_timeout();
        result
    }

    /// The channel is connected: resend login, then recover everything else.
    pub fn channel_up(&mut self) -> Result<(), WatchlistError> {
        self.channel_up_at(Instant::now())
    }

    pub fn channel_up_at(&mut self, now: Instant) -> Result<(), WatchlistError> {
        info!(streams = self.streams.len(), "Channel up");
        self.channel_up = true;
        self.login.send_pending = self.login.request.is_some();
        let result = self.flush(now);
        self.publish_next_timeout();
        result
    }

    /// The channel is gone: every stream needs a refresh once it is back.
    pub fn channel_down(&mut self) {
        info!(
            streams = self.streams.len(),
            posts = self.outstanding_posts,
            "Channel down"
        );
        self.channel_up = false;
        let stopped = self.timers.stop_all();
        self.pending_closes.clear();
        self.open_window.clear();
        self.item_groups.clear();

        self.control_channel_down();
        self.items_channel_down();
        debug!(timers = stopped, "Timers stopped");
        self.publish_next_timeout();
    }

    // ------------------------------------------------------------------
    // Outbound to the application
    // ------------------------------------------------------------------

    pub fn poll_event(&mut self) -> Option<WatchlistEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<WatchlistEvent> {
        self.events.drain(..).collect()
    }

    /// Earliest timer deadline, for the caller's event loop.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timers.next_expiration()
    }

    /// Hand deadlines to a notifier task from now on.
    pub fn attach_notifier(&mut self, notifier: TimeoutNotifier) {
        notifier.schedule(self.next_timeout());
        self.notifier = Some(notifier);
    }

    pub fn stats(&self) -> WatchlistStats {
        self.stats
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn config(&self) -> &WatchlistConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn service_cache(&self) -> &ServiceCache {
        &self.services
    }

    pub fn item_groups(&self) -> &ItemGroupTable {
        &self.item_groups
    }

    pub fn is_channel_up(&self) -> bool {
        self.channel_up
    }

    pub fn is_login_established(&self) -> bool {
        self.login.established
    }

    /// Login and directory are both in place; item requests can flow.
    pub fn is_ready(&self) -> bool {
        self.channel_up && self.login.established && self.directory.established
    }

    pub fn request_state(&self, stream_id: StreamId) -> Option<RequestState> {
        self.request_by_id(stream_id).map(|r| r.state)
    }

    pub fn request(&self, stream_id: StreamId) -> Option<&ItemRequest> {
        self.request_by_id(stream_id)
    }

    /// Wire stream id carrying an application stream.
    pub fn wire_stream_id(&self, stream_id: StreamId) -> Option<StreamId> {
        self.request_by_id(stream_id)
            .and_then(|r| r.stream)
            .and_then(|h| self.streams.get(h))
            .map(|s| s.stream_id)
    }

    pub fn stream(&self, wire_stream_id: StreamId) -> Option<&ItemStream> {
        self.streams
            .handle_for(wire_stream_id)
            .and_then(|h| self.streams.get(h))
    }

    /// Open item streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn active_timer_count(&self) -> usize {
        self.timers.active_count()
    }

    pub fn outstanding_posts(&self) -> usize {
        self.outstanding_posts
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    fn request_by_id(&self, stream_id: StreamId) -> Option<&ItemRequest> {
        self.requests_by_id
            .get(&stream_id)
            .and_then(|h| self.requests.get(*h))
    }

    /// Application stream id already names a login, directory or item stream.
    fn stream_id_in_use(&self, stream_id: StreamId) -> bool {
        self.login.user_id() == Some(stream_id)
            || self.directory.requests.contains_key(&stream_id)
            || self.requests_by_id.contains_key(&stream_id)
    }

    /// Encode and submit one message.
    fn send(&mut self, msg: &Msg) -> Result<(), WatchlistError> {
        if !self.channel_up {
            return Err(WatchlistError::NotConnected);
        }
        let mut buffer = self.transport.get_buffer(SEND_BUFFER_SIZE)?;
        if let Err(err) = self.codec.encode(msg, &mut buffer) {
            self.transport.release(buffer);
            return Err(err.into());
        }
        match self.transport.submit(buffer) {
            SubmitStatus::Success | SubmitStatus::WriteRetry => {
                self.stats.msgs_sent += 1;
                trace!(stream_id = msg.stream_id(), class = msg.class_label(), "Message sent");
                Ok(())
            }
            SubmitStatus::Failure(reason) => {
                error!(
                    stream_id = msg.stream_id(),
                    class = msg.class_label(),
                    %reason,
                    "Submit failed"
                );
                Err(WatchlistError::ChannelFailure { reason })
            }
        }
    }

    /// Close a wire stream, queueing the close if no buffer is free.
    fn send_close(&mut self, stream_id: StreamId, domain: DomainType) {
        if !self.channel_up {
            return;
        }
        let close = CloseMsg { stream_id, domain };
        match self.send(&Msg::Close(close.clone())) {
            Ok(()) => {}
            Err(WatchlistError::NoBuffers) => self.pending_closes.push_back(close),
            Err(err) => warn!(stream_id, error = %err, "Close not sent"),
        }
    }

    /// Queue a message for the application under `stream_id`.
    fn deliver(&mut self, stream_id: StreamId, mut msg: Msg, service_name: Option<String>) {
        msg.set_stream_id(stream_id);
        self.events.push_back(WatchlistEvent::new(msg, service_name));
    }

    fn deliver_to_request(&mut self, handle: Handle, msg: Msg) {
        let Some(request) = self.requests.get(handle) else {
            return;
        };
        let stream_id = request.user_id;
        let service_name = match &request.binding {
            ServiceBinding::Name(name) => Some(name.clone()),
            ServiceBinding::Id(id) => self.services.service_name(*id).map(str::to_string),
        };
        self.deliver(stream_id, msg, service_name);
    }

    /// Send everything that is queued, in dependency order.
    fn flush(&mut self, now: Instant) -> Result<(), WatchlistError> {
        if !self.channel_up {
            return Ok(());
        }

        while let Some(close) = self.pending_closes.pop_front() {
            if let Err(err) = self.send(&Msg::Close(close.clone())) {
                self.pending_closes.push_front(close);
                return retry_later(err);
            }
        }

        if self.login.send_pending {
            if let Err(err) = self.send_login_request() {
                return retry_later(err);
            }
        }
        if self.directory.send_pending && self.login.established {
            if let Err(err) = self.send_directory_request() {
                return retry_later(err);
            }
        }

        if !self.is_ready() {
            return Ok(());
        }
        self.flush_item_requests(now)
    }

    fn on_timeout(&mut self, timer: TimerId, owner: TimerOwner) {
        match owner {
            TimerOwner::RequestTimeout(stream_id) => self.on_request_timeout(stream_id),
            TimerOwner::PostAck { stream_id, key } => self.on_post_timeout(timer, stream_id, key),
        }
    }

    fn publish_next_timeout(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.schedule(self.timers.next_expiration());
        }
    }
}

impl<T: Transport, C: Codec> std::fmt::Debug for Watchlist<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchlist")
            .field("channel_up", &self.channel_up)
            .field("streams", &self.streams.len())
            .field("requests", &self.requests.len())
            .field("services", &self.services.len())
            .field("outstanding_posts", &self.outstanding_posts)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SendBuffer, TransportError};
    use feed_types::prelude::*;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Wire {
        sent: Vec<Msg>,
        no_buffers: bool,
    }

    impl Transport for Wire {
        fn get_buffer(&mut self, size_hint: usize) -> Result<SendBuffer, TransportError> {
            if self.no_buffers {
                return Err(TransportError::NoBuffers);
            }
            Ok(SendBuffer::with_capacity(size_hint))
        }

        fn submit(&mut self, buffer: SendBuffer) -> SubmitStatus {
            match JsonCodec.decode(buffer.as_slice()) {
                Ok(msg) => {
                    self.sent.push(msg);
                    SubmitStatus::Success
                }
                Err(err) => SubmitStatus::Failure(err.to_string()),
            }
        }

        fn release(&mut self, _buffer: SendBuffer) {}
    }

    fn watchlist() -> Watchlist<Wire> {
        Watchlist::new(WatchlistConfig::default(), Wire::default(), JsonCodec).unwrap()
    }

    fn login() -> Msg {
        Msg::Request(RequestMsg::new(
            10,
            DomainType::Login,
            MsgKey::named("user"),
        ))
    }

    /// Channel up, login and a one-service directory.
    fn ready(wl: &mut Watchlist<Wire>, now: Instant) {
        wl.submit_msg_at(login(), &SubmitOptions::default(), now).unwrap();
        wl.channel_up_at(now).unwrap();
        wl.read_msg_at(
            Msg::Refresh(RefreshMsg::new(LOGIN_STREAM_ID, DomainType::Login, State::open_ok())),
            now,
        )
        .unwrap();
        wl.dispatch_at(now).unwrap();
        let services = vec![ServiceEntry::up(1, "ELEKTRON", vec![DomainType::MarketPrice])];
        wl.read_msg_at(
            Msg::Refresh(
                RefreshMsg::new(DIRECTORY_STREAM_ID, DomainType::Source, State::open_ok())
                    .with_payload(Payload::ServiceList(services)),
            ),
            now,
        )
        .unwrap();
        wl.drain_events();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = WatchlistConfig {
            request_timeout_ms: 0,
            ..WatchlistConfig::default()
        };
        let err = Watchlist::new(config, Wire::default(), JsonCodec).unwrap_err();
        assert!(matches!(err, WatchlistError::Config(_)));
    }

    #[test]
    fn test_login_sent_on_channel_up() {
        let mut wl = watchlist();
        wl.submit_msg(login(), &SubmitOptions::default()).unwrap();
        assert!(wl.transport().sent.is_empty());

        wl.channel_up().unwrap();
        assert_eq!(wl.transport().sent.len(), 1);
        assert_eq!(wl.transport().sent[0].stream_id(), LOGIN_STREAM_ID);
        assert!(!wl.is_ready());
    }

    #[test]
    fn test_directory_requested_after_login() {
        let now = Instant::now();
        let mut wl = watchlist();
        ready(&mut wl, now);

        let sent = &wl.transport().sent;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].stream_id(), DIRECTORY_STREAM_ID);
        assert_eq!(sent[1].domain(), DomainType::Source);
        assert!(wl.is_ready());
        assert_eq!(wl.service_cache().service_id("ELEKTRON"), Some(1));
    }

    #[test]
    fn test_cannot_submit_refresh() {
        let mut wl = watchlist();
        let refresh = Msg::Refresh(RefreshMsg::new(5, DomainType::MarketPrice, State::open_ok()));
        assert!(wl
            .submit_msg(refresh, &SubmitOptions::default())
            .unwrap_err()
            .is_invalid_usage());
    }

    #[test]
    fn test_non_positive_stream_id_rejected() {
        let mut wl = watchlist();
        let request = Msg::Request(RequestMsg::new(0, DomainType::MarketPrice, MsgKey::named("A")));
        assert!(wl.submit_msg(request, &SubmitOptions::service_name("ELEKTRON")).is_err());
    }

    #[test]
    fn test_unknown_inbound_stream_dropped() {
        let mut wl = watchlist();
        let update = Msg::Update(UpdateMsg::new(99, DomainType::MarketPrice, Payload::None));
        wl.read_msg(update).unwrap();
        assert!(wl.poll_event().is_none());
        assert_eq!(wl.stats().msgs_received, 1);
    }

    #[test]
    fn test_close_unknown_stream() {
        let mut wl = watchlist();
        assert_eq!(wl.close_request(42), Err(WatchlistError::UnknownStream(42)));
    }

    #[test]
    fn test_no_buffers_keeps_login_pending() {
        let mut wl = watchlist();
        wl.submit_msg(login(), &SubmitOptions::default()).unwrap();
        wl.transport_mut().no_buffers = true;
        wl.channel_up().unwrap();
        assert!(wl.transport().sent.is_empty());

        wl.transport_mut().no_buffers = false;
        wl.dispatch().unwrap();
        assert_eq!(wl.transport().sent.len(), 1);
    }

    #[test]
    fn test_next_timeout_follows_request_timer() {
        let now = Instant::now();
        let mut wl = watchlist();
        ready(&mut wl, now);
        assert_eq!(wl.next_timeout(), None);

        let request = Msg::Request(RequestMsg::new(5, DomainType::MarketPrice, MsgKey::named("TRI.N")));
        wl.submit_msg_at(request, &SubmitOptions::service_name("ELEKTRON"), now)
            .unwrap();
        wl.dispatch_at(now).unwrap();
        assert_eq!(
            wl.next_timeout(),
            Some(now + Duration::from_millis(wl.config().request_timeout_ms))
        );
    }
}
