//! Shared harness for the watchlist integration tests
//!
//! Drives a watchlist over a recording transport and a manual clock.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use feed_types::prelude::*;
use watchlist::{
    Codec, JsonCodec, SendBuffer, SubmitOptions, SubmitStatus, Transport, TransportError,
    Watchlist, WatchlistConfig, WatchlistError, WatchlistEvent,
};

pub const LOGIN_USER_ID: StreamId = 10;
pub const SERVICE_NAME: &str = "ELEKTRON";
pub const SERVICE_ID: ServiceId = 1;

/// Transport that decodes and keeps everything submitted to it.
#[derive(Debug, Default)]
pub struct Recorder {
    pub sent: Vec<Msg>,
    pub no_buffers: bool,
    pub released: usize,
    /// Refuse every submit with this reason.
    pub fail_with: Option<String>,
    /// Accept submits but report them as queued for a later write.
    pub write_retry: bool,
}

impl Transport for Recorder {
    fn get_buffer(&mut self, size_hint: usize) -> Result<SendBuffer, TransportError> {
        if self.no_buffers {
            return Err(TransportError::NoBuffers);
        }
        Ok(SendBuffer::with_capacity(size_hint))
    }

    fn submit(&mut self, buffer: SendBuffer) -> SubmitStatus {
        if let Some(reason) = &self.fail_with {
            return SubmitStatus::Failure(reason.clone());
        }
        match JsonCodec.decode(buffer.as_slice()) {
            Ok(msg) => {
                self.sent.push(msg);
                if self.write_retry {
                    SubmitStatus::WriteRetry
                } else {
                    SubmitStatus::Success
                }
            }
            Err(err) => SubmitStatus::Failure(err.to_string()),
        }
    }

    fn release(&mut self, _buffer: SendBuffer) {
        self.released += 1;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn default_services() -> Vec<ServiceEntry> {
    vec![ServiceEntry::up(
        SERVICE_ID,
        SERVICE_NAME,
        vec![
            DomainType::MarketPrice,
            DomainType::MarketByPrice,
            DomainType::SymbolList,
        ],
    )]
}

pub fn item(stream_id: StreamId, name: &str) -> RequestMsg {
    RequestMsg::new(stream_id, DomainType::MarketPrice, MsgKey::named(name))
}

pub fn by_name() -> SubmitOptions {
    SubmitOptions::service_name(SERVICE_NAME)
}

pub struct Harness {
    pub wl: Watchlist<Recorder>,
    pub now: Instant,
}

impl Harness {
    pub fn new(config: WatchlistConfig) -> Self {
        init_tracing();
        Self {
            wl: Watchlist::new(config, Recorder::default(), JsonCodec).unwrap(),
            now: Instant::now(),
        }
    }

    /// Logged in with the default directory, nothing left in the queues.
    pub fn ready() -> Self {
        Self::ready_with(WatchlistConfig::default(), default_services())
    }

    pub fn ready_with(config: WatchlistConfig, services: Vec<ServiceEntry>) -> Self {
        let mut h = Self::new(config);
        let login = RequestMsg::new(LOGIN_USER_ID, DomainType::Login, MsgKey::named("user"));
        h.submit(Msg::Request(login), SubmitOptions::default()).unwrap();
        h.wl.channel_up_at(h.now).unwrap();
        h.establish(services);
        h.take_sent();
        h.events();
        h
    }

    /// Answer the login, let the directory request out and answer it.
    pub fn establish(&mut self, services: Vec<ServiceEntry>) {
        self.read(Msg::Refresh(RefreshMsg::new(
            LOGIN_STREAM_ID,
            DomainType::Login,
            State::open_ok(),
        )));
        self.dispatch();
        self.read(Msg::Refresh(
            RefreshMsg::new(DIRECTORY_STREAM_ID, DomainType::Source, State::open_ok())
                .with_payload(Payload::ServiceList(services)),
        ));
        assert!(self.wl.is_ready());
    }

    pub fn submit(&mut self, msg: Msg, options: SubmitOptions) -> Result<(), WatchlistError> {
        self.wl.submit_msg_at(msg, &options, self.now)
    }

    pub fn request(&mut self, request: RequestMsg) -> Result<(), WatchlistError> {
        self.submit(Msg::Request(request), by_name())
    }

    pub fn read(&mut self, msg: Msg) {
        self.wl.read_msg_at(msg, self.now).unwrap();
    }

    pub fn dispatch(&mut self) {
        self.wl.dispatch_at(self.now).unwrap();
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn take_sent(&mut self) -> Vec<Msg> {
        std::mem::take(&mut self.wl.transport_mut().sent)
    }

    pub fn events(&mut self) -> Vec<WatchlistEvent> {
        self.wl.drain_events()
    }

    /// Answer the outstanding request on `wire_id` with a complete refresh.
    pub fn refresh(&mut self, wire_id: StreamId) {
        self.read(Msg::Refresh(RefreshMsg::new(
            wire_id,
            DomainType::MarketPrice,
            State::open_ok(),
        )));
    }

    pub fn directory_update(&mut self, entries: Vec<ServiceEntry>) {
        self.read(Msg::Update(UpdateMsg::new(
            DIRECTORY_STREAM_ID,
            DomainType::Source,
            Payload::ServiceList(entries),
        )));
    }
}

pub fn requests_sent(sent: &[Msg]) -> Vec<&RequestMsg> {
    sent.iter()
        .filter_map(|msg| match msg {
            Msg::Request(request) => Some(request),
            _ => None,
        })
        .collect()
}

pub fn status_of(event: &WatchlistEvent) -> Option<&State> {
    match &event.msg {
        Msg::Status(status) => status.state.as_ref(),
        _ => None,
    }
}
