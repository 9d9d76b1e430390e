//! Application-visible item requests
//!
//! One [`ItemRequest`] exists per application stream id. It remembers what
//! the application asked for (service binding, view, priority, pause) so
//! that a reissue can be checked against it before anything changes.

use feed_types::domain::DomainType;
use feed_types::ids::{ServiceId, StreamId};
use feed_types::key::MsgKey;
use feed_types::msg::{Priority, RequestMsg};
use feed_types::qos::Qos;
use feed_types::view::{ViewAction, ViewKind};

use crate::arena::Handle;
use crate::error::WatchlistError;
use crate::events::SubmitOptions;
use crate::list::{Link, Linked};
use crate::view::View;

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestState {
    /// Not attached to a stream (waiting for a service)
    #[default]
    None,
    /// Attached; the stream has not yet sent on its behalf
    PendingRequest,
    /// Sent; waiting for the first refresh part
    PendingRefresh,
    /// Some refresh parts received; waiting for the last one
    PendingCompleteRefresh,
    Open,
    ReturnToPool,
}

impl RequestState {
    /// Still owed a solicited refresh.
    pub fn awaiting_refresh(&self) -> bool {
        matches!(
            self,
            RequestState::PendingRefresh | RequestState::PendingCompleteRefresh
        )
    }
}

/// How a request names its service. Fixed for the life of the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceBinding {
    Id(ServiceId),
    Name(String),
}

impl ServiceBinding {
    /// Binding of a new request: exactly one of the key's service id and the
    /// submit option's service name.
    pub fn resolve(msg: &RequestMsg, options: &SubmitOptions) -> Result<Self, WatchlistError> {
        match (msg.key.service_id, options.service_name.as_ref()) {
            (Some(_), Some(_)) => Err(WatchlistError::invalid_usage(
                "Request has both a service name and a service id.",
            )),
            (Some(id), None) => Ok(ServiceBinding::Id(id)),
            (None, Some(name)) => Ok(ServiceBinding::Name(name.clone())),
            (None, None) => Err(WatchlistError::invalid_usage(
                "Request has neither a service name nor a service id.",
            )),
        }
    }

    /// The reissued message names the same service in the same way.
    fn matches(&self, msg: &RequestMsg, options: &SubmitOptions) -> bool {
        match self {
            ServiceBinding::Id(id) => {
                options.service_name.is_none() && msg.key.service_id == Some(*id)
            }
            ServiceBinding::Name(name) => {
                msg.key.service_id.is_none() && options.service_name.as_deref() == Some(name)
            }
        }
    }
}

/// What a reissue wants done to the request's view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChange {
    Keep,
    Remove,
    Replace(View),
}

/// Changes a valid reissue asks for. Nothing is applied until the caller
/// decides to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reissue {
    pub view: ViewChange,
    pub priority: Priority,
    pub paused: bool,
    /// The reissue asked for a new refresh
    pub refresh: bool,
    pub extended_header: Option<Vec<u8>>,
}

/// One application stream.
#[derive(Debug, Clone)]
pub struct ItemRequest {
    pub user_id: StreamId,
    pub domain: DomainType,
    /// Key as submitted, without its service id
    pub key: MsgKey,
    pub binding: ServiceBinding,
    pub qos: Option<Qos>,
    pub worst_qos: Option<Qos>,
    pub priority: Priority,
    pub streaming: bool,
    pub paused: bool,
    pub private_stream: bool,
    pub view: Option<View>,
    pub symbol_list_data_streams: bool,
    /// Opened by the watchlist on behalf of a symbol list
    pub provider_driven: bool,
    pub extended_header: Option<Vec<u8>>,
    pub state: RequestState,
    /// Stream the request is attached to
    pub stream: Option<Handle>,
    link: Link,
}

impl Linked for ItemRequest {
    fn link(&self) -> &Link {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

impl ItemRequest {
    pub fn new(
        msg: &RequestMsg,
        binding: ServiceBinding,
        provider_driven: bool,
    ) -> Result<Self, WatchlistError> {
        msg.validate()?;
        let view = match &msg.view {
            ViewAction::Set(spec) => Some(View::new(spec)?),
            ViewAction::None | ViewAction::Maintain => None,
        };
        let mut key = msg.key.clone();
        key.service_id = None;

        Ok(Self {
            user_id: msg.stream_id,
            domain: msg.domain,
            key,
            binding,
            qos: msg.qos,
            worst_qos: msg.worst_qos,
            priority: msg.priority.unwrap_or_default(),
            streaming: msg.streaming,
            paused: msg.pause && msg.streaming,
            private_stream: msg.private_stream,
            view,
            symbol_list_data_streams: msg.symbol_list_data_streams,
            provider_driven,
            extended_header: msg.extended_header.clone(),
            state: RequestState::None,
            stream: None,
            link: Link::default(),
        })
    }

    pub fn is_attached(&self) -> bool {
        self.stream.is_some()
    }

    pub fn view_kind(&self) -> Option<ViewKind> {
        self.view.as_ref().map(View::kind)
    }

    /// Check a reissue of this request.
    ///
    /// `stream_view_kind` is the kind of the views other requests hold on
    /// the same stream, if any. Returns the changes to apply; on error the
    /// request is untouched.
    pub fn check_reissue(
        &self,
        msg: &RequestMsg,
        options: &SubmitOptions,
        stream_view_kind: Option<ViewKind>,
    ) -> Result<Reissue, WatchlistError> {
        if !self.streaming {
            return Err(WatchlistError::invalid_usage(
                "Snapshot request may not be reissued.",
            ));
        }
        if msg.domain != self.domain {
            return Err(WatchlistError::invalid_usage(
                "Request reissue may not change the domain type.",
            ));
        }
        if !msg.batch.is_empty() {
            return Err(WatchlistError::invalid_usage(
                "Request reissue may not contain a batch.",
            ));
        }
        if !msg.streaming {
            return Err(WatchlistError::invalid_usage(
                "Request reissue may not remove the streaming flag.",
            ));
        }
        if msg.private_stream != self.private_stream {
            return Err(WatchlistError::invalid_usage(
                "Request reissue may not change the private stream flag.",
            ));
        }
        if !self.binding.matches(msg, options) {
            return Err(WatchlistError::invalid_usage(
                "Request reissue may not change the service.",
            ));
        }
        if !msg.key.matches_ignoring_service(&self.key) {
            return Err(WatchlistError::invalid_usage(
                "Request reissue may not change the message key.",
            ));
        }
        if msg.qos != self.qos || msg.worst_qos != self.worst_qos {
            return Err(WatchlistError::invalid_usage(
                "Request reissue may not change the QoS.",
            ));
        }

        let view = match &msg.view {
            ViewAction::Maintain => ViewChange::Keep,
            ViewAction::None if self.view.is_none() => ViewChange::Keep,
            ViewAction::None => ViewChange::Remove,
            ViewAction::Set(spec) => {
                let view = View::new(spec)?;
                if let Some(existing) = stream_view_kind {
                    if existing != view.kind() {
                        return Err(WatchlistError::invalid_usage(
                            "Requested view type does not match existing stream.",
                        ));
                    }
                }
                if self.view.as_ref() == Some(&view) {
                    ViewChange::Keep
                } else {
                    ViewChange::Replace(view)
                }
            }
        };

        Ok(Reissue {
            view,
            priority: msg.priority.unwrap_or(self.priority),
            paused: msg.pause,
            refresh: !msg.no_refresh,
            extended_header: msg.extended_header.clone(),
        })
    }

    /// Apply a checked reissue. Returns the request's previous view.
    pub fn apply_reissue(&mut self, reissue: &Reissue) -> Option<View> {
        self.priority = reissue.priority;
        self.paused = reissue.paused;
        if reissue.extended_header.is_some() {
            self.extended_header = reissue.extended_header.clone();
        }
        match &reissue.view {
            ViewChange::Keep => self.view.clone(),
            ViewChange::Remove => self.view.take(),
            ViewChange::Replace(view) => self.view.replace(view.clone()),
        }
    }
}
