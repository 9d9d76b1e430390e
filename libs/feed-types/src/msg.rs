//! Message classes
//!
//! The watchlist sees messages in decoded form. Byte-level encoding belongs
//! to the codec collaborator; payloads the watchlist does not interpret stay
//! opaque bytes.

use serde::{Deserialize, Serialize};

use crate::directory::{ServiceEntry, SymbolListEntry};
use crate::domain::DomainType;
use crate::ids::{GroupId, StreamId};
use crate::key::MsgKey;
use crate::qos::Qos;
use crate::state::State;
use crate::view::ViewAction;

/// Decoded payload of a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    #[default]
    None,
    /// Encoded container the watchlist passes through untouched
    Opaque(Vec<u8>),
    /// Directory map
    ServiceList(Vec<ServiceEntry>),
    /// Symbol-list map
    SymbolList(Vec<SymbolListEntry>),
}

/// Request priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Priority {
    pub class: u8,
    pub count: u16,
}

impl Default for Priority {
    fn default() -> Self {
        Self { class: 1, count: 1 }
    }
}

/// Negative acknowledgement codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NakCode {
    AccessDenied,
    DeniedBySource,
    SourceDown,
    SourceUnknown,
    NoResources,
    NoResponse,
    GatewayDown,
    SymbolUnknown,
    NotOpen,
    InvalidContent,
}

/// Open, reissue or pause a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: MsgKey,
    pub qos: Option<Qos>,
    pub worst_qos: Option<Qos>,
    pub priority: Option<Priority>,
    pub streaming: bool,
    pub pause: bool,
    pub no_refresh: bool,
    pub private_stream: bool,
    pub view: ViewAction,
    /// Item names for a batch request; empty for a single item
    pub batch: Vec<String>,
    /// Symbol list only: open a data stream for every symbol in the list
    pub symbol_list_data_streams: bool,
    pub extended_header: Option<Vec<u8>>,
    pub payload: Payload,
}

impl RequestMsg {
    /// Streaming request with no view, QoS or priority.
    pub fn new(stream_id: StreamId, domain: DomainType, key: MsgKey) -> Self {
        Self {
            stream_id,
            domain,
            key,
            qos: None,
            worst_qos: None,
            priority: None,
            streaming: true,
            pause: false,
            no_refresh: false,
            private_stream: false,
            view: ViewAction::None,
            batch: Vec::new(),
            symbol_list_data_streams: false,
            extended_header: None,
            payload: Payload::None,
        }
    }

    pub fn with_view(mut self, view: ViewAction) -> Self {
        self.view = view;
        self
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn with_priority(mut self, class: u8, count: u16) -> Self {
        self.priority = Some(Priority { class, count });
        self
    }

    pub fn snapshot(mut self) -> Self {
        self.streaming = false;
        self
    }

    pub fn with_batch(mut self, names: Vec<String>) -> Self {
        self.batch = names;
        self
    }
}

/// Full image of a stream, possibly in several parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: Option<MsgKey>,
    pub qos: Option<Qos>,
    pub state: State,
    pub solicited: bool,
    /// Last part of the image
    pub complete: bool,
    pub clear_cache: bool,
    pub group_id: Option<GroupId>,
    pub seq_num: Option<u32>,
    pub part_num: Option<u16>,
    pub payload: Payload,
}

impl RefreshMsg {
    /// Single-part solicited refresh
    pub fn new(stream_id: StreamId, domain: DomainType, state: State) -> Self {
        Self {
            stream_id,
            domain,
            key: None,
            qos: None,
            state,
            solicited: true,
            complete: true,
            clear_cache: false,
            group_id: None,
            seq_num: None,
            part_num: None,
            payload: Payload::None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn partial(mut self) -> Self {
        self.complete = false;
        self
    }

    pub fn unsolicited(mut self) -> Self {
        self.solicited = false;
        self
    }
}

/// Incremental change to a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: Option<MsgKey>,
    pub update_type: u8,
    pub seq_num: Option<u32>,
    pub payload: Payload,
}

impl UpdateMsg {
    pub fn new(stream_id: StreamId, domain: DomainType, payload: Payload) -> Self {
        Self {
            stream_id,
            domain,
            key: None,
            update_type: 0,
            seq_num: None,
            payload,
        }
    }
}

/// State change without data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: Option<MsgKey>,
    pub state: Option<State>,
    pub group_id: Option<GroupId>,
    pub clear_cache: bool,
    pub payload: Payload,
}

impl StatusMsg {
    pub fn new(stream_id: StreamId, domain: DomainType, state: State) -> Self {
        Self {
            stream_id,
            domain,
            key: None,
            state: Some(state),
            group_id: None,
            clear_cache: false,
            payload: Payload::None,
        }
    }
}

/// Close a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
}

/// Application-originated write, optionally acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: Option<MsgKey>,
    pub post_id: Option<u32>,
    pub seq_num: Option<u32>,
    pub ack_requested: bool,
    /// Last part of a multi-part post
    pub complete: bool,
    pub part_num: Option<u16>,
    pub payload: Payload,
}

impl PostMsg {
    /// Single-part post with no id
    pub fn new(stream_id: StreamId, domain: DomainType, payload: Payload) -> Self {
        Self {
            stream_id,
            domain,
            key: None,
            post_id: None,
            seq_num: None,
            ack_requested: false,
            complete: true,
            part_num: None,
            payload,
        }
    }

    /// Request an acknowledgement for `post_id`.
    pub fn acked(mut self, post_id: u32, seq_num: Option<u32>) -> Self {
        self.post_id = Some(post_id);
        self.seq_num = seq_num;
        self.ack_requested = true;
        self
    }
}

/// Acknowledgement (or negative acknowledgement) of a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: Option<MsgKey>,
    pub ack_id: u32,
    pub seq_num: Option<u32>,
    pub nak_code: Option<NakCode>,
    pub text: Option<String>,
}

impl AckMsg {
    pub fn new(stream_id: StreamId, domain: DomainType, ack_id: u32, seq_num: Option<u32>) -> Self {
        Self {
            stream_id,
            domain,
            key: None,
            ack_id,
            seq_num,
            nak_code: None,
            text: None,
        }
    }

    pub fn is_nak(&self) -> bool {
        self.nak_code.is_some()
    }
}

/// Bidirectional message outside the refresh/update model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: Option<MsgKey>,
    pub seq_num: Option<u32>,
    pub complete: bool,
    pub payload: Payload,
}

/// Any message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum Msg {
    Request(RequestMsg),
    Refresh(RefreshMsg),
    Update(UpdateMsg),
    Status(StatusMsg),
    Close(CloseMsg),
    Post(PostMsg),
    Ack(AckMsg),
    Generic(GenericMsg),
}

impl Msg {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Msg::Request(m) => m.stream_id,
            Msg::Refresh(m) => m.stream_id,
            Msg::Update(m) => m.stream_id,
            Msg::Status(m) => m.stream_id,
            Msg::Close(m) => m.stream_id,
            Msg::Post(m) => m.stream_id,
            Msg::Ack(m) => m.stream_id,
            Msg::Generic(m) => m.stream_id,
        }
    }

    pub fn set_stream_id(&mut self, stream_id: StreamId) {
        match self {
            Msg::Request(m) => m.stream_id = stream_id,
            Msg::Refresh(m) => m.stream_id = stream_id,
            Msg::Update(m) => m.stream_id = stream_id,
            Msg::Status(m) => m.stream_id = stream_id,
            Msg::Close(m) => m.stream_id = stream_id,
            Msg::Post(m) => m.stream_id = stream_id,
            Msg::Ack(m) => m.stream_id = stream_id,
            Msg::Generic(m) => m.stream_id = stream_id,
        }
    }

    pub fn domain(&self) -> DomainType {
        match self {
            Msg::Request(m) => m.domain,
            Msg::Refresh(m) => m.domain,
            Msg::Update(m) => m.domain,
            Msg::Status(m) => m.domain,
            Msg::Close(m) => m.domain,
            Msg::Post(m) => m.domain,
            Msg::Ack(m) => m.domain,
            Msg::Generic(m) => m.domain,
        }
    }

    /// Get the message class as a string label for logging.
    pub fn class_label(&self) -> &'static str {
        match self {
            Msg::Request(_) => "Request",
            Msg::Refresh(_) => "Refresh",
            Msg::Update(_) => "Update",
            Msg::Status(_) => "Status",
            Msg::Close(_) => "Close",
            Msg::Post(_) => "Post",
            Msg::Ack(_) => "Ack",
            Msg::Generic(_) => "Generic",
        }
    }

    /// State carried by refresh and status messages
    pub fn state(&self) -> Option<&State> {
        match self {
            Msg::Refresh(m) => Some(&m.state),
            Msg::Status(m) => m.state.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StreamState;

    #[test]
    fn test_request_defaults() {
        let req = RequestMsg::new(5, DomainType::MarketPrice, MsgKey::named("TRI.N"));
        assert!(req.streaming);
        assert!(!req.pause);
        assert_eq!(req.view, ViewAction::None);
        assert!(req.batch.is_empty());
        assert!(!req.clone().snapshot().streaming);
    }

    #[test]
    fn test_stream_id_accessors() {
        let mut msg = Msg::Close(CloseMsg {
            stream_id: 7,
            domain: DomainType::MarketPrice,
        });
        assert_eq!(msg.stream_id(), 7);
        msg.set_stream_id(11);
        assert_eq!(msg.stream_id(), 11);
        assert_eq!(msg.class_label(), "Close");
        assert_eq!(msg.domain(), DomainType::MarketPrice);
    }

    #[test]
    fn test_state_accessor() {
        let refresh = Msg::Refresh(RefreshMsg::new(3, DomainType::MarketPrice, State::open_ok()));
        assert_eq!(refresh.state().map(|s| s.stream_state), Some(StreamState::Open));

        let update = Msg::Update(UpdateMsg::new(3, DomainType::MarketPrice, Payload::None));
        assert!(update.state().is_none());
    }

    #[test]
    fn test_post_acked_builder() {
        let post = PostMsg::new(4, DomainType::MarketPrice, Payload::Opaque(vec![1, 2])).acked(5, Some(0));
        assert_eq!(post.post_id, Some(5));
        assert_eq!(post.seq_num, Some(0));
        assert!(post.ack_requested);
        assert!(post.complete);
    }

    #[test]
    fn test_msg_json_tagging() {
        let msg = Msg::Ack(AckMsg::new(4, DomainType::MarketPrice, 5, None));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"class\":\"Ack\""));
        let back: Msg = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
