//! Item streams: what the wire actually carries
//!
//! An [`ItemStream`] is one request/response exchange with the provider.
//! Requests whose resolved (domain, key, QoS) are equal share one stream;
//! the stream sends a single request that aggregates their view, priority
//! and pause intent.

use feed_types::domain::DomainType;
use feed_types::ids::{ServiceId, StreamId};
use feed_types::key::MsgKey;
use feed_types::msg::Priority;
use feed_types::qos::Qos;
use feed_types::view::ViewSpec;

use crate::list::IndexList;
use crate::pool::Poolable;
use crate::post::PostTable;
use crate::timer::TimerId;
use crate::view::AggregateView;

/// Refresh bookkeeping of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshState {
    #[default]
    None,
    /// Needs a refresh but the service's open window is full
    OpenWindowBlocked,
    /// A request asking for a refresh must be sent
    NeedsRefresh,
    RefreshPending,
    /// The outstanding refresh answers a view change
    ViewRefreshPending,
    /// Some parts of a multi-part refresh arrived
    PartialRefreshPending,
}

impl RefreshState {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            RefreshState::RefreshPending
                | RefreshState::ViewRefreshPending
                | RefreshState::PartialRefreshPending
        )
    }
}

/// Provider-side state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolState {
    #[default]
    Closed,
    Open,
    Suspect,
}

/// What makes two requests shareable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamAttributes {
    pub domain: DomainType,
    /// Key including the resolved service id
    pub key: MsgKey,
    pub qos: Qos,
}

impl Default for StreamAttributes {
    fn default() -> Self {
        Self {
            domain: DomainType::MarketPrice,
            key: MsgKey::default(),
            qos: Qos::realtime(),
        }
    }
}

/// One item stream and the requests sharing it.
#[derive(Debug, Default)]
pub struct ItemStream {
    pub stream_id: StreamId,
    pub service_id: ServiceId,
    pub attributes: StreamAttributes,
    pub private_stream: bool,
    pub protocol_state: ProtocolState,
    pub refresh_state: RefreshState,
    /// Queued for sending
    pub msg_pending: bool,
    /// The next send must solicit a refresh
    pub refresh_requested: bool,
    /// Pause currently on the wire
    pub paused: bool,
    /// A request went out and the provider has not closed the stream since
    pub established: bool,
    /// Requests sharing the stream, in attach order
    pub requests: IndexList,
    /// Streaming requests; snapshots are not counted
    pub streaming_count: usize,
    /// Streaming requests that asked for a pause. The wire pauses when it
    /// reaches `streaming_count`.
    pub paused_count: usize,
    /// Requests carrying a view
    pub view_count: usize,
    pub aggregate_view: Option<AggregateView>,
    /// The last request sent carried a view
    pub wire_view: bool,
    /// Priority carried by the last request sent
    pub wire_priority: Option<Priority>,
    /// Posts awaiting an ack on this stream
    pub posts: PostTable,
    pub request_timer: Option<TimerId>,
    /// Counted against the service's open window
    pub in_open_window: bool,
}

impl Poolable for ItemStream {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl ItemStream {
    pub fn open(
        &mut self,
        stream_id: StreamId,
        service_id: ServiceId,
        attributes: StreamAttributes,
        private_stream: bool,
    ) {
        self.stream_id = stream_id;
        self.service_id = service_id;
        self.attributes = attributes;
        self.private_stream = private_stream;
    }

    pub fn domain(&self) -> DomainType {
        self.attributes.domain
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_count > 0
    }

    /// Pause goes on the wire only when every streaming request is paused.
    pub fn wire_pause(&self) -> bool {
        self.streaming_count > 0 && self.paused_count == self.streaming_count
    }

    /// Aggregate view for the next send. A single request without a view
    /// widens the stream to every field.
    pub fn desired_view(&self) -> Option<ViewSpec> {
        if self.view_count == 0 || self.view_count != self.requests.len() {
            return None;
        }
        self.aggregate_view.as_ref().and_then(AggregateView::wire_view)
    }
}

/// Highest priority class among `priorities`, with the counts at that class
/// summed. `None` when the result is the default priority.
pub fn aggregate_priority(priorities: impl IntoIterator<Item = Priority>) -> Option<Priority> {
    let mut best: Option<Priority> = None;
    for priority in priorities {
        best = Some(match best {
            Some(current) if current.class > priority.class => current,
            Some(current) if current.class == priority.class => Priority {
                class: current.class,
                count: current.count.saturating_add(priority.count),
            },
            _ => priority,
        });
    }
    best.filter(|p| *p != Priority::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::View;
    use feed_types::view::ViewKind;

    #[test]
    fn test_attributes_equality_includes_service() {
        let a = StreamAttributes {
            domain: DomainType::MarketPrice,
            key: MsgKey::named("TRI.N").with_service_id(1),
            qos: Qos::realtime(),
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.key.service_id = Some(2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut stream = ItemStream::default();
        stream.open(7, 1, StreamAttributes::default(), true);
        stream.msg_pending = true;
        stream.streaming_count = 2;
        stream.reset();
        assert_eq!(stream.stream_id, 0);
        assert!(!stream.private_stream);
        assert!(!stream.msg_pending);
        assert_eq!(stream.streaming_count, 0);
    }

    #[test]
    fn test_wire_pause_needs_every_streaming_request() {
        let mut stream = ItemStream::default();
        assert!(!stream.wire_pause());
        stream.streaming_count = 2;
        stream.paused_count = 1;
        assert!(!stream.wire_pause());
        stream.paused_count = 2;
        assert!(stream.wire_pause());
    }

    #[test]
    fn test_desired_view_requires_all_requests() {
        let mut stream = ItemStream::default();
        let mut aggregate = AggregateView::new(ViewKind::FieldIdList);
        aggregate
            .add_view(5, View::new(&ViewSpec::FieldIds(vec![22, 25])).unwrap())
            .unwrap();
        aggregate.merge();
        stream.aggregate_view = Some(aggregate);
        stream.view_count = 1;

        // No requests linked: counts disagree
        assert_eq!(stream.desired_view(), None);
    }

    #[test]
    fn test_priority_aggregation() {
        let p = |class, count| Priority { class, count };
        assert_eq!(aggregate_priority([]), None);
        assert_eq!(aggregate_priority([p(1, 1)]), None);
        assert_eq!(aggregate_priority([p(1, 1), p(1, 1)]), Some(p(1, 2)));
        assert_eq!(aggregate_priority([p(1, 5), p(3, 1), p(3, 2)]), Some(p(3, 3)));
    }

    #[test]
    fn test_refresh_state_pending() {
        assert!(RefreshState::RefreshPending.is_pending());
        assert!(RefreshState::PartialRefreshPending.is_pending());
        assert!(!RefreshState::NeedsRefresh.is_pending());
        assert!(!RefreshState::OpenWindowBlocked.is_pending());
    }
}
