//! Request lifecycle: reissue, pause, priority, snapshots, batches,
//! open window, symbol lists and posts

mod common;

use common::*;
use feed_types::prelude::*;
use watchlist::error::PostError;
use watchlist::request::{RequestState, ServiceBinding};
use watchlist::stream::RefreshState;
use watchlist::{SubmitOptions, WatchlistConfig, WatchlistError};

fn open_item(h: &mut Harness, id: StreamId, name: &str) -> StreamId {
    h.request(item(id, name)).unwrap();
    h.dispatch();
    let wire = h.wl.wire_stream_id(id).unwrap();
    h.refresh(wire);
    h.events();
    h.take_sent();
    wire
}

fn field_view(ids: &[i16]) -> ViewAction {
    ViewAction::Set(ViewSpec::FieldIds(ids.to_vec()))
}

#[test]
fn test_reissue_cannot_switch_binding() {
    let mut h = Harness::ready();
    h.request(item(5, "TRI.N")).unwrap();

    let by_id = RequestMsg::new(
        5,
        DomainType::MarketPrice,
        MsgKey::named("TRI.N").with_service_id(SERVICE_ID),
    );
    let err = h
        .submit(Msg::Request(by_id), SubmitOptions::default())
        .unwrap_err();
    assert!(err.is_invalid_usage());
    assert_eq!(
        h.wl.request(5).map(|r| r.binding.clone()),
        Some(ServiceBinding::Name(SERVICE_NAME.to_string()))
    );

    let other_name = h
        .submit(Msg::Request(item(5, "TRI.N")), SubmitOptions::service_name("OTHER"))
        .unwrap_err();
    assert!(other_name.is_invalid_usage());
}

#[test]
fn test_reissue_cannot_switch_service_id() {
    let mut h = Harness::ready();
    let key = MsgKey::named("TRI.N").with_service_id(SERVICE_ID);
    let request = RequestMsg::new(5, DomainType::MarketPrice, key);
    h.submit(Msg::Request(request), SubmitOptions::default())
        .unwrap();

    let moved = RequestMsg::new(
        5,
        DomainType::MarketPrice,
        MsgKey::named("TRI.N").with_service_id(9),
    );
    assert!(h
        .submit(Msg::Request(moved), SubmitOptions::default())
        .unwrap_err()
        .is_invalid_usage());
    assert_eq!(
        h.wl.request(5).map(|r| r.binding.clone()),
        Some(ServiceBinding::Id(SERVICE_ID))
    );
}

#[test]
fn test_both_service_name_and_id_rejected() {
    let mut h = Harness::ready();
    let request = RequestMsg::new(
        5,
        DomainType::MarketPrice,
        MsgKey::named("TRI.N").with_service_id(SERVICE_ID),
    );
    assert!(h.request(request).unwrap_err().is_invalid_usage());
    assert_eq!(h.wl.request_count(), 0);
}

#[test]
fn test_reissue_with_refresh_requests_new_image() {
    let mut h = Harness::ready();
    let wire = open_item(&mut h, 5, "TRI.N");

    h.request(item(5, "TRI.N")).unwrap();
    assert_eq!(h.wl.request_state(5), Some(RequestState::PendingRequest));
    h.dispatch();
    let sent = h.take_sent();
    let requests = requests_sent(&sent);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].stream_id, wire);
    assert!(!requests[0].no_refresh);

    h.refresh(wire);
    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(h.wl.request_state(5), Some(RequestState::Open));
}

#[test]
fn test_pause_goes_out_only_when_all_paused() {
    let mut h = Harness::ready();
    let wire = open_item(&mut h, 5, "TRI.N");
    h.request(item(6, "TRI.N")).unwrap();
    h.dispatch();
    h.refresh(wire);
    h.events();
    h.take_sent();

    let mut pause = item(5, "TRI.N");
    pause.pause = true;
    pause.no_refresh = true;
    h.request(pause).unwrap();
    h.dispatch();
    assert!(h.take_sent().is_empty());

    let mut pause = item(6, "TRI.N");
    pause.pause = true;
    pause.no_refresh = true;
    h.request(pause).unwrap();
    h.dispatch();
    let sent = h.take_sent();
    let requests = requests_sent(&sent);
    assert_eq!(requests.len(), 1);
    assert!(requests[0].pause);
    assert!(requests[0].no_refresh);
    assert!(h.wl.stream(wire).unwrap().paused);

    // Resuming one request resumes the stream.
    let mut resume = item(6, "TRI.N");
    resume.no_refresh = true;
    h.request(resume).unwrap();
    h.dispatch();
    let sent = h.take_sent();
    assert!(!requests_sent(&sent)[0].pause);
}

#[test]
fn test_priority_aggregates_highest_class() {
    let mut h = Harness::ready();
    let wire = open_item(&mut h, 5, "TRI.N");

    let mut urgent = item(6, "TRI.N").with_priority(3, 2);
    urgent.no_refresh = true;
    h.request(urgent).unwrap();
    h.dispatch();
    let sent = h.take_sent();
    let requests = requests_sent(&sent);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].stream_id, wire);
    assert_eq!(requests[0].priority, Some(Priority { class: 3, count: 2 }));
    h.refresh(wire);
    h.take_sent();

    // The remaining request has the default priority again.
    h.wl.close_request(6).unwrap();
    h.dispatch();
    let sent = h.take_sent();
    let requests = requests_sent(&sent);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].priority, None);
    assert!(requests[0].no_refresh);
}

#[test]
fn test_snapshot_leaves_after_refresh() {
    let mut h = Harness::ready();
    let wire = open_item(&mut h, 5, "TRI.N");

    h.request(item(6, "TRI.N").snapshot()).unwrap();
    assert_eq!(h.wl.wire_stream_id(6), Some(wire));
    h.dispatch();
    let sent = h.take_sent();
    assert!(requests_sent(&sent)[0].streaming);

    h.refresh(wire);
    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].msg.stream_id(), 6);
    match &events[0].msg {
        Msg::Refresh(refresh) => {
            assert_eq!(refresh.state.stream_state, StreamState::NonStreaming)
        }
        other => panic!("expected a refresh, got {other:?}"),
    }
    assert_eq!(h.wl.request_count(), 1);
    assert_eq!(h.wl.stream_count(), 1);
}

#[test]
fn test_snapshot_cannot_be_reissued() {
    let mut h = Harness::ready();
    h.request(item(5, "TRI.N").snapshot()).unwrap();
    let err = h.request(item(5, "TRI.N").snapshot()).unwrap_err();
    assert!(err.is_invalid_usage());
}

#[test]
fn test_lone_snapshot_stream_released() {
    let mut h = Harness::ready();
    h.request(item(5, "TRI.N").snapshot()).unwrap();
    h.dispatch();
    let wire = h.wl.wire_stream_id(5).unwrap();
    let sent = h.take_sent();
    assert!(!requests_sent(&sent)[0].streaming);

    h.read(Msg::Refresh(RefreshMsg::new(
        wire,
        DomainType::MarketPrice,
        State::new(StreamState::NonStreaming, DataState::Ok, StateCode::None, ""),
    )));
    assert_eq!(h.wl.request_count(), 0);
    assert_eq!(h.wl.stream_count(), 0);
    assert_eq!(h.events().len(), 1);
}

#[test]
fn test_private_streams_never_shared() {
    let mut h = Harness::ready();
    let mut first = item(5, "TRI.N");
    first.private_stream = true;
    let mut second = item(6, "TRI.N");
    second.private_stream = true;
    h.request(first).unwrap();
    h.request(second).unwrap();
    h.request(item(7, "TRI.N")).unwrap();

    assert_eq!(h.wl.stream_count(), 3);
    h.dispatch();
    let sent = h.take_sent();
    let private: Vec<bool> = requests_sent(&sent).iter().map(|r| r.private_stream).collect();
    assert_eq!(private, vec![true, true, false]);
}

#[test]
fn test_batch_fans_out_to_consecutive_ids() {
    let mut h = Harness::ready();
    let batch = RequestMsg::new(20, DomainType::MarketPrice, MsgKey::default())
        .with_batch(vec!["TRI.N".into(), "IBM.N".into(), "TRI.N".into()]);
    h.request(batch).unwrap();

    assert_eq!(h.wl.request_count(), 3);
    assert!(h.wl.request(20).is_none());
    for id in 21..=23 {
        assert_eq!(h.wl.request_state(id), Some(RequestState::PendingRequest));
    }
    assert_eq!(h.wl.wire_stream_id(21), h.wl.wire_stream_id(23));
    assert_eq!(h.wl.stream_count(), 2);

    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].msg.stream_id(), 20);
    let state = status_of(&events[0]).unwrap();
    assert_eq!(state.stream_state, StreamState::Closed);
    assert_eq!(state.text, "Stream closed for batch");
}

#[test]
fn test_batch_with_taken_id_rejected() {
    let mut h = Harness::ready();
    h.request(item(22, "IBM.N")).unwrap();
    let batch = RequestMsg::new(20, DomainType::MarketPrice, MsgKey::default())
        .with_batch(vec!["A.N".into(), "B.N".into()]);
    assert!(h.request(batch).unwrap_err().is_invalid_usage());
    assert_eq!(h.wl.request_count(), 1);
}

#[test]
fn test_open_window_limits_outstanding_refreshes() {
    let mut service = default_services().remove(0);
    service.load = Some(ServiceLoad {
        open_window: Some(1),
        ..ServiceLoad::default()
    });
    let mut h = Harness::ready_with(Default::default(), vec![service]);

    h.request(item(5, "A.N")).unwrap();
    h.request(item(6, "B.N")).unwrap();
    h.dispatch();
    let sent = h.take_sent();
    assert_eq!(requests_sent(&sent).len(), 1);

    let first = h.wl.wire_stream_id(5).unwrap();
    let second = h.wl.wire_stream_id(6).unwrap();
    assert_eq!(
        h.wl.stream(second).unwrap().refresh_state,
        RefreshState::OpenWindowBlocked
    );
    assert_eq!(h.wl.request_state(6), Some(RequestState::PendingRequest));

    h.refresh(first);
    h.dispatch();
    let sent = h.take_sent();
    let requests = requests_sent(&sent);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].stream_id, second);
}

#[test]
fn test_symbol_list_opens_data_streams() {
    let mut h = Harness::ready();
    let mut list = RequestMsg::new(5, DomainType::SymbolList, MsgKey::named(".AV.O"));
    list.symbol_list_data_streams = true;
    h.request(list).unwrap();
    h.dispatch();
    let wire = h.wl.wire_stream_id(5).unwrap();
    h.take_sent();

    let symbols = vec![SymbolListEntry::add("TRI.N"), SymbolListEntry::add("IBM.N")];
    h.read(Msg::Refresh(
        RefreshMsg::new(wire, DomainType::SymbolList, State::open_ok())
            .with_payload(Payload::SymbolList(symbols)),
    ));
    assert_eq!(h.wl.request_count(), 3);
    assert_eq!(h.wl.request(-1).map(|r| r.provider_driven), Some(true));
    assert!(h.wl.request(-2).is_some());

    h.dispatch();
    let sent = h.take_sent();
    let names: Vec<Option<&str>> = requests_sent(&sent)
        .iter()
        .map(|r| r.key.name.as_deref())
        .collect();
    assert_eq!(names, vec![Some("TRI.N"), Some("IBM.N")]);

    h.read(Msg::Update(UpdateMsg::new(
        wire,
        DomainType::SymbolList,
        Payload::SymbolList(vec![SymbolListEntry::delete("TRI.N")]),
    )));
    assert!(h.wl.request(-1).is_none());
    assert_eq!(h.wl.request_count(), 2);

    // Closing the list closes its data streams.
    h.wl.close_request(5).unwrap();
    assert_eq!(h.wl.request_count(), 0);
}

#[test]
fn test_generic_messages_both_ways() {
    let mut h = Harness::ready();
    let wire = open_item(&mut h, 5, "TRI.N");

    let generic = GenericMsg {
        stream_id: 5,
        domain: DomainType::MarketPrice,
        key: None,
        seq_num: None,
        complete: true,
        payload: Payload::Opaque(vec![9]),
    };
    h.submit(Msg::Generic(generic.clone()), SubmitOptions::default())
        .unwrap();
    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].stream_id(), wire);

    let mut inbound = generic;
    inbound.stream_id = wire;
    h.read(Msg::Generic(inbound));
    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].msg.stream_id(), 5);
}

#[test]
fn test_post_ack_clears_tracking() {
    let mut h = Harness::ready();
    let wire = open_item(&mut h, 5, "TRI.N");

    let post = PostMsg::new(5, DomainType::MarketPrice, Payload::Opaque(vec![1])).acked(7, None);
    h.submit(Msg::Post(post.clone()), SubmitOptions::default())
        .unwrap();
    assert_eq!(h.wl.outstanding_posts(), 1);

    // A second post with the same id is refused while the first is open.
    let err = h
        .submit(Msg::Post(post), SubmitOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        WatchlistError::Post(PostError::Duplicate { post_id: 7, .. })
    ));

    h.read(Msg::Ack(AckMsg::new(wire, DomainType::MarketPrice, 7, None)));
    assert_eq!(h.wl.outstanding_posts(), 0);
    assert_eq!(h.wl.active_timer_count(), 0);
    let events = h.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0].msg, Msg::Ack(ack) if ack.stream_id == 5 && !ack.is_nak()));
    assert_eq!(h.wl.stats().posts_acked, 1);

    // Unmatched acks are dropped.
    h.read(Msg::Ack(AckMsg::new(wire, DomainType::MarketPrice, 99, None)));
    assert!(h.events().is_empty());
}

#[test]
fn test_invalid_posts_rejected() {
    let mut h = Harness::ready();
    open_item(&mut h, 5, "TRI.N");

    let admin = PostMsg::new(5, DomainType::Source, Payload::None).acked(1, None);
    assert!(matches!(
        h.submit(Msg::Post(admin), SubmitOptions::default()),
        Err(WatchlistError::Post(PostError::AdministrativeDomain))
    ));

    let mut partial = PostMsg::new(5, DomainType::MarketPrice, Payload::None);
    partial.complete = false;
    assert!(matches!(
        h.submit(Msg::Post(partial), SubmitOptions::default()),
        Err(WatchlistError::Post(PostError::MissingSeqNum))
    ));

    let unknown = PostMsg::new(77, DomainType::MarketPrice, Payload::None);
    assert_eq!(
        h.submit(Msg::Post(unknown), SubmitOptions::default()),
        Err(WatchlistError::UnknownStream(77))
    );
    assert!(h.take_sent().is_empty());
}

#[test]
fn test_off_stream_post_uses_login_stream() {
    let mut h = Harness::ready();
    let mut post = PostMsg::new(LOGIN_USER_ID, DomainType::MarketPrice, Payload::Opaque(vec![4]))
        .acked(3, Some(1));
    post.key = Some(MsgKey::named("TRI.N"));
    h.submit(Msg::Post(post), by_name()).unwrap();

    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Msg::Post(post) => {
            assert_eq!(post.stream_id, LOGIN_STREAM_ID);
            assert_eq!(post.key.as_ref().and_then(|k| k.service_id), Some(SERVICE_ID));
        }
        other => panic!("expected a post, got {other:?}"),
    }

    h.read(Msg::Ack(AckMsg::new(LOGIN_STREAM_ID, DomainType::MarketPrice, 3, Some(1))));
    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].msg.stream_id(), LOGIN_USER_ID);
    assert_eq!(h.wl.outstanding_posts(), 0);
}

#[test]
fn test_stream_id_collision_rejected() {
    let mut h = Harness::ready();
    let err = h.request(item(LOGIN_USER_ID, "TRI.N")).unwrap_err();
    assert!(err.is_invalid_usage());
}

#[test]
fn test_reissue_widening_view_requests_refresh() {
    let mut h = Harness::ready();
    h.request(item(5, "TRI.N").with_view(field_view(&[22])))
        .unwrap();
    h.dispatch();
    let wire = h.wl.wire_stream_id(5).unwrap();
    h.refresh(wire);
    h.events();
    h.take_sent();

    let mut wider = item(5, "TRI.N").with_view(field_view(&[22, 25]));
    wider.no_refresh = true;
    h.request(wider).unwrap();
    assert_eq!(h.wl.request_state(5), Some(RequestState::PendingRequest));

    h.dispatch();
    let sent = h.take_sent();
    let requests = requests_sent(&sent);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].stream_id, wire);
    assert!(!requests[0].no_refresh);
    assert_eq!(requests[0].view, field_view(&[22, 25]));

    h.refresh(wire);
    assert_eq!(h.events().len(), 1);
    assert_eq!(h.wl.request_state(5), Some(RequestState::Open));
}

#[test]
fn test_reissue_narrowing_view_stays_quiet() {
    let mut h = Harness::ready();
    h.request(item(5, "TRI.N").with_view(field_view(&[22, 25])))
        .unwrap();
    h.dispatch();
    let wire = h.wl.wire_stream_id(5).unwrap();
    h.refresh(wire);
    h.events();
    h.take_sent();

    let mut narrower = item(5, "TRI.N").with_view(field_view(&[22]));
    narrower.no_refresh = true;
    h.request(narrower).unwrap();
    h.dispatch();
    assert!(h.take_sent().is_empty());
    assert_eq!(h.wl.request_state(5), Some(RequestState::Open));
}

#[test]
fn test_pool_exhaustion_reported_to_request() {
    let config = WatchlistConfig {
        initial_stream_pool_size: 1,
        max_streams: 1,
        ..WatchlistConfig::default()
    };
    let mut h = Harness::ready_with(config, default_services());
    h.request(item(5, "TRI.N")).unwrap();
    h.request(item(6, "IBM.N")).unwrap();

    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].msg.stream_id(), 6);
    let state = status_of(&events[0]).unwrap();
    assert_eq!(state.stream_state, StreamState::ClosedRecover);
    assert_eq!(state.data_state, DataState::Suspect);
    assert_eq!(state.code, StateCode::NoResources);
    assert_eq!(state.text, "No item streams available.");
    assert_eq!(h.wl.request_state(6), None);
    assert_eq!(h.wl.request_state(5), Some(RequestState::PendingRequest));

    // Sharing the open stream needs no new slot.
    h.request(item(7, "TRI.N")).unwrap();
    assert!(h.events().is_empty());
    assert_eq!(h.wl.wire_stream_id(7), h.wl.wire_stream_id(5));
    assert_eq!(h.wl.stream_count(), 1);
}

#[test]
fn test_multi_part_refresh_defers_joining_request() {
    let mut h = Harness::ready();
    h.request(item(5, "TRI.N")).unwrap();
    h.dispatch();
    let wire = h.wl.wire_stream_id(5).unwrap();
    h.take_sent();

    h.read(Msg::Refresh(
        RefreshMsg::new(wire, DomainType::MarketPrice, State::open_ok()).partial(),
    ));
    assert_eq!(
        h.wl.request_state(5),
        Some(RequestState::PendingCompleteRefresh)
    );
    assert_eq!(
        h.wl.stream(wire).unwrap().refresh_state,
        RefreshState::PartialRefreshPending
    );

    // The joiner's refresh waits for the final part.
    h.request(item(6, "TRI.N")).unwrap();
    h.dispatch();
    assert!(requests_sent(&h.take_sent()).is_empty());
    assert_eq!(h.wl.request_state(6), Some(RequestState::PendingRequest));

    h.refresh(wire);
    assert_eq!(h.wl.request_state(5), Some(RequestState::Open));
    assert_eq!(h.wl.request_state(6), Some(RequestState::PendingRequest));
    let events = h.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.msg.stream_id() == 5));

    h.dispatch();
    let sent = h.take_sent();
    let requests = requests_sent(&sent);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].stream_id, wire);
    assert!(!requests[0].no_refresh);

    h.refresh(wire);
    assert_eq!(h.wl.request_state(6), Some(RequestState::Open));
    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].msg.stream_id(), 6);
}
