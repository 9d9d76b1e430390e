//! Item requests and the streams that carry them

use std::time::Instant;

use feed_types::directory::{MapAction, SymbolListEntry};
use feed_types::domain::DomainType;
use feed_types::ids::{ServiceId, StreamId};
use feed_types::key::MsgKey;
use feed_types::msg::{Msg, Payload, Priority, RefreshMsg, RequestMsg, StatusMsg, UpdateMsg};
use feed_types::qos::Qos;
use feed_types::state::{DataState, State, StateCode, StreamState};
use feed_types::view::ViewAction;
use tracing::{debug, info, trace, warn};

use super::{retry_later, SendOutcome, TimerOwner, Watchlist};
use crate::arena::Handle;
use crate::codec::Codec;
use crate::error::WatchlistError;
use crate::events::SubmitOptions;
use crate::request::{ItemRequest, RequestState, ServiceBinding, ViewChange};
use crate::service_cache::Service;
use crate::stream::{aggregate_priority, ProtocolState, RefreshState, StreamAttributes};
use crate::transport::Transport;
use crate::view::AggregateView;

const NO_MATCHING_SERVICE: &str = "No matching service present.";
const DOMAIN_NOT_SUPPORTED: &str = "Domain not supported by service.";
const SERVICE_DOWN: &str = "Service is down.";
const SERVICE_NOT_ACCEPTING: &str = "Service is not accepting requests.";
const NO_MATCHING_QOS: &str = "Service does not provide a matching QoS.";
const VIEW_KIND_MISMATCH: &str = "Requested view type does not match existing stream.";
const NO_STREAMS: &str = "No item streams available.";
const BATCH_CLOSED: &str = "Stream closed for batch";
const REQUEST_TIMEOUT: &str = "Request timeout";
pub(super) const CHANNEL_DOWN: &str = "channel down.";

impl<T: Transport, C: Codec> Watchlist<T, C> {
    // ------------------------------------------------------------------
    // Submit
    // ------------------------------------------------------------------

    pub(super) fn submit_item_request(
        &mut self,
        msg: RequestMsg,
        options: &SubmitOptions,
    ) -> Result<(), WatchlistError> {
        if let Some(handle) = self.requests_by_id.get(&msg.stream_id).copied() {
            return self.reissue_item_request(handle, &msg, options);
        }
        if self.stream_id_in_use(msg.stream_id) {
            return Err(WatchlistError::invalid_usage(format!(
                "Stream id {} is already in use.",
                msg.stream_id
            )));
        }
        if !msg.batch.is_empty() {
            return self.submit_batch(msg, options);
        }
        let binding = ServiceBinding::resolve(&msg, options)?;
        self.open_item_request(&msg, binding, false)?;
        Ok(())
    }

    /// Create a request and put it on a stream, or park it until a service
    /// can carry it.
    fn open_item_request(
        &mut self,
        msg: &RequestMsg,
        binding: ServiceBinding,
        provider_driven: bool,
    ) -> Result<Handle, WatchlistError> {
        let request = ItemRequest::new(msg, binding, provider_driven)?;
        let user_id = request.user_id;
        let handle = self.requests.insert(request);
        self.requests_by_id.insert(user_id, handle);
        debug!(
            stream_id = user_id,
            domain = ?msg.domain,
            streaming = msg.streaming,
            provider_driven,
            "Item request opened"
        );
        self.find_stream(handle, true);
        Ok(handle)
    }

    /// Items of a batch get ids `id+1..=id+n`; the batch id itself closes.
    fn submit_batch(
        &mut self,
        mut msg: RequestMsg,
        options: &SubmitOptions,
    ) -> Result<(), WatchlistError> {
        msg.validate()?;
        let binding = ServiceBinding::resolve(&msg, options)?;
        let names = std::mem::take(&mut msg.batch);

        let count = StreamId::try_from(names.len())
            .map_err(|_| WatchlistError::invalid_usage("Batch is too large."))?;
        let batch_id = msg.stream_id;
        batch_id
            .checked_add(count)
            .ok_or_else(|| WatchlistError::invalid_usage("Batch stream ids overflow."))?;
        let item_ids: Vec<StreamId> = (1..=count).map(|offset| batch_id + offset).collect();
        if let Some(taken) = item_ids.iter().find(|id| self.stream_id_in_use(**id)) {
            return Err(WatchlistError::invalid_usage(format!(
                "Batch stream id {} is already in use.",
                taken
            )));
        }

        info!(stream_id = batch_id, items = names.len(), "Batch request");
        for (stream_id, name) in item_ids.into_iter().zip(names) {
            let mut item = msg.clone();
            item.stream_id = stream_id;
            item.key.name = Some(name);
            if let Err(err) = self.open_item_request(&item, binding.clone(), false) {
                warn!(stream_id, error = %err, "Batch item rejected");
                let status = StatusMsg::new(
                    stream_id,
                    msg.domain,
                    State::closed(StateCode::UsageError, err.to_string()),
                );
                self.deliver(stream_id, Msg::Status(status), options.service_name.clone());
            }
        }

        let closed = State::new(StreamState::Closed, DataState::Ok, StateCode::None, BATCH_CLOSED);
        let status = StatusMsg::new(batch_id, msg.domain, closed);
        self.deliver(batch_id, Msg::Status(status), options.service_name.clone());
        Ok(())
    }

    fn reissue_item_request(
        &mut self,
        handle: Handle,
        msg: &RequestMsg,
        options: &SubmitOptions,
    ) -> Result<(), WatchlistError> {
        let request = self
            .requests
            .get(handle)
            .ok_or(WatchlistError::UnknownStream(msg.stream_id))?;
        let user_id = request.user_id;
        let stream_handle = request.stream;
        let others_kind = stream_handle
            .and_then(|h| self.streams.get(h))
            .and_then(|s| s.aggregate_view.as_ref())
            .filter(|a| a.member_count() > usize::from(a.has_member(user_id)))
            .map(AggregateView::kind);

        let reissue = request.check_reissue(msg, options, others_kind)?;
        let was_paused = request.paused;
        let streaming = request.streaming;
        let old_priority = request.priority;

        let Some(request) = self.requests.get_mut(handle) else {
            return Ok(());
        };
        let previous_view = request.apply_reissue(&reissue);
        let new_view = request.view.clone();
        debug!(
            stream_id = user_id,
            paused = reissue.paused,
            refresh = reissue.refresh,
            view = ?reissue.view,
            "Item request reissued"
        );

        let Some(stream_handle) = stream_handle else {
            // Not on a stream yet; the new settings apply when it attaches.
            return Ok(());
        };
        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return Ok(());
        };

        if streaming && was_paused != reissue.paused {
            if reissue.paused {
                stream.paused_count += 1;
            } else {
                stream.paused_count = stream.paused_count.saturating_sub(1);
            }
        }

        let view_changed = reissue.view != ViewChange::Keep;
        if view_changed {
            if previous_view.is_some() {
                if let Some(aggregate) = stream.aggregate_view.as_mut() {
                    aggregate.remove_view(user_id);
                }
                stream.view_count = stream.view_count.saturating_sub(1);
            }
            if stream.aggregate_view.as_ref().is_some_and(AggregateView::is_empty) {
                stream.aggregate_view = None;
            }
            if let Some(view) = new_view {
                let aggregate = stream
                    .aggregate_view
                    .get_or_insert_with(|| AggregateView::new(view.kind()));
                match aggregate.add_view(user_id, view) {
                    Ok(()) => stream.view_count += 1,
                    Err(err) => warn!(stream_id = user_id, error = %err, "Reissued view not aggregated"),
                }
            }
        }

        if reissue.refresh {
            if let Some(request) = self.requests.get_mut(handle) {
                request.state = RequestState::PendingRequest;
            }
            self.set_msg_pending(stream_handle, true);
            return Ok(());
        }

        let Some(stream) = self.streams.get(stream_handle) else {
            return Ok(());
        };
        let widened = stream.aggregate_view.as_ref().is_some_and(|a| !a.contains_new_views())
            || stream.desired_view().is_some() != stream.wire_view;
        if view_changed && widened {
            // The added fields need an image, so the request waits for one.
            if let Some(request) = self.requests.get_mut(handle) {
                request.state = RequestState::PendingRequest;
            }
            self.set_msg_pending(stream_handle, true);
            return Ok(());
        }
        let wire_change = stream.wire_pause() != stream.paused
            || (reissue.priority != old_priority
                && self.stream_priority(stream_handle) != stream.wire_priority);
        if wire_change {
            self.set_msg_pending(stream_handle, false);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stream matching
    // ------------------------------------------------------------------

    /// Service and QoS a request would be carried with right now.
    fn match_service(&self, request: &ItemRequest) -> Result<(ServiceId, Qos), &'static str> {
        let service = match &request.binding {
            ServiceBinding::Id(id) => self.services.get(*id),
            ServiceBinding::Name(name) => self.services.get_by_name(name),
        }
        .ok_or(NO_MATCHING_SERVICE)?;

        if !service.supports_domain(request.domain) {
            return Err(DOMAIN_NOT_SUPPORTED);
        }
        if !service.is_up() {
            return Err(SERVICE_DOWN);
        }
        if !service.accepting_requests() {
            return Err(SERVICE_NOT_ACCEPTING);
        }
        let qos = Qos::best_match(request.qos.as_ref(), request.worst_qos.as_ref(), service.qos())
            .ok_or(NO_MATCHING_QOS)?;
        Ok((service.service_id, qos))
    }

    /// Attach a detached request to a matching stream, opening one if needed.
    pub(super) fn find_stream(&mut self, handle: Handle, notify: bool) {
        let Some(request) = self.requests.get(handle) else {
            return;
        };
        let user_id = request.user_id;
        let private = request.private_stream;
        let matched = self.match_service(request).map(|(service_id, qos)| {
            let mut key = request.key.clone();
            key.service_id = Some(service_id);
            (
                service_id,
                StreamAttributes {
                    domain: request.domain,
                    key,
                    qos,
                },
            )
        });

        let (service_id, attributes) = match matched {
            Ok(found) => found,
            Err(text) => {
                self.park_request(handle, text, notify);
                return;
            }
        };

        let shared = if private {
            None
        } else {
            self.streams_by_attributes.get(&attributes).copied()
        };
        let stream_handle = match shared {
            Some(existing) => existing,
            None => match self.open_stream(service_id, attributes, private) {
                Ok(opened) => opened,
                Err(err) => {
                    warn!(stream_id = user_id, error = %err, "Item stream not available");
                    self.close_with_status(
                        handle,
                        State::closed_recover(StateCode::NoResources, NO_STREAMS),
                    );
                    return;
                }
            },
        };
        self.waiting.remove(&user_id);
        self.attach_request(handle, stream_handle);
    }

    /// No service can carry the request yet.
    fn park_request(&mut self, handle: Handle, text: &'static str, notify: bool) {
        let Some(request) = self.requests.get_mut(handle) else {
            return;
        };
        request.state = RequestState::None;
        let user_id = request.user_id;

        if self.config.single_open {
            self.waiting.insert(user_id);
            debug!(stream_id = user_id, reason = text, "Item request waiting for a service");
            if notify {
                self.deliver_status(handle, State::open_suspect(StateCode::None, text));
            }
        } else {
            self.close_with_status(handle, State::closed_recover(StateCode::None, text));
        }
    }

    fn open_stream(
        &mut self,
        service_id: ServiceId,
        attributes: StreamAttributes,
        private: bool,
    ) -> Result<Handle, WatchlistError> {
        let shared_key = attributes.clone();
        let (handle, stream_id) = self
            .streams
            .acquire(|stream, id| stream.open(id, service_id, attributes, private))?;
        if !private {
            self.streams_by_attributes.insert(shared_key, handle);
        }
        self.stats.streams_opened += 1;
        debug!(stream_id, service_id, private, "Item stream opened");
        Ok(handle)
    }

    fn attach_request(&mut self, handle: Handle, stream_handle: Handle) {
        let Some(request) = self.requests.get(handle) else {
            return;
        };
        let user_id = request.user_id;
        let view = request.view.clone();
        let streaming = request.streaming;
        let paused = request.paused;

        let attached = {
            let Some(stream) = self.streams.get_mut(stream_handle) else {
                return;
            };
            let added = match view {
                Some(view) => {
                    let aggregate = stream
                        .aggregate_view
                        .get_or_insert_with(|| AggregateView::new(view.kind()));
                    aggregate.add_view(user_id, view).map(|()| true)
                }
                None => Ok(false),
            };
            match added {
                Ok(has_view) => {
                    if has_view {
                        stream.view_count += 1;
                    }
                    stream.requests.push_back(&mut self.requests, handle);
                    if streaming {
                        stream.streaming_count += 1;
                        if paused {
                            stream.paused_count += 1;
                        }
                    }
                    Ok(stream.stream_id)
                }
                Err(err) => Err((err, stream.requests.is_empty())),
            }
        };

        match attached {
            Ok(stream_id) => {
                if let Some(request) = self.requests.get_mut(handle) {
                    request.stream = Some(stream_handle);
                    request.state = RequestState::PendingRequest;
                }
                trace!(stream_id = user_id, wire_stream_id = stream_id, "Request attached");
                self.set_msg_pending(stream_handle, true);
            }
            Err((err, stream_empty)) => {
                debug!(stream_id = user_id, error = %err, "View rejected by stream");
                self.close_with_status(handle, State::closed(StateCode::UsageError, VIEW_KIND_MISMATCH));
                if stream_empty {
                    self.release_stream(stream_handle, false);
                }
            }
        }
    }

    /// Queue a stream for the next flush. `refresh` asks for a new image.
    pub(super) fn set_msg_pending(&mut self, stream_handle: Handle, refresh: bool) {
        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return;
        };
        if refresh {
            stream.refresh_requested = true;
            if stream.refresh_state != RefreshState::PartialRefreshPending {
                stream.refresh_state = RefreshState::NeedsRefresh;
            }
        }
        if !stream.msg_pending {
            stream.msg_pending = true;
            self.pending_sends.push_back(stream_handle);
        }
    }

    fn stream_priority(&self, stream_handle: Handle) -> Option<Priority> {
        let stream = self.streams.get(stream_handle)?;
        aggregate_priority(
            stream
                .requests
                .to_vec(&self.requests)
                .into_iter()
                .filter_map(|h| self.requests.get(h))
                .map(|r| r.priority),
        )
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    pub(super) fn flush_item_requests(&mut self, now: Instant) -> Result<(), WatchlistError> {
        let mut deferred = Vec::new();
        let mut result = Ok(());
        while let Some(handle) = self.pending_sends.pop_front() {
            match self.send_stream_request(handle, now) {
                Ok(SendOutcome::Sent) | Ok(SendOutcome::Skipped) => {}
                Ok(SendOutcome::Deferred) => deferred.push(handle),
                Err(err) if err.is_retryable() => {
                    self.pending_sends.push_front(handle);
                    result = retry_later(err);
                    break;
                }
                Err(err) => {
                    self.stream_send_failed(handle, &err);
                    result = Err(err);
                    break;
                }
            }
        }
        for handle in deferred.into_iter().rev() {
            self.pending_sends.push_front(handle);
        }
        result
    }

    /// The transport refused a stream's request. Its requests get a status
    /// through the close or recovery path.
    fn stream_send_failed(&mut self, stream_handle: Handle, err: &WatchlistError) {
        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return;
        };
        stream.msg_pending = false;
        let stream_id = stream.stream_id;
        warn!(stream_id, error = %err, "Item request not sent");

        let state = match err {
            WatchlistError::ChannelFailure { reason } => {
                State::closed_recover(StateCode::None, reason.clone())
            }
            other => State::closed(StateCode::None, other.to_string()),
        };
        self.stream_closed(stream_handle, state, &[]);
    }

    fn send_stream_request(
        &mut self,
        stream_handle: Handle,
        now: Instant,
    ) -> Result<SendOutcome, WatchlistError> {
        let Some(stream) = self.streams.get(stream_handle) else {
            return Ok(SendOutcome::Skipped);
        };
        if !stream.msg_pending {
            return Ok(SendOutcome::Skipped);
        }
        let refresh = stream.refresh_requested;
        if refresh && stream.refresh_state == RefreshState::PartialRefreshPending {
            return Ok(SendOutcome::Deferred);
        }
        let service_id = stream.service_id;
        if refresh && !stream.in_open_window && self.open_window_full(service_id) {
            if let Some(stream) = self.streams.get_mut(stream_handle) {
                stream.refresh_state = RefreshState::OpenWindowBlocked;
            }
            trace!(service_id, "Open window full, request deferred");
            return Ok(SendOutcome::Deferred);
        }

        let members = stream.requests.to_vec(&self.requests);
        let priority = self.stream_priority(stream_handle);
        let extended_header = members
            .iter()
            .filter_map(|h| self.requests.get(*h))
            .find_map(|r| r.extended_header.clone());

        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return Ok(SendOutcome::Skipped);
        };
        let view_updated = stream
            .aggregate_view
            .as_mut()
            .map(AggregateView::merge)
            .unwrap_or(false);
        let view = stream.desired_view();
        let pause = stream.wire_pause();
        let stream_id = stream.stream_id;

        let mut request = RequestMsg::new(stream_id, stream.domain(), stream.attributes.key.clone());
        request.qos = Some(stream.attributes.qos);
        request.priority = priority;
        request.streaming = stream.is_streaming();
        request.pause = pause;
        request.no_refresh = !refresh;
        request.private_stream = stream.private_stream;
        request.view = view.clone().map(ViewAction::Set).unwrap_or_default();
        request.extended_header = extended_header;

        if let Err(err) = self.send(&Msg::Request(request)) {
            if let Some(aggregate) = self
                .streams
                .get_mut(stream_handle)
                .and_then(|s| s.aggregate_view.as_mut())
            {
                aggregate.rollback();
            }
            return Err(err);
        }

        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return Ok(SendOutcome::Sent);
        };
        if let Some(aggregate) = stream.aggregate_view.as_mut() {
            aggregate.commit();
        }
        stream.msg_pending = false;
        stream.wire_view = view.is_some();
        stream.wire_priority = priority;
        stream.paused = pause;
        stream.established = true;
        debug!(stream_id, refresh, pause, view = view.is_some(), "Item request sent");

        if refresh {
            stream.refresh_requested = false;
            stream.refresh_state = if view_updated {
                RefreshState::ViewRefreshPending
            } else {
                RefreshState::RefreshPending
            };
            if !stream.in_open_window {
                stream.in_open_window = true;
                *self.open_window.entry(service_id).or_default() += 1;
            }
            for member in members {
                if let Some(request) = self.requests.get_mut(member) {
                    if request.state == RequestState::PendingRequest {
                        request.state = RequestState::PendingRefresh;
                    }
                }
            }
            self.start_request_timer(stream_handle, stream_id, now);
        }
        Ok(SendOutcome::Sent)
    }

    fn open_window_full(&self, service_id: ServiceId) -> bool {
        if !self.config.obey_open_window {
            return false;
        }
        let Some(window) = self
            .services
            .get(service_id)
            .and_then(Service::open_window)
            .filter(|w| *w > 0)
        else {
            return false;
        };
        self.open_window.get(&service_id).copied().unwrap_or(0) >= window
    }

    fn leave_open_window(&mut self, stream_handle: Handle) {
        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return;
        };
        if !stream.in_open_window {
            return;
        }
        stream.in_open_window = false;
        if let Some(count) = self.open_window.get_mut(&stream.service_id) {
            *count = count.saturating_sub(1);
        }
    }

    fn start_request_timer(&mut self, stream_handle: Handle, stream_id: StreamId, now: Instant) {
        let existing = self.streams.get(stream_handle).and_then(|s| s.request_timer);
        let timer = match existing {
            Some(timer) => timer,
            None => {
                let timer = self
                    .timers
                    .create_timer(self.request_timeouts, TimerOwner::RequestTimeout(stream_id));
                if let Some(stream) = self.streams.get_mut(stream_handle) {
                    stream.request_timer = Some(timer);
                }
                timer
            }
        };
        self.timers.start(timer, now);
    }

    fn stop_request_timer(&mut self, stream_handle: Handle) {
        if let Some(timer) = self.streams.get(stream_handle).and_then(|s| s.request_timer) {
            self.timers.stop(timer);
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Take a request off its stream. Returns the stream it was on.
    fn detach_request(&mut self, handle: Handle) -> Option<Handle> {
        let request = self.requests.get(handle)?;
        let stream_handle = request.stream?;
        let user_id = request.user_id;
        let streaming = request.streaming;
        let paused = request.paused;
        let has_view = request.view.is_some();

        if let Some(stream) = self.streams.get_mut(stream_handle) {
            stream.requests.remove(&mut self.requests, handle);
            if streaming {
                stream.streaming_count = stream.streaming_count.saturating_sub(1);
                if paused {
                    stream.paused_count = stream.paused_count.saturating_sub(1);
                }
            }
            if has_view {
                stream.view_count = stream.view_count.saturating_sub(1);
                let emptied = stream
                    .aggregate_view
                    .as_mut()
                    .map(|aggregate| {
                        aggregate.remove_view(user_id);
                        aggregate.is_empty()
                    })
                    .unwrap_or(false);
                if emptied {
                    stream.aggregate_view = None;
                }
            }
            for record in stream.posts.remove_for_request(user_id) {
                self.timers.destroy(record.timer);
                self.outstanding_posts = self.outstanding_posts.saturating_sub(1);
            }
        }
        if let Some(request) = self.requests.get_mut(handle) {
            request.stream = None;
        }
        Some(stream_handle)
    }

    /// Forget a detached request.
    fn destroy_request(&mut self, handle: Handle) {
        let Some(request) = self.requests.remove(handle) else {
            return;
        };
        let user_id = request.user_id;
        if self.requests_by_id.get(&user_id) == Some(&handle) {
            self.requests_by_id.remove(&user_id);
        }
        self.waiting.remove(&user_id);

        if let Some(children) = self.symbol_list_children.remove(&user_id) {
            for child_id in children.into_values() {
                if let Some(child) = self.requests_by_id.get(&child_id).copied() {
                    self.close_item_request(child);
                }
            }
        }
        if request.provider_driven {
            for children in self.symbol_list_children.values_mut() {
                children.retain(|_, id| *id != user_id);
            }
        }
    }

    pub(super) fn close_item_request(&mut self, handle: Handle) {
        let Some(user_id) = self.requests.get(handle).map(|r| r.user_id) else {
            return;
        };
        let stream_handle = self.detach_request(handle);
        if let Some(request) = self.requests.get_mut(handle) {
            request.state = RequestState::ReturnToPool;
        }
        self.destroy_request(handle);
        debug!(stream_id = user_id, "Item request closed");
        if let Some(stream_handle) = stream_handle {
            self.after_request_removed(stream_handle);
        }
    }

    fn close_with_status(&mut self, handle: Handle, state: State) {
        self.deliver_status(handle, state);
        self.close_item_request(handle);
    }

    /// Release an emptied stream, or push changed pause/priority to the wire.
    /// A narrower view is not pushed; extra fields are harmless.
    fn after_request_removed(&mut self, stream_handle: Handle) {
        let Some(stream) = self.streams.get(stream_handle) else {
            return;
        };
        if stream.requests.is_empty() {
            self.release_stream(stream_handle, true);
            return;
        }
        let changed = stream.wire_pause() != stream.paused
            || self.stream_priority(stream_handle) != stream.wire_priority;
        if changed && stream.established {
            self.set_msg_pending(stream_handle, false);
        }
    }

    fn release_stream(&mut self, stream_handle: Handle, send_close: bool) {
        self.leave_open_window(stream_handle);
        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return;
        };
        let stream_id = stream.stream_id;
        let domain = stream.domain();
        let established = stream.established;
        let private = stream.private_stream;
        let attributes = stream.attributes.clone();
        let timer = stream.request_timer.take();
        let posts = stream.posts.drain();

        if let Some(timer) = timer {
            self.timers.destroy(timer);
        }
        for record in posts {
            self.timers.destroy(record.timer);
            self.outstanding_posts = self.outstanding_posts.saturating_sub(1);
        }
        if !private && self.streams_by_attributes.get(&attributes) == Some(&stream_handle) {
            self.streams_by_attributes.remove(&attributes);
        }
        self.item_groups.remove_stream(stream_id);
        if send_close && established {
            self.send_close(stream_id, domain);
        }
        if let Err(err) = self.streams.release(stream_handle, stream_id) {
            warn!(stream_id, error = %err, "Stream release failed");
        }
        self.stats.streams_closed += 1;
        debug!(stream_id, "Item stream released");
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    pub(super) fn read_item_msg(&mut self, stream_handle: Handle, msg: Msg, now: Instant) {
        match msg {
            Msg::Refresh(refresh) => self.read_item_refresh(stream_handle, refresh, now),
            Msg::Update(update) => self.read_item_update(stream_handle, update),
            Msg::Status(status) => self.read_item_status(stream_handle, status),
            Msg::Ack(ack) => self.read_item_ack(stream_handle, ack),
            Msg::Generic(generic) => {
                self.fan_out(stream_handle, &Msg::Generic(generic), |r| r.state == RequestState::Open);
            }
            other => warn!(
                stream_id = other.stream_id(),
                class = other.class_label(),
                "Unexpected message on item stream dropped"
            ),
        }
    }

    fn read_item_refresh(&mut self, stream_handle: Handle, refresh: RefreshMsg, now: Instant) {
        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return;
        };
        let stream_id = stream.stream_id;
        let service_id = stream.service_id;
        let symbol_list = stream.domain() == DomainType::SymbolList;
        stream.protocol_state = protocol_state_of(&refresh.state);
        if let Some(group) = &refresh.group_id {
            self.item_groups.add_stream(service_id, group.as_bytes(), stream_id);
        }

        let members = stream.requests.to_vec(&self.requests);
        let targets: Vec<Handle> = members
            .into_iter()
            .filter(|h| {
                self.requests.get(*h).is_some_and(|r| {
                    if refresh.solicited {
                        r.state.awaiting_refresh()
                    } else {
                        r.state.awaiting_refresh() || r.state == RequestState::Open
                    }
                })
            })
            .collect();
        if targets.is_empty() {
            debug!(stream_id, solicited = refresh.solicited, "Refresh with no waiting requests dropped");
            return;
        }

        let answers_request = targets.iter().any(|h| {
            self.requests
                .get(*h)
                .is_some_and(|r| r.state.awaiting_refresh())
        });
        if answers_request {
            if refresh.complete {
                self.stop_request_timer(stream_handle);
                self.leave_open_window(stream_handle);
                if let Some(stream) = self.streams.get_mut(stream_handle) {
                    stream.refresh_state = if stream.refresh_requested {
                        RefreshState::NeedsRefresh
                    } else {
                        RefreshState::None
                    };
                }
            } else {
                if let Some(stream) = self.streams.get_mut(stream_handle) {
                    stream.refresh_state = RefreshState::PartialRefreshPending;
                }
                self.start_request_timer(stream_handle, stream_id, now);
            }
        }

        let mut finished_snapshots = Vec::new();
        for target in &targets {
            let Some(request) = self.requests.get_mut(*target) else {
                continue;
            };
            let mut out = refresh.clone();
            if !request.streaming && out.state.stream_state == StreamState::Open {
                out.state.stream_state = StreamState::NonStreaming;
            }
            if request.state.awaiting_refresh() {
                request.state = if refresh.complete {
                    RequestState::Open
                } else {
                    RequestState::PendingCompleteRefresh
                };
            }
            if refresh.complete && !request.streaming {
                finished_snapshots.push(*target);
            }
            if symbol_list && request.symbol_list_data_streams {
                if let Payload::SymbolList(entries) = &refresh.payload {
                    let entries = entries.clone();
                    self.deliver_to_request(*target, Msg::Refresh(out));
                    self.apply_symbol_list(*target, &entries);
                    continue;
                }
            }
            self.deliver_to_request(*target, Msg::Refresh(out));
        }

        let snapshots_left = !finished_snapshots.is_empty();
        for snapshot in finished_snapshots {
            let _ = self.detach_request(snapshot);
            self.destroy_request(snapshot);
        }

        let state = refresh.state;
        if state.stream_state.is_final() {
            if state.stream_state == StreamState::NonStreaming {
                self.snapshot_stream_finished(stream_handle);
            } else {
                self.stream_closed(stream_handle, state, &targets);
            }
            return;
        }
        if let Some(stream) = self.streams.get(stream_handle) {
            if stream.requests.is_empty() {
                self.release_stream(stream_handle, true);
            } else if snapshots_left {
                self.after_request_removed(stream_handle);
            }
        }
    }

    /// The provider ended a non-streaming stream after its image.
    fn snapshot_stream_finished(&mut self, stream_handle: Handle) {
        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return;
        };
        stream.established = false;
        stream.protocol_state = ProtocolState::Closed;
        if stream.requests.is_empty() {
            self.release_stream(stream_handle, false);
            return;
        }
        // Requests that joined while the snapshot was in flight need their own.
        let members = stream.requests.to_vec(&self.requests);
        for member in members {
            if let Some(request) = self.requests.get_mut(member) {
                request.state = RequestState::PendingRequest;
            }
        }
        self.set_msg_pending(stream_handle, true);
    }

    fn read_item_update(&mut self, stream_handle: Handle, update: UpdateMsg) {
        let symbols = match (&update.payload, self.streams.get(stream_handle)) {
            (Payload::SymbolList(entries), Some(stream))
                if stream.domain() == DomainType::SymbolList =>
            {
                Some(entries.clone())
            }
            _ => None,
        };
        let targets = self.fan_out(stream_handle, &Msg::Update(update), |r| {
            r.streaming
                && matches!(
                    r.state,
                    RequestState::Open | RequestState::PendingCompleteRefresh
                )
        });
        if let Some(entries) = symbols {
            for target in targets {
                if self
                    .requests
                    .get(target)
                    .is_some_and(|r| r.symbol_list_data_streams)
                {
                    self.apply_symbol_list(target, &entries);
                }
            }
        }
    }

    pub(super) fn read_item_status(&mut self, stream_handle: Handle, status: StatusMsg) {
        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return;
        };
        let stream_id = stream.stream_id;
        if let Some(group) = &status.group_id {
            self.item_groups.add_stream(stream.service_id, group.as_bytes(), stream_id);
        }
        let Some(state) = status.state.clone() else {
            self.fan_out(stream_handle, &Msg::Status(status), |r| r.state != RequestState::None);
            return;
        };
        stream.protocol_state = protocol_state_of(&state);

        if state.stream_state == StreamState::Open {
            if state.data_state == DataState::Suspect && !self.config.allow_suspect_data {
                debug!(stream_id, "Suspect data not allowed, closing stream");
                let domain = stream.domain();
                self.send_close(stream_id, domain);
                if let Some(stream) = self.streams.get_mut(stream_handle) {
                    stream.established = false;
                }
                self.stream_closed(
                    stream_handle,
                    State::closed_recover(state.code, state.text),
                    &[],
                );
                return;
            }
            self.fan_out(stream_handle, &Msg::Status(status), |r| r.state != RequestState::None);
            return;
        }

        stream.established = false;
        self.stream_closed(stream_handle, state, &[]);
    }

    /// Deliver `msg` to every request on the stream accepted by `filter`.
    /// Returns the requests it went to.
    pub(super) fn fan_out(
        &mut self,
        stream_handle: Handle,
        msg: &Msg,
        filter: impl Fn(&ItemRequest) -> bool,
    ) -> Vec<Handle> {
        let Some(stream) = self.streams.get(stream_handle) else {
            return Vec::new();
        };
        let targets: Vec<Handle> = stream
            .requests
            .to_vec(&self.requests)
            .into_iter()
            .filter(|h| self.requests.get(*h).is_some_and(&filter))
            .collect();
        for target in &targets {
            self.deliver_to_request(*target, msg.clone());
        }
        targets
    }

    /// The provider (or the watchlist) ended a stream.
    ///
    /// Requests in `notified` already saw the final state.
    fn stream_closed(&mut self, stream_handle: Handle, state: State, notified: &[Handle]) {
        if state.stream_state == StreamState::ClosedRecover && self.config.single_open {
            self.recover_stream(stream_handle, State::open_suspect(state.code, state.text));
            return;
        }

        self.stop_request_timer(stream_handle);
        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return;
        };
        stream.established = false;
        stream.protocol_state = ProtocolState::Closed;
        let stream_id = stream.stream_id;
        let members = stream.requests.to_vec(&self.requests);
        debug!(stream_id, requests = members.len(), state = ?state.stream_state, "Item stream closed");

        for member in members {
            if !notified.contains(&member) {
                self.deliver_status(member, state.clone());
            }
            let _ = self.detach_request(member);
            self.destroy_request(member);
        }
        if self.streams.get(stream_handle).is_some() {
            self.release_stream(stream_handle, false);
        }
    }

    /// Re-request a stream on behalf of every request it carries.
    fn recover_stream(&mut self, stream_handle: Handle, state: State) {
        self.stop_request_timer(stream_handle);
        self.leave_open_window(stream_handle);
        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return;
        };
        let stream_id = stream.stream_id;
        stream.established = false;
        stream.protocol_state = ProtocolState::Closed;
        stream.refresh_state = RefreshState::None;
        let members = stream.requests.to_vec(&self.requests);
        self.item_groups.remove_stream(stream_id);
        debug!(stream_id, requests = members.len(), "Item stream recovering");

        for member in members {
            self.deliver_status(member, state.clone());
            if let Some(request) = self.requests.get_mut(member) {
                request.state = RequestState::PendingRequest;
            }
        }
        self.set_msg_pending(stream_handle, true);
    }

    pub(super) fn items_channel_down(&mut self) {
        for stream_handle in self.streams.handles() {
            let Some(stream) = self.streams.get_mut(stream_handle) else {
                continue;
            };
            stream.established = false;
            stream.in_open_window = false;
            for record in stream.posts.drain() {
                self.timers.destroy(record.timer);
                self.outstanding_posts = self.outstanding_posts.saturating_sub(1);
            }
            if self.config.single_open {
                self.recover_stream(stream_handle, State::open_suspect(StateCode::None, CHANNEL_DOWN));
            } else {
                self.stream_closed(
                    stream_handle,
                    State::closed_recover(StateCode::None, CHANNEL_DOWN),
                    &[],
                );
            }
        }
    }

    pub(super) fn on_request_timeout(&mut self, stream_id: StreamId) {
        let Some(stream_handle) = self.streams.handle_for(stream_id) else {
            debug!(stream_id, "Request timer fired for a released stream");
            return;
        };
        warn!(stream_id, timeout_ms = self.config.request_timeout_ms, "Request timed out");
        self.stats.request_timeouts += 1;

        let Some(stream) = self.streams.get_mut(stream_handle) else {
            return;
        };
        let domain = stream.domain();
        let established = stream.established;
        stream.established = false;
        if established {
            self.send_close(stream_id, domain);
        }
        self.stream_closed(
            stream_handle,
            State::closed_recover(StateCode::Timeout, REQUEST_TIMEOUT),
            &[],
        );
    }

    /// Try to place every waiting request again.
    pub(super) fn retry_waiting_requests(&mut self) {
        let waiting: Vec<StreamId> = self.waiting.iter().copied().collect();
        for stream_id in waiting {
            if let Some(handle) = self.requests_by_id.get(&stream_id).copied() {
                self.find_stream(handle, false);
            }
        }
    }

    /// Move requests whose stream no longer matches their service onto one
    /// that does, or park them.
    pub(super) fn reconcile_streams(&mut self) {
        for stream_handle in self.streams.handles() {
            let Some(stream) = self.streams.get(stream_handle) else {
                continue;
            };
            let expected = (stream.service_id, stream.attributes.qos);
            let misplaced: Vec<Handle> = stream
                .requests
                .to_vec(&self.requests)
                .into_iter()
                .filter(|h| {
                    self.requests
                        .get(*h)
                        .is_some_and(|r| self.match_service(r) != Ok(expected))
                })
                .collect();
            for handle in misplaced {
                self.move_request(handle);
            }
        }
    }

    fn move_request(&mut self, handle: Handle) {
        let stream_handle = self.detach_request(handle);
        if let Some(request) = self.requests.get_mut(handle) {
            request.state = RequestState::None;
            debug!(stream_id = request.user_id, "Request leaving its stream");
        }
        if let Some(stream_handle) = stream_handle {
            self.after_request_removed(stream_handle);
        }
        self.find_stream(handle, true);
    }

    /// A service was deleted by the provider.
    pub(super) fn service_removed(&mut self, service_id: ServiceId) {
        for stream_handle in self.streams.handles() {
            if let Some(stream) = self.streams.get_mut(stream_handle) {
                if stream.service_id == service_id {
                    // The provider dropped the stream along with the service.
                    stream.established = false;
                }
            }
        }
        self.item_groups.remove_service(service_id);
        self.reconcile_streams();
    }

    // ------------------------------------------------------------------
    // Symbol lists
    // ------------------------------------------------------------------

    fn apply_symbol_list(&mut self, parent: Handle, entries: &[SymbolListEntry]) {
        let Some(request) = self.requests.get(parent) else {
            return;
        };
        if !request.symbol_list_data_streams {
            return;
        }
        let parent_id = request.user_id;
        let binding = request.binding.clone();

        for entry in entries {
            let existing = self
                .symbol_list_children
                .get(&parent_id)
                .and_then(|children| children.get(&entry.name))
                .copied();
            match (entry.action, existing) {
                (MapAction::Add | MapAction::Update, None) => {
                    self.open_symbol_stream(parent_id, &entry.name, &binding)
                }
                (MapAction::Delete, Some(child_id)) => {
                    if let Some(children) = self.symbol_list_children.get_mut(&parent_id) {
                        children.remove(&entry.name);
                    }
                    if let Some(child) = self.requests_by_id.get(&child_id).copied() {
                        self.close_item_request(child);
                    }
                }
                _ => {}
            }
        }
    }

    fn open_symbol_stream(&mut self, parent_id: StreamId, name: &str, binding: &ServiceBinding) {
        let requests_by_id = &self.requests_by_id;
        let child_id = self.provider_ids.next_id(|id| requests_by_id.contains_key(&id));
        self.symbol_list_children
            .entry(parent_id)
            .or_default()
            .insert(name.to_string(), child_id);

        let mut key = MsgKey::named(name);
        if let ServiceBinding::Id(service_id) = binding {
            key.service_id = Some(*service_id);
        }
        let msg = RequestMsg::new(child_id, DomainType::MarketPrice, key);
        match self.open_item_request(&msg, binding.clone(), true) {
            Ok(_) => trace!(stream_id = child_id, parent = parent_id, symbol = name, "Symbol data stream opened"),
            Err(err) => {
                warn!(stream_id = child_id, symbol = name, error = %err, "Symbol data stream not opened");
                if let Some(children) = self.symbol_list_children.get_mut(&parent_id) {
                    children.remove(name);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    pub(super) fn deliver_status(&mut self, handle: Handle, state: State) {
        let Some(request) = self.requests.get(handle) else {
            return;
        };
        let mut status = StatusMsg::new(request.user_id, request.domain, state);
        status.key = Some(request.key.clone());
        self.deliver_to_request(handle, Msg::Status(status));
    }
}

fn protocol_state_of(state: &State) -> ProtocolState {
    match (state.stream_state, state.data_state) {
        (StreamState::Open, DataState::Suspect) => ProtocolState::Suspect,
        (StreamState::Open, _) => ProtocolState::Open,
        _ => ProtocolState::Closed,
    }
}
