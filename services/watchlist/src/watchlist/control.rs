//! Login and directory control streams
//!
//! Both live on fixed wire ids. The login request is the application's own,
//! replayed on every channel-up. The directory request is internal; its
//! responses feed the service cache, and application directory requests are
//! answered from the cache.

use std::collections::BTreeMap;

use feed_types::directory::{service_filter, ServiceEntry};
use feed_types::domain::DomainType;
use feed_types::ids::{ServiceId, StreamId, DIRECTORY_STREAM_ID, LOGIN_STREAM_ID};
use feed_types::key::MsgKey;
use feed_types::msg::{Msg, Payload, RefreshMsg, RequestMsg, StatusMsg, UpdateMsg};
use feed_types::state::{DataState, State, StateCode, StreamState};
use tracing::{debug, info, warn};

use super::items::CHANNEL_DOWN;
use super::{retry_later, Watchlist};
use crate::codec::Codec;
use crate::error::WatchlistError;
use crate::events::SubmitOptions;
use crate::post::PostTable;
use crate::request::ServiceBinding;
use crate::service_cache::{filter_update_entry, Service, ServiceEvent};
use crate::transport::Transport;

/// Directory filter used when an application request names none
const DEFAULT_DIRECTORY_FILTER: u32 =
    service_filter::INFO | service_filter::STATE | service_filter::GROUP;

/// The application's login stream.
#[derive(Debug, Default)]
pub(super) struct LoginStream {
    /// Request as the application submitted it
    pub request: Option<RequestMsg>,
    pub send_pending: bool,
    pub established: bool,
    /// Off-stream posts awaiting acknowledgement
    pub posts: PostTable,
}

impl LoginStream {
    /// Application stream id of the login, once submitted.
    pub fn user_id(&self) -> Option<StreamId> {
        self.request.as_ref().map(|r| r.stream_id)
    }
}

/// One application directory request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct DirectoryRequest {
    pub filter: u32,
    /// `None` asks for every service
    pub service: Option<ServiceBinding>,
    pub streaming: bool,
    /// Has received its refresh since the directory was last established
    pub refreshed: bool,
}

impl DirectoryRequest {
    fn covers(&self, service_id: ServiceId, name: Option<&str>) -> bool {
        match &self.service {
            None => true,
            Some(ServiceBinding::Id(id)) => *id == service_id,
            Some(ServiceBinding::Name(wanted)) => name == Some(wanted.as_str()),
        }
    }

    fn key(&self) -> MsgKey {
        let mut key = MsgKey::default().with_filter(self.filter);
        if let Some(ServiceBinding::Id(id)) = &self.service {
            key.service_id = Some(*id);
        }
        key
    }

    fn service_name(&self) -> Option<String> {
        match &self.service {
            Some(ServiceBinding::Name(name)) => Some(name.clone()),
            _ => None,
        }
    }
}

/// The internal directory stream and the application requests it serves.
#[derive(Debug, Default)]
pub(super) struct DirectoryStream {
    pub send_pending: bool,
    /// The internal request went out on this connection
    pub requested: bool,
    /// A complete refresh arrived on this connection
    pub established: bool,
    pub requests: BTreeMap<StreamId, DirectoryRequest>,
}

impl<T: Transport, C: Codec> Watchlist<T, C> {
    // ------------------------------------------------------------------
    // Login
    // ------------------------------------------------------------------

    pub(super) fn submit_login(&mut self, msg: RequestMsg) -> Result<(), WatchlistError> {
        match self.login.user_id() {
            Some(current) if current != msg.stream_id => {
                return Err(WatchlistError::invalid_usage(
                    "Login stream is already open with a different stream id.",
                ));
            }
            Some(_) => {}
            None if self.stream_id_in_use(msg.stream_id) => {
                return Err(WatchlistError::invalid_usage(format!(
                    "Stream id {} is already in use.",
                    msg.stream_id
                )));
            }
            None => {}
        }

        info!(stream_id = msg.stream_id, user = ?msg.key.name, "Login request submitted");
        self.login.request = Some(msg);
        self.login.send_pending = true;
        if self.channel_up {
            self.send_login_request().or_else(retry_later)?;
        }
        Ok(())
    }

    pub(super) fn send_login_request(&mut self) -> Result<(), WatchlistError> {
        let Some(mut request) = self.login.request.clone() else {
            self.login.send_pending = false;
            return Ok(());
        };
        request.stream_id = LOGIN_STREAM_ID;
        self.send(&Msg::Request(request))?;
        self.login.send_pending = false;
        debug!("Login request sent");
        Ok(())
    }

    pub(super) fn close_login(&mut self) {
        let Some(request) = self.login.request.take() else {
            return;
        };
        if self.login.established {
            self.send_close(LOGIN_STREAM_ID, DomainType::Login);
        }
        self.login.established = false;
        self.login.send_pending = false;
        self.drain_login_posts();
        info!(stream_id = request.stream_id, "Login stream closed");
    }

    pub(super) fn read_login_msg(&mut self, msg: Msg) {
        let state = msg.state().cloned();
        match msg {
            Msg::Ack(ack) => {
                self.read_login_ack(ack);
                return;
            }
            Msg::Refresh(_) | Msg::Status(_) | Msg::Update(_) | Msg::Generic(_) => {
                match self.login.user_id() {
                    Some(user_id) => self.deliver(user_id, msg, None),
                    None => debug!(class = msg.class_label(), "Login message with no login request dropped"),
                }
            }
            other => {
                warn!(class = other.class_label(), "Unexpected message on login stream dropped");
                return;
            }
        }
        if let Some(state) = state {
            self.on_login_state(&state);
        }
    }

    fn on_login_state(&mut self, state: &State) {
        match state.stream_state {
            StreamState::Open if state.data_state == DataState::Ok => {
                if !self.login.established {
                    self.login.established = true;
                    info!("Login established");
                }
                if !self.directory.requested {
                    self.directory.send_pending = true;
                }
            }
            // Suspect login data leaves the session as it was.
            StreamState::Open => {}
            StreamState::ClosedRecover if self.config.single_open => {
                warn!(code = ?state.code, text = %state.text, "Login closed, will be re-sent");
                self.login.established = false;
                self.login.send_pending = true;
            }
            _ => {
                warn!(state = ?state.stream_state, text = %state.text, "Login closed");
                self.login.established = false;
                self.login.send_pending = false;
                self.login.request = None;
                self.drain_login_posts();
            }
        }
    }

    fn drain_login_posts(&mut self) {
        for record in self.login.posts.drain() {
            self.timers.destroy(record.timer);
            self.outstanding_posts = self.outstanding_posts.saturating_sub(1);
        }
    }

    // ------------------------------------------------------------------
    // Directory
    // ------------------------------------------------------------------

    pub(super) fn send_directory_request(&mut self) -> Result<(), WatchlistError> {
        let filter = self.config.directory_filter;
        let key = MsgKey::default().with_filter(filter);
        let request = RequestMsg::new(DIRECTORY_STREAM_ID, DomainType::Source, key);
        self.send(&Msg::Request(request))?;
        self.directory.send_pending = false;
        self.directory.requested = true;
        debug!(filter, "Directory request sent");
        Ok(())
    }

    pub(super) fn submit_directory_request(
        &mut self,
        msg: RequestMsg,
        options: &SubmitOptions,
    ) -> Result<(), WatchlistError> {
        let service = match (msg.key.service_id, options.service_name.as_ref()) {
            (Some(_), Some(_)) => {
                return Err(WatchlistError::invalid_usage(
                    "Request has both a service name and a service id.",
                ))
            }
            (Some(id), None) => Some(ServiceBinding::Id(id)),
            (None, Some(name)) => Some(ServiceBinding::Name(name.clone())),
            (None, None) => None,
        };

        match self.directory.requests.get(&msg.stream_id) {
            Some(existing) if existing.service != service => {
                return Err(WatchlistError::invalid_usage(
                    "Directory request reissue may not change the service.",
                ));
            }
            Some(_) => {}
            None if self.stream_id_in_use(msg.stream_id) => {
                return Err(WatchlistError::invalid_usage(format!(
                    "Stream id {} is already in use.",
                    msg.stream_id
                )));
            }
            None => {}
        }

        let stream_id = msg.stream_id;
        let reissue = self.directory.requests.contains_key(&stream_id);
        let request = DirectoryRequest {
            filter: msg.key.filter.unwrap_or(DEFAULT_DIRECTORY_FILTER),
            service,
            streaming: msg.streaming,
            refreshed: reissue && msg.no_refresh,
        };
        debug!(stream_id, filter = request.filter, reissue, "Directory request submitted");
        self.directory.requests.insert(stream_id, request);

        if self.directory.established && !(reissue && msg.no_refresh) {
            self.deliver_directory_refresh(stream_id);
        }
        Ok(())
    }

    /// Answer one application directory request from the cache.
    fn deliver_directory_refresh(&mut self, stream_id: StreamId) {
        let Some(request) = self.directory.requests.get(&stream_id).cloned() else {
            return;
        };
        let entries: Vec<ServiceEntry> = self
            .services
            .iter()
            .filter(|s| request.covers(s.service_id, s.name()))
            .map(|s| s.to_refresh_entry(request.filter).0)
            .collect();

        let state = if request.streaming {
            State::open_ok()
        } else {
            State::new(StreamState::NonStreaming, DataState::Ok, StateCode::None, "")
        };
        let mut refresh = RefreshMsg::new(stream_id, DomainType::Source, state)
            .with_payload(Payload::ServiceList(entries));
        refresh.key = Some(request.key());
        refresh.clear_cache = true;
        self.deliver(stream_id, Msg::Refresh(refresh), request.service_name());

        if request.streaming {
            if let Some(request) = self.directory.requests.get_mut(&stream_id) {
                request.refreshed = true;
            }
        } else {
            self.directory.requests.remove(&stream_id);
        }
    }

    fn refresh_app_directory_requests(&mut self) {
        let pending: Vec<StreamId> = self
            .directory
            .requests
            .iter()
            .filter(|(_, r)| !r.refreshed)
            .map(|(id, _)| *id)
            .collect();
        for stream_id in pending {
            self.deliver_directory_refresh(stream_id);
        }
    }

    /// Forward service changes to application directory requests, filtered
    /// per request. Changes with nothing left after filtering are dropped.
    fn fan_directory_update(&mut self, events: &[ServiceEvent]) {
        let mut updates = Vec::new();
        for (stream_id, request) in &self.directory.requests {
            if !request.refreshed {
                continue;
            }
            let mut entries = Vec::new();
            for event in events {
                match event {
                    ServiceEvent::Added { service_id, entry }
                    | ServiceEvent::Updated {
                        service_id, entry, ..
                    } => {
                        let name = self.services.service_name(*service_id);
                        if !request.covers(*service_id, name) {
                            continue;
                        }
                        let (filtered, count) = filter_update_entry(entry, request.filter);
                        if count > 0 {
                            entries.push(filtered);
                        }
                    }
                    ServiceEvent::Removed {
                        service_id,
                        name,
                        connection_loss: false,
                    } if request.covers(*service_id, name.as_deref()) => {
                        entries.push(ServiceEntry::delete(*service_id));
                    }
                    ServiceEvent::Removed { .. } => {}
                }
            }
            if !entries.is_empty() {
                updates.push((*stream_id, request.service_name(), entries));
            }
        }

        for (stream_id, service_name, entries) in updates {
            let update = UpdateMsg::new(stream_id, DomainType::Source, Payload::ServiceList(entries));
            self.deliver(stream_id, Msg::Update(update), service_name);
        }
    }

    pub(super) fn read_directory_msg(&mut self, msg: Msg) {
        match msg {
            Msg::Refresh(refresh) => {
                let cleared = if refresh.clear_cache {
                    self.services.clear(false)
                } else {
                    Vec::new()
                };
                let mut events = match &refresh.payload {
                    Payload::ServiceList(entries) => self.apply_directory_refresh(entries),
                    _ => Vec::new(),
                };
                // Services restated by the same refresh were never really gone.
                events.extend(
                    cleared
                        .into_iter()
                        .filter(|e| self.services.get(e.service_id()).is_none()),
                );
                self.on_service_events(events);

                if refresh.complete {
                    if !self.directory.established {
                        self.directory.established = true;
                        info!(services = self.services.len(), "Directory established");
                    }
                    self.reconcile_streams();
                    self.refresh_app_directory_requests();
                }
                self.retry_waiting_requests();
                if refresh.state.stream_state.is_final() {
                    self.on_directory_closed(&refresh.state);
                }
            }
            Msg::Update(update) => {
                if let Payload::ServiceList(entries) = &update.payload {
                    let outcome = self.services.process_service_list(entries);
                    self.on_service_events(outcome.events);
                    self.retry_waiting_requests();
                }
            }
            Msg::Status(status) => {
                if status.clear_cache {
                    let events = self.services.clear(false);
                    self.on_service_events(events);
                }
                if let Some(state) = status.state.filter(|s| s.stream_state.is_final()) {
                    self.on_directory_closed(&state);
                }
            }
            Msg::Generic(_) => debug!("Directory generic message ignored"),
            other => warn!(class = other.class_label(), "Unexpected message on directory stream dropped"),
        }
    }

    /// A refresh restates services, so an ADD for a known id is an update.
    fn apply_directory_refresh(&mut self, entries: &[ServiceEntry]) -> Vec<ServiceEvent> {
        let entries: Vec<ServiceEntry> = entries
            .iter()
            .cloned()
            .map(|mut entry| {
                if entry.action == feed_types::directory::MapAction::Add
                    && self.services.get(entry.service_id).is_some()
                {
                    entry.action = feed_types::directory::MapAction::Update;
                }
                entry
            })
            .collect();
        self.services.process_service_list(&entries).events
    }

    fn on_service_events(&mut self, events: Vec<ServiceEvent>) {
        if events.is_empty() {
            return;
        }
        for event in &events {
            match event {
                ServiceEvent::Added { service_id, entry }
                | ServiceEvent::Updated {
                    service_id, entry, ..
                } => self.apply_group_entries(*service_id, entry),
                ServiceEvent::Removed {
                    service_id,
                    connection_loss: false,
                    ..
                } => self.service_removed(*service_id),
                ServiceEvent::Removed { .. } => {}
            }
        }
        self.fan_directory_update(&events);
    }

    /// Bulk status and merges for item groups of a service.
    fn apply_group_entries(&mut self, service_id: ServiceId, entry: &ServiceEntry) {
        for group in &entry.groups {
            if let Some(state) = &group.status {
                let members = self.item_groups.members(service_id, group.group.as_bytes());
                debug!(service_id, group = %group.group, streams = members.len(), "Group status");
                for stream_id in members {
                    let Some(handle) = self.streams.handle_for(stream_id) else {
                        continue;
                    };
                    let domain = self
                        .streams
                        .get(handle)
                        .map(|s| s.domain())
                        .unwrap_or(DomainType::MarketPrice);
                    let status = StatusMsg::new(stream_id, domain, state.clone());
                    self.read_item_status(handle, status);
                }
            }
            if let Some(target) = &group.merged_to {
                self.item_groups
                    .merge(service_id, group.group.as_bytes(), target.as_bytes());
            }
        }
    }

    fn on_directory_closed(&mut self, state: &State) {
        warn!(state = ?state.stream_state, text = %state.text, "Directory stream closed");
        self.directory.established = false;
        self.directory.requested = false;
        self.directory.send_pending =
            state.stream_state == StreamState::ClosedRecover && self.config.single_open;
    }

    /// Connection lost: every control stream must be re-established.
    pub(super) fn control_channel_down(&mut self) {
        if let Some(user_id) = self.login.user_id() {
            self.login.established = false;
            self.drain_login_posts();
            let status = StatusMsg::new(
                user_id,
                DomainType::Login,
                State::open_suspect(StateCode::None, CHANNEL_DOWN),
            );
            self.deliver(user_id, Msg::Status(status), None);
        }

        self.directory.established = false;
        self.directory.requested = false;
        self.directory.send_pending = false;
        let removed = self.services.clear(true);
        debug!(services = removed.len(), "Service cache cleared on connection loss");

        let requests: Vec<(StreamId, Option<String>)> = self
            .directory
            .requests
            .iter_mut()
            .map(|(id, request)| {
                request.refreshed = false;
                (*id, request.service_name())
            })
            .collect();
        for (stream_id, service_name) in requests {
            let status = StatusMsg::new(
                stream_id,
                DomainType::Source,
                State::open_suspect(StateCode::None, CHANNEL_DOWN),
            );
            self.deliver(stream_id, Msg::Status(status), service_name);
        }
    }

    /// Services currently able to carry `domain`, by id.
    pub fn services_for(&self, domain: DomainType) -> Vec<ServiceId> {
        self.services
            .iter()
            .filter(|s| s.supports_domain(domain) && Service::is_up(s))
            .map(|s| s.service_id)
            .collect()
    }
}
