//! Posts, acknowledgements and generic messages

use std::time::Instant;

use feed_types::ids::{StreamId, LOGIN_STREAM_ID};
use feed_types::msg::{AckMsg, GenericMsg, Msg, NakCode, PostMsg};
use tracing::{debug, warn};

use super::{TimerOwner, Watchlist};
use crate::arena::Handle;
use crate::codec::Codec;
use crate::error::{PostError, WatchlistError};
use crate::events::SubmitOptions;
use crate::post::{validate_post, PostKey, PostRecord, PostTable};
use crate::stream::ProtocolState;
use crate::transport::Transport;

const ACK_TIMEOUT_TEXT: &str = "Acknowledgement timed out.";

/// Where an application stream id sends its posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostRoute {
    /// Off-stream post through the login stream
    Login,
    Item(Handle),
}

impl<T: Transport, C: Codec> Watchlist<T, C> {
    fn post_route(&self, user_id: StreamId) -> Result<PostRoute, WatchlistError> {
        if !self.channel_up {
            return Err(WatchlistError::NotConnected);
        }
        if self.login.user_id() == Some(user_id) {
            if !self.login.established {
                return Err(WatchlistError::invalid_usage("Login stream is not established."));
            }
            return Ok(PostRoute::Login);
        }
        let request = self
            .request_by_id(user_id)
            .ok_or(WatchlistError::UnknownStream(user_id))?;
        let open = request
            .stream
            .and_then(|h| self.streams.get(h).map(|s| (h, s)))
            .filter(|(_, s)| s.established && s.protocol_state != ProtocolState::Closed);
        match open {
            Some((handle, _)) => Ok(PostRoute::Item(handle)),
            None => Err(WatchlistError::invalid_usage(format!(
                "Stream {user_id} is not open."
            ))),
        }
    }

    fn wire_id_of(&self, route: PostRoute) -> Option<StreamId> {
        match route {
            PostRoute::Login => Some(LOGIN_STREAM_ID),
            PostRoute::Item(handle) => self.streams.get(handle).map(|s| s.stream_id),
        }
    }

    fn post_table(&mut self, route: PostRoute) -> Option<&mut PostTable> {
        match route {
            PostRoute::Login => Some(&mut self.login.posts),
            PostRoute::Item(handle) => self.streams.get_mut(handle).map(|s| &mut s.posts),
        }
    }

    fn post_table_for_wire(&mut self, stream_id: StreamId) -> Option<&mut PostTable> {
        if stream_id == LOGIN_STREAM_ID {
            return Some(&mut self.login.posts);
        }
        let handle = self.streams.handle_for(stream_id)?;
        self.streams.get_mut(handle).map(|s| &mut s.posts)
    }

    pub(super) fn submit_post(
        &mut self,
        mut post: PostMsg,
        options: &SubmitOptions,
        now: Instant,
    ) -> Result<(), WatchlistError> {
        let ack_key = validate_post(&post)?;
        let route = self.post_route(post.stream_id)?;

        if let Some(name) = &options.service_name {
            let service_id = self.services.service_id(name).ok_or_else(|| {
                WatchlistError::invalid_usage(format!("Service {name} is not known."))
            })?;
            post.key.get_or_insert_with(Default::default).service_id = Some(service_id);
        }

        if let Some(key) = ack_key {
            let duplicate = self
                .post_table(route)
                .map(|table| table.contains(&key))
                .unwrap_or(false);
            if duplicate {
                return Err(PostError::Duplicate {
                    post_id: key.post_id,
                    seq_num: key.seq_num,
                }
                .into());
            }
            let limit = self.config.max_outstanding_posts;
            if self.outstanding_posts >= limit {
                return Err(PostError::TooManyOutstanding { limit }.into());
            }
        }

        let wire_id = self
            .wire_id_of(route)
            .ok_or(WatchlistError::UnknownStream(post.stream_id))?;
        let user_id = post.stream_id;
        let domain = post.domain;
        let msg_key = post.key.clone();
        post.stream_id = wire_id;
        self.send(&Msg::Post(post))?;
        self.stats.posts_sent += 1;

        let Some(key) = ack_key else {
            debug!(stream_id = user_id, "Post sent");
            return Ok(());
        };
        let timer = self.timers.create_timer(
            self.post_timeouts,
            TimerOwner::PostAck {
                stream_id: wire_id,
                key,
            },
        );
        self.timers.start(timer, now);
        let record = PostRecord {
            key,
            user_stream_id: user_id,
            domain,
            msg_key,
            timer,
        };
        let inserted = match self.post_table(route) {
            Some(table) => table.insert(record),
            None => Err(PostError::Duplicate {
                post_id: key.post_id,
                seq_num: key.seq_num,
            }),
        };
        if let Err(err) = inserted {
            self.timers.destroy(timer);
            return Err(err.into());
        }
        self.outstanding_posts += 1;
        debug!(
            stream_id = user_id,
            post_id = key.post_id,
            seq_num = ?key.seq_num,
            "Post sent, awaiting acknowledgement"
        );
        Ok(())
    }

    pub(super) fn submit_generic(&mut self, mut generic: GenericMsg) -> Result<(), WatchlistError> {
        let route = self.post_route(generic.stream_id)?;
        let wire_id = self
            .wire_id_of(route)
            .ok_or(WatchlistError::UnknownStream(generic.stream_id))?;
        generic.stream_id = wire_id;
        self.send(&Msg::Generic(generic))
    }

    pub(super) fn read_item_ack(&mut self, stream_handle: Handle, ack: AckMsg) {
        let record = self
            .streams
            .get_mut(stream_handle)
            .and_then(|s| s.posts.take_for_ack(&ack));
        self.complete_post(record, ack);
    }

    pub(super) fn read_login_ack(&mut self, ack: AckMsg) {
        let record = self.login.posts.take_for_ack(&ack);
        self.complete_post(record, ack);
    }

    fn complete_post(&mut self, record: Option<PostRecord>, ack: AckMsg) {
        let Some(record) = record else {
            debug!(
                stream_id = ack.stream_id,
                ack_id = ack.ack_id,
                "Acknowledgement for unknown post dropped"
            );
            return;
        };
        self.timers.destroy(record.timer);
        self.outstanding_posts = self.outstanding_posts.saturating_sub(1);
        self.stats.posts_acked += 1;
        if ack.is_nak() {
            warn!(
                stream_id = record.user_stream_id,
                ack_id = ack.ack_id,
                nak = ?ack.nak_code,
                "Post rejected"
            );
        }
        self.deliver(record.user_stream_id, Msg::Ack(ack), None);
    }

    /// No acknowledgement arrived in time: answer the post with a nak.
    pub(super) fn on_post_timeout(
        &mut self,
        timer: crate::timer::TimerId,
        stream_id: StreamId,
        key: PostKey,
    ) {
        self.timers.destroy(timer);
        let Some(record) = self
            .post_table_for_wire(stream_id)
            .and_then(|table| table.remove(&key))
        else {
            return;
        };
        self.outstanding_posts = self.outstanding_posts.saturating_sub(1);
        self.stats.posts_timed_out += 1;
        warn!(
            stream_id = record.user_stream_id,
            post_id = key.post_id,
            seq_num = ?key.seq_num,
            "Post acknowledgement timed out"
        );

        let mut nak = AckMsg::new(record.user_stream_id, record.domain, key.post_id, key.seq_num);
        nak.key = record.msg_key;
        nak.nak_code = Some(NakCode::NoResponse);
        nak.text = Some(ACK_TIMEOUT_TEXT.to_string());
        self.deliver(record.user_stream_id, Msg::Ack(nak), None);
    }
}
