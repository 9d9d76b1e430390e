//! Outstanding post tracking
//!
//! A post that asks for an acknowledgement is remembered under its
//! (post id, sequence number) until the matching ack or nak arrives or its
//! timer fires. Each stream (and the login stream, for off-stream posts)
//! owns one [`PostTable`].

use std::collections::HashMap;

use feed_types::domain::DomainType;
use feed_types::ids::StreamId;
use feed_types::key::MsgKey;
use feed_types::msg::{AckMsg, PostMsg};

use crate::error::PostError;
use crate::timer::TimerId;

/// Identity of an outstanding post within one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostKey {
    pub post_id: u32,
    pub seq_num: Option<u32>,
}

impl PostKey {
    pub fn for_ack(ack: &AckMsg) -> Self {
        Self {
            post_id: ack.ack_id,
            seq_num: ack.seq_num,
        }
    }
}

/// A post awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    pub key: PostKey,
    /// Application stream id the post was submitted on
    pub user_stream_id: StreamId,
    pub domain: DomainType,
    pub msg_key: Option<MsgKey>,
    pub timer: TimerId,
}

/// Check a post before it is sent.
///
/// Returns the tracking key when the post asks for an acknowledgement.
pub fn validate_post(post: &PostMsg) -> Result<Option<PostKey>, PostError> {
    if post.domain.is_administrative() {
        return Err(PostError::AdministrativeDomain);
    }
    let multi_part = !post.complete || post.part_num.is_some();
    if multi_part && post.seq_num.is_none() {
        return Err(PostError::MissingSeqNum);
    }
    if !post.ack_requested {
        return Ok(None);
    }
    let post_id = post.post_id.ok_or(PostError::MissingPostId)?;
    Ok(Some(PostKey {
        post_id,
        seq_num: post.seq_num,
    }))
}

/// Posts awaiting acknowledgement on one stream.
#[derive(Debug, Clone, Default)]
pub struct PostTable {
    records: HashMap<PostKey, PostRecord>,
}

impl PostTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &PostKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn insert(&mut self, record: PostRecord) -> Result<(), PostError> {
        if self.records.contains_key(&record.key) {
            return Err(PostError::Duplicate {
                post_id: record.key.post_id,
                seq_num: record.key.seq_num,
            });
        }
        self.records.insert(record.key, record);
        Ok(())
    }

    /// Remove the record an ack or nak answers.
    pub fn take_for_ack(&mut self, ack: &AckMsg) -> Option<PostRecord> {
        self.records.remove(&PostKey::for_ack(ack))
    }

    pub fn remove(&mut self, key: &PostKey) -> Option<PostRecord> {
        self.records.remove(key)
    }

    /// Remove every record submitted through `user_stream_id`.
    pub fn remove_for_request(&mut self, user_stream_id: StreamId) -> Vec<PostRecord> {
        let keys: Vec<PostKey> = self
            .records
            .values()
            .filter(|r| r.user_stream_id == user_stream_id)
            .map(|r| r.key)
            .collect();
        keys.iter().filter_map(|k| self.records.remove(k)).collect()
    }

    pub fn drain(&mut self) -> Vec<PostRecord> {
        let mut records: Vec<PostRecord> = self.records.drain().map(|(_, r)| r).collect();
        records.sort_by_key(|r| r.key);
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
