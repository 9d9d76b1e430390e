//! View aggregation
//!
//! Requests sharing a stream each ask for a subset of fields. The stream
//! sends the union of those subsets, reference-counted per element so that
//! dropping one request's view keeps fields another request still needs.
//!
//! Member views move through three stages:
//!
//! ```text
//!   add_view        merge          commit
//!  ─────────▶ new ───────▶ merged ───────▶ committed
//!              ▲            │
//!              └────────────┘
//!                 rollback
//! ```
//!
//! Each element of the flattened table carries a count of the merged and
//! committed views containing it, plus whether it is already on the wire.
//! A zero-count element that is committed stays in the table until the next
//! commit so the shrink can be detected; a zero-count element that is not
//! committed is dropped at once.

use std::cmp::Ordering;

use feed_types::errors::ModelError;
use feed_types::ids::StreamId;
use feed_types::view::{ViewKind, ViewSpec};
use thiserror::Error;

/// One field id or element name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewElement {
    FieldId(i16),
    Name(String),
}

/// View errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewError {
    #[error("view kind {requested:?} does not match stream view kind {existing:?}")]
    KindMismatch {
        existing: ViewKind,
        requested: ViewKind,
    },

    #[error("request {0} already has a view on this stream")]
    DuplicateOwner(StreamId),
}

/// A request's view: sorted, deduplicated and immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    kind: ViewKind,
    elements: Vec<ViewElement>,
}

impl View {
    pub fn new(spec: &ViewSpec) -> Result<Self, ModelError> {
        let mut elements: Vec<ViewElement> = match spec {
            ViewSpec::FieldIds(ids) => ids.iter().copied().map(ViewElement::FieldId).collect(),
            ViewSpec::ElementNames(names) => names.iter().cloned().map(ViewElement::Name).collect(),
        };
        elements.sort();
        elements.dedup();
        if elements.is_empty() {
            return Err(ModelError::EmptyView);
        }
        Ok(Self {
            kind: spec.kind(),
            elements,
        })
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn elements(&self) -> &[ViewElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AggregateEntry {
    value: ViewElement,
    count: u32,
    committed: bool,
}

/// Member view tagged with the request that owns it.
#[derive(Debug, Clone)]
struct Member {
    owner: StreamId,
    view: View,
}

/// Reference-counted union of the views on one stream.
#[derive(Debug, Clone)]
pub struct AggregateView {
    kind: ViewKind,
    new_views: Vec<Member>,
    merged: Vec<Member>,
    committed: Vec<Member>,
    /// Sorted by value
    entries: Vec<AggregateEntry>,
}

impl AggregateView {
    pub fn new(kind: ViewKind) -> Self {
        Self {
            kind,
            new_views: Vec::new(),
            merged: Vec::new(),
            committed: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    /// Queue a request's view for the next merge.
    pub fn add_view(&mut self, owner: StreamId, view: View) -> Result<(), ViewError> {
        if view.kind != self.kind {
            return Err(ViewError::KindMismatch {
                existing: self.kind,
                requested: view.kind,
            });
        }
        if self.has_member(owner) {
            return Err(ViewError::DuplicateOwner(owner));
        }
        self.new_views.push(Member { owner, view });
        Ok(())
    }

    /// Merge every new view into the table.
    ///
    /// Returns true if the wire view must change: some element was absent
    /// or not yet committed.
    pub fn merge(&mut self) -> bool {
        let mut updated = false;
        for member in std::mem::take(&mut self.new_views) {
            for element in member.view.elements() {
                updated |= self.increment(element);
            }
            self.merged.push(member);
        }
        updated
    }

    /// Remove a request's view from whichever stage holds it.
    ///
    /// Returns true if an element's count dropped to zero.
    pub fn remove_view(&mut self, owner: StreamId) -> bool {
        if let Some(pos) = self.new_views.iter().position(|m| m.owner == owner) {
            self.new_views.remove(pos);
            return false;
        }

        let member = if let Some(pos) = self.merged.iter().position(|m| m.owner == owner) {
            self.merged.remove(pos)
        } else if let Some(pos) = self.committed.iter().position(|m| m.owner == owner) {
            self.committed.remove(pos)
        } else {
            return false;
        };

        let mut emptied = false;
        for element in member.view.elements() {
            emptied |= self.decrement(element);
        }
        self.compact();
        emptied
    }

    /// The merged views reached the wire.
    ///
    /// Returns true if the committed element set changed.
    pub fn commit(&mut self) -> bool {
        self.committed.append(&mut self.merged);

        let mut changed = false;
        for entry in &mut self.entries {
            if entry.count > 0 && !entry.committed {
                entry.committed = true;
                changed = true;
            }
        }

        let before = self.entries.len();
        self.entries.retain(|entry| entry.count > 0);
        changed || self.entries.len() != before
    }

    /// The send carrying the merged views failed.
    ///
    /// Undoes every merge since the last commit and returns those views to
    /// the new stage so the next send retries them.
    pub fn rollback(&mut self) {
        let merged = std::mem::take(&mut self.merged);
        for member in &merged {
            for element in member.view.elements() {
                self.decrement(element);
            }
        }
        self.compact();

        let mut requeued = merged;
        requeued.append(&mut self.new_views);
        self.new_views = requeued;
    }

    /// Every element of `view` is already on the wire.
    pub fn contains_view(&self, view: &View) -> bool {
        view.elements().iter().all(|element| {
            self.find(element)
                .map(|index| self.entries[index].committed)
                .unwrap_or(false)
        })
    }

    /// Merging the pending new views would not change the wire view.
    pub fn contains_new_views(&self) -> bool {
        self.new_views.iter().all(|m| self.contains_view(&m.view))
    }

    pub fn has_new_views(&self) -> bool {
        !self.new_views.is_empty()
    }

    pub fn has_member(&self, owner: StreamId) -> bool {
        self.members().any(|m| m.owner == owner)
    }

    /// Views held in any stage
    pub fn member_count(&self) -> usize {
        self.new_views.len() + self.merged.len() + self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_count() == 0
    }

    /// Elements with a non-zero count, in order.
    pub fn elements(&self) -> Vec<&ViewElement> {
        self.entries
            .iter()
            .filter(|entry| entry.count > 0)
            .map(|entry| &entry.value)
            .collect()
    }

    /// View payload for the wire, or `None` if nothing is counted.
    pub fn wire_view(&self) -> Option<ViewSpec> {
        let elements = self.elements();
        if elements.is_empty() {
            return None;
        }
        let spec = match self.kind {
            ViewKind::FieldIdList => ViewSpec::FieldIds(
                elements
                    .into_iter()
                    .filter_map(|e| match e {
                        ViewElement::FieldId(id) => Some(*id),
                        ViewElement::Name(_) => None,
                    })
                    .collect(),
            ),
            ViewKind::ElementNameList => ViewSpec::ElementNames(
                elements
                    .into_iter()
                    .filter_map(|e| match e {
                        ViewElement::Name(name) => Some(name.clone()),
                        ViewElement::FieldId(_) => None,
                    })
                    .collect(),
            ),
        };
        Some(spec)
    }

    /// Reference count of an element, if it is in the table.
    pub fn count_of(&self, element: &ViewElement) -> Option<u32> {
        self.find(element).map(|index| self.entries[index].count)
    }

    pub fn is_committed(&self, element: &ViewElement) -> Option<bool> {
        self.find(element).map(|index| self.entries[index].committed)
    }

    /// Recount every element from the merged and committed views and compare
    /// with the table.
    pub fn verify_counts(&self) -> bool {
        let counted = self.merged.iter().chain(self.committed.iter());
        let mut expected: std::collections::BTreeMap<&ViewElement, u32> = Default::default();
        for member in counted {
            for element in member.view.elements() {
                *expected.entry(element).or_default() += 1;
            }
        }

        let sorted = self
            .entries
            .windows(2)
            .all(|pair| pair[0].value.cmp(&pair[1].value) == Ordering::Less);
        let table_matches = self
            .entries
            .iter()
            .all(|entry| expected.get(&entry.value).copied().unwrap_or(0) == entry.count);
        let nothing_missing = expected.keys().all(|element| self.find(element).is_some());
        let no_stale = self.entries.iter().all(|e| e.count > 0 || e.committed);

        sorted && table_matches && nothing_missing && no_stale
    }

    fn members(&self) -> impl Iterator<Item = &Member> {
        self.new_views
            .iter()
            .chain(self.merged.iter())
            .chain(self.committed.iter())
    }

    fn find(&self, element: &ViewElement) -> Option<usize> {
        self.entries
            .binary_search_by(|entry| entry.value.cmp(element))
            .ok()
    }

    /// Returns true if the element was absent or not yet committed.
    fn increment(&mut self, element: &ViewElement) -> bool {
        match self.entries.binary_search_by(|entry| entry.value.cmp(element)) {
            Ok(index) => {
                let entry = &mut self.entries[index];
                entry.count += 1;
                !entry.committed
            }
            Err(index) => {
                self.entries.insert(
                    index,
                    AggregateEntry {
                        value: element.clone(),
                        count: 1,
                        committed: false,
                    },
                );
                true
            }
        }
    }

    /// Returns true if the count reached zero.
    fn decrement(&mut self, element: &ViewElement) -> bool {
        match self.find(element) {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.count = entry.count.saturating_sub(1);
                entry.count == 0
            }
            None => false,
        }
    }

    /// Drop zero-count elements that never reached the wire.
    fn compact(&mut self) {
        self.entries.retain(|entry| entry.count > 0 || entry.committed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fids(ids: &[i16]) -> View {
        View::new(&ViewSpec::FieldIds(ids.to_vec())).unwrap()
    }

    fn counts(agg: &AggregateView, ids: &[i16]) -> Vec<Option<u32>> {
        ids.iter().map(|id| agg.count_of(&ViewElement::FieldId(*id))).collect()
    }

    #[test]
    fn test_view_is_sorted_and_deduplicated() {
        let view = fids(&[25, 22, 25, 3]);
        assert_eq!(
            view.elements(),
            &[ViewElement::FieldId(3), ViewElement::FieldId(22), ViewElement::FieldId(25)]
        );
        assert_eq!(View::new(&ViewSpec::FieldIds(vec![])), Err(ModelError::EmptyView));
    }

    #[test]
    fn test_merge_overlapping_views() {
        let mut agg = AggregateView::new(ViewKind::FieldIdList);
        agg.add_view(1, fids(&[1, 2, 3])).unwrap();
        agg.add_view(2, fids(&[2, 3, 4])).unwrap();

        assert!(agg.merge());
        assert_eq!(counts(&agg, &[1, 2, 3, 4]), vec![Some(1), Some(2), Some(2), Some(1)]);
        assert!(agg.commit());
        assert!(agg.verify_counts());
    }

    #[test]
    fn test_remove_after_commit_keeps_shared_elements() {
        let mut agg = AggregateView::new(ViewKind::FieldIdList);
        agg.add_view(1, fids(&[1, 2, 3])).unwrap();
        agg.add_view(2, fids(&[2, 3, 4])).unwrap();
        agg.merge();
        agg.commit();

        assert!(agg.remove_view(1));
        assert_eq!(agg.count_of(&ViewElement::FieldId(1)), Some(0));
        assert_eq!(agg.is_committed(&ViewElement::FieldId(1)), Some(true));
        assert_eq!(agg.wire_view(), Some(ViewSpec::FieldIds(vec![2, 3, 4])));
        assert!(agg.contains_view(&fids(&[2, 3, 4])));

        assert!(agg.commit());
        assert_eq!(counts(&agg, &[1, 2, 3, 4]), vec![None, Some(1), Some(1), Some(1)]);
        assert!(agg.verify_counts());
    }

    #[test]
    fn test_noop_merge_and_commit() {
        let mut agg = AggregateView::new(ViewKind::FieldIdList);
        agg.add_view(1, fids(&[5, 6])).unwrap();
        agg.merge();
        agg.commit();

        agg.add_view(2, fids(&[6])).unwrap();
        assert!(agg.contains_new_views());
        assert!(!agg.merge());
        assert!(!agg.commit());
    }

    #[test]
    fn test_merge_with_new_element_reports_update() {
        let mut agg = AggregateView::new(ViewKind::FieldIdList);
        agg.add_view(1, fids(&[5])).unwrap();
        agg.merge();
        agg.commit();

        agg.add_view(2, fids(&[5, 7])).unwrap();
        assert!(!agg.contains_new_views());
        assert!(agg.merge());
    }

    #[test]
    fn test_rollback_restores_table_and_requeues() {
        let mut agg = AggregateView::new(ViewKind::FieldIdList);
        agg.add_view(1, fids(&[1, 2])).unwrap();
        agg.merge();
        agg.commit();

        agg.add_view(2, fids(&[2, 9])).unwrap();
        agg.merge();
        assert_eq!(agg.count_of(&ViewElement::FieldId(9)), Some(1));

        agg.rollback();
        assert_eq!(agg.count_of(&ViewElement::FieldId(9)), None);
        assert_eq!(agg.count_of(&ViewElement::FieldId(2)), Some(1));
        assert!(agg.has_new_views());
        assert!(agg.verify_counts());

        assert!(agg.merge());
        assert!(agg.commit());
        assert_eq!(agg.wire_view(), Some(ViewSpec::FieldIds(vec![1, 2, 9])));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut agg = AggregateView::new(ViewKind::FieldIdList);
        let names = View::new(&ViewSpec::ElementNames(vec!["BID".into()])).unwrap();
        assert_eq!(
            agg.add_view(1, names),
            Err(ViewError::KindMismatch {
                existing: ViewKind::FieldIdList,
                requested: ViewKind::ElementNameList,
            })
        );
        agg.add_view(1, fids(&[1])).unwrap();
        assert_eq!(agg.add_view(1, fids(&[2])), Err(ViewError::DuplicateOwner(1)));
    }

    #[test]
    fn test_remove_new_view_leaves_table_alone() {
        let mut agg = AggregateView::new(ViewKind::FieldIdList);
        agg.add_view(1, fids(&[1])).unwrap();
        assert!(!agg.remove_view(1));
        assert!(agg.is_empty());
        assert!(agg.wire_view().is_none());
    }

    #[test]
    fn test_uncommitted_zero_count_is_compacted() {
        let mut agg = AggregateView::new(ViewKind::FieldIdList);
        agg.add_view(1, fids(&[4])).unwrap();
        agg.merge();
        assert!(agg.remove_view(1));
        assert_eq!(agg.count_of(&ViewElement::FieldId(4)), None);
    }

    #[test]
    fn test_element_name_wire_view() {
        let mut agg = AggregateView::new(ViewKind::ElementNameList);
        agg.add_view(1, View::new(&ViewSpec::ElementNames(vec!["BID".into(), "ASK".into()])).unwrap())
            .unwrap();
        agg.merge();
        assert_eq!(
            agg.wire_view(),
            Some(ViewSpec::ElementNames(vec!["ASK".into(), "BID".into()]))
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(StreamId, Vec<i16>),
        Merge,
        Commit,
        Rollback,
        Remove(StreamId),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..6i32, prop::collection::vec(0..12i16, 1..6)).prop_map(|(o, ids)| Op::Add(o, ids)),
            Just(Op::Merge),
            Just(Op::Commit),
            Just(Op::Rollback),
            (0..6i32).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_counts_match_members(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let mut agg = AggregateView::new(ViewKind::FieldIdList);
            for op in ops {
                match op {
                    Op::Add(owner, ids) => {
                        let _ = agg.add_view(owner, fids(&ids));
                    }
                    Op::Merge => {
                        agg.merge();
                    }
                    Op::Commit => {
                        agg.commit();
                    }
                    Op::Rollback => agg.rollback(),
                    Op::Remove(owner) => {
                        agg.remove_view(owner);
                    }
                }
                prop_assert!(agg.verify_counts());
            }
        }

        #[test]
        fn prop_commit_after_commit_is_noop(ids in prop::collection::vec(0..50i16, 1..10)) {
            let mut agg = AggregateView::new(ViewKind::FieldIdList);
            agg.add_view(1, fids(&ids)).unwrap();
            prop_assert!(agg.merge());
            agg.commit();
            agg.add_view(2, fids(&ids)).unwrap();
            prop_assert!(!agg.merge());
            prop_assert!(!agg.commit());
        }
    }
}
