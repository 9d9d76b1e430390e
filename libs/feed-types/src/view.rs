//! View requests
//!
//! A view narrows an item stream to a subset of its fields, either by field id
//! or by element name. The two kinds never mix on one stream.

use serde::{Deserialize, Serialize};

/// Which kind of element list a view carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewKind {
    FieldIdList,
    ElementNameList,
}

/// Decoded view payload of a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "elements")]
pub enum ViewSpec {
    FieldIds(Vec<i16>),
    ElementNames(Vec<String>),
}

impl ViewSpec {
    pub fn kind(&self) -> ViewKind {
        match self {
            ViewSpec::FieldIds(_) => ViewKind::FieldIdList,
            ViewSpec::ElementNames(_) => ViewKind::ElementNameList,
        }
    }

    /// Number of elements as given (duplicates included)
    pub fn len(&self) -> usize {
        match self {
            ViewSpec::FieldIds(ids) => ids.len(),
            ViewSpec::ElementNames(names) => names.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a request asks to do with its view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "view")]
pub enum ViewAction {
    /// No view: full data
    #[default]
    None,
    /// Set (or replace) the view
    Set(ViewSpec),
    /// Keep whatever view the request already has (reissue only)
    Maintain,
}

impl ViewAction {
    pub fn spec(&self) -> Option<&ViewSpec> {
        match self {
            ViewAction::Set(spec) => Some(spec),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_kind() {
        assert_eq!(ViewSpec::FieldIds(vec![22, 25]).kind(), ViewKind::FieldIdList);
        assert_eq!(
            ViewSpec::ElementNames(vec!["BID".into()]).kind(),
            ViewKind::ElementNameList
        );
    }

    #[test]
    fn test_view_action_spec() {
        let action = ViewAction::Set(ViewSpec::FieldIds(vec![1]));
        assert!(action.spec().is_some());
        assert!(ViewAction::Maintain.spec().is_none());
        assert_eq!(ViewAction::default(), ViewAction::None);
    }

    #[test]
    fn test_view_serialization() {
        let action = ViewAction::Set(ViewSpec::FieldIds(vec![22, 25]));
        let json = serde_json::to_string(&action).unwrap();
        let back: ViewAction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, action);
    }
}
