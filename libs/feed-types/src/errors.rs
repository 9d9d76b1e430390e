//! Error types for the message model
//!
//! Comprehensive error taxonomy using thiserror

use thiserror::Error;

use crate::domain::DomainType;
use crate::msg::RequestMsg;
use crate::view::ViewAction;

/// Message-level validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("View contains no elements")]
    EmptyView,

    #[error("Worst QoS is better than requested QoS")]
    InvalidQosRange,

    #[error("Worst QoS given without a requested QoS")]
    WorstQosWithoutQos,

    #[error("Message key has no name for domain {domain}")]
    MissingKeyName { domain: DomainType },

    #[error("Batch request may not carry a key name")]
    BatchWithKeyName,

    #[error("Batch request contains an empty item name")]
    EmptyBatchItem,
}

impl RequestMsg {
    /// Check the request is self-consistent before it reaches the watchlist.
    pub fn validate(&self) -> Result<(), ModelError> {
        if let ViewAction::Set(spec) = &self.view {
            if spec.is_empty() {
                return Err(ModelError::EmptyView);
            }
        }

        match (&self.qos, &self.worst_qos) {
            (None, Some(_)) => return Err(ModelError::WorstQosWithoutQos),
            (Some(best), Some(worst)) if worst.is_better(best) => {
                return Err(ModelError::InvalidQosRange)
            }
            _ => {}
        }

        if !self.batch.is_empty() {
            if self.key.name.is_some() {
                return Err(ModelError::BatchWithKeyName);
            }
            if self.batch.iter().any(|name| name.is_empty()) {
                return Err(ModelError::EmptyBatchItem);
            }
        } else if !self.domain.is_administrative() && self.key.name.is_none() {
            return Err(ModelError::MissingKeyName {
                domain: self.domain,
            });
        }

        Ok(())
    }
}
