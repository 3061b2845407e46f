//! Warm pool lifecycle state
//!
//! Pool membership lives entirely in VMI labels, so the state set has a
//! stable string form.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a pool VMI.
///
/// `Creating` VMIs are promoted to `Available` once running with a node,
/// `Available` VMIs are handed to pods as `Claimed`, and a claimed VMI
/// goes back to `Available` when its pod is deleted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum WarmPoolState {
    /// Created by the pool manager, not yet running with a node
    #[default]
    Creating,

    /// Ready to be claimed
    Available,

    /// Bound to a pod
    Claimed,
}

impl WarmPoolState {
    /// Label value for this state.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::Claimed => "claimed",
        }
    }
}

impl fmt::Display for WarmPoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Label value that is not a known pool state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown warm pool state: {0:?}")]
pub struct UnknownWarmPoolState(pub String);

impl FromStr for WarmPoolState {
    type Err = UnknownWarmPoolState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "available" => Ok(Self::Available),
            "claimed" => Ok(Self::Claimed),
            other => Err(UnknownWarmPoolState(other.to_string())),
        }
    }
}
