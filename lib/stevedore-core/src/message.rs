//! The log record that flows from a [`crate::pump::ContainerPump`]
//! through matching sinks to an adapter.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::container::ContainerInfo;

/// Which stream a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Stdout,
    Stderr,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Stdout => "stdout",
            Source::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Source::Stdout),
            "stderr" => Ok(Source::Stderr),
            _ => Err(()),
        }
    }
}

/// One line of container output, tagged and timestamped. Immutable
/// once constructed; consumed by zero or more sinks and never
/// persisted.
///
/// `container` is an `Arc` so that every subscriber sharing the same
/// pump tick can clone a `Message` without cloning the whole
/// container snapshot.
#[derive(Debug, Clone)]
pub struct Message {
    pub container: Arc<ContainerInfo>,
    pub source: Source,
    /// The line, with its trailing `\n` already stripped.
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(container: Arc<ContainerInfo>, source: Source, payload: String) -> Self {
        Message {
            container,
            source,
            payload,
            timestamp: Utc::now(),
        }
    }
}
