//! Handler policy for the greeting service

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the bidirectional handler transmits its header metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderMode {
    /// Attach the header to the first outgoing message.
    #[default]
    Deferred,
    /// Flush the header before reading any request.
    Immediate,
}

/// Pacing and limits for [`Greeter`](crate::Greeter)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GreeterSettings {
    /// Number of responses sent by `HelloServerStream`
    pub stream_count: usize,
    /// Pause between server-stream responses
    #[serde(with = "duration_ms")]
    pub stream_interval: Duration,
    /// Simulated work per bidirectional request
    #[serde(with = "duration_ms")]
    pub bidi_delay: Duration,
    /// Header transmission mode for `HelloBiStreams`
    pub bidi_header: HeaderMode,
    /// Cap on messages buffered by `HelloClientStream`; `None` is unbounded
    pub max_client_stream_messages: Option<usize>,
}

impl Default for GreeterSettings {
    fn default() -> Self {
        Self {
            stream_count: 5,
            stream_interval: Duration::from_secs(1),
            bidi_delay: Duration::from_secs(3),
            bidi_header: HeaderMode::Deferred,
            max_client_stream_messages: Some(10_000),
        }
    }
}

impl GreeterSettings {
    /// Settings with no pacing delays, for tests and local demos.
    pub fn immediate() -> Self {
        Self {
            stream_interval: Duration::ZERO,
            bidi_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Durations as whole milliseconds; anything past `u64::MAX` ms saturates.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
