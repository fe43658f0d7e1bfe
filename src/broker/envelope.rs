//! Wire envelope codec
//!
//! Every message crossing the broker is a JSON envelope:
//!
//! ```json
//! {
//!   "eventType": "transaction.created",
//!   "payload": { "transactionId": "...", "grandTotal": 125000 },
//!   "metadata": {
//!     "correlationId": "uuid",
//!     "timestamp": "2025-01-15T08:00:00.000Z",
//!     "source": "backend",
//!     "version": "1.0"
//!   }
//! }
//! ```
//!
//! An envelope missing `eventType` or `payload` is malformed and must never
//! be retried; the consumer dead-letters it on first sight. Missing
//! `metadata` is tolerated (defaults are synthesized) so bare envelopes
//! from foreign producers still bridge.

use crate::broker::config::ENVELOPE_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Envelope is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Envelope is missing its event type")]
    MissingEventType,
}

/// Transport metadata stamped on every envelope
///
/// Missing fields are defaulted on decode; only `eventType`/`payload`
/// absence makes an envelope malformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvelopeMetadata {
    /// Unique per publish
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    /// Identity of the publishing service
    pub source: String,
    /// Envelope schema tag
    pub version: String,
}

impl EnvelopeMetadata {
    pub fn new(source: &str) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: source.to_string(),
            version: ENVELOPE_VERSION.to_string(),
        }
    }

    /// Like [`new`](Self::new) but reusing a caller-supplied correlation id
    pub fn with_correlation_id(source: &str, correlation_id: Option<String>) -> Self {
        let mut metadata = Self::new(source);
        if let Some(id) = correlation_id {
            metadata.correlation_id = id;
        }
        metadata
    }
}

impl Default for EnvelopeMetadata {
    fn default() -> Self {
        Self {
            correlation_id: String::new(),
            timestamp: Utc::now(),
            source: String::new(),
            version: ENVELOPE_VERSION.to_string(),
        }
    }
}

/// The wire-level unit of transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Routing key / event name
    pub event_type: String,
    /// Event fields; required on the wire even when empty
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub metadata: EnvelopeMetadata,
}

impl Envelope {
    pub fn new(
        event_type: impl Into<String>,
        payload: Map<String, Value>,
        metadata: EnvelopeMetadata,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata,
        }
    }

    /// Serialize to the JSON wire format
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate a raw message body
    ///
    /// Fails for bodies that are not JSON, lack `payload`, or carry an
    /// absent/empty `eventType`. Callers treat any failure as malformed.
    pub fn decode(body: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_slice(body)?;
        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if self.event_type.trim().is_empty() {
            return Err(EnvelopeError::MissingEventType);
        }
        Ok(())
    }
}
