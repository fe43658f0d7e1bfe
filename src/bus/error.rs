//! Error types for the in-process event bus

use std::fmt;

#[derive(Debug, Clone)]
pub enum BusError {
    PublishFailed {
        event_name: String,
        failed_subscribers: Vec<String>,
    },
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::PublishFailed {
                event_name,
                failed_subscribers,
            } => {
                write!(
                    f,
                    "Failed to deliver '{}' to {} subscribers: {:?}",
                    event_name,
                    failed_subscribers.len(),
                    failed_subscribers
                )
            }
        }
    }
}

impl std::error::Error for BusError {}
