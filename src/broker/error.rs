//! Broker Error Types

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Topology provisioning failed: {reason}")]
    TopologyFailed { reason: String },

    #[error("Publish to exchange '{exchange}' failed: {reason}")]
    PublishFailed { exchange: String, reason: String },

    #[error("Consume on queue '{queue}' failed: {reason}")]
    ConsumeFailed { queue: String, reason: String },

    #[error("Operation failed: {message}")]
    OperationFailed { message: String },
}
