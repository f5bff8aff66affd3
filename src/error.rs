use thiserror::Error;

use crate::transport::Reason;

pub type AgentResult<T> = Result<T, AgentError>;

/// Broad handling class of an [`AgentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad arguments; rejected before any transport call.
    Configuration,
    /// Subscription table full; retry after an unsubscribe.
    ResourceExhausted,
    /// A local precondition did not hold.
    Precondition,
    TransportRetry,
    TransportFatal,
    PayloadOverflow,
    /// Reading or writing persisted device settings failed.
    Storage,
}

#[derive(Debug, Error, PartialEq)]
pub enum AgentError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("topic name exceeds maximum possible size ({len} > {max} bytes)")]
    TopicTooLong { len: usize, max: usize },

    #[error("invalid port given '{0}', port can only be between 1 and 223")]
    InvalidPort(u16),

    #[error("already subscribed to '{0}'")]
    DuplicateTopic(String),

    #[error("command '{0}' is not available on the {1} transport")]
    Unsupported(&'static str, &'static str),

    #[error("no memory to store new subscriptions ({capacity} slots in use)")]
    TableFull { capacity: usize },

    #[error("no subscription for topic '{0}' found")]
    SubscriptionNotFound(String),

    #[error("sensor not initialized, please run the initSensor command")]
    NotSelected,

    #[error("WeatherStation {0} not found")]
    StationNotFound(String),

    #[error("sensor {0} not found")]
    SensorNotFound(String),

    #[error("payload exceeds {limit} bytes")]
    PayloadOverflow { limit: usize },

    #[error("storage: {0}")]
    Storage(String),

    #[error("{0} (retry later)")]
    Retry(Reason),

    #[error("{0}")]
    Fatal(Reason),
}

impl AgentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::InvalidArgument(_)
            | AgentError::TopicTooLong { .. }
            | AgentError::InvalidPort(_)
            | AgentError::DuplicateTopic(_)
            | AgentError::Unsupported(..) => ErrorClass::Configuration,
            AgentError::TableFull { .. } => ErrorClass::ResourceExhausted,
            AgentError::SubscriptionNotFound(_)
            | AgentError::NotSelected
            | AgentError::StationNotFound(_)
            | AgentError::SensorNotFound(_) => ErrorClass::Precondition,
            AgentError::PayloadOverflow { .. } => ErrorClass::PayloadOverflow,
            AgentError::Storage(_) => ErrorClass::Storage,
            AgentError::Retry(_) => ErrorClass::TransportRetry,
            AgentError::Fatal(_) => ErrorClass::TransportFatal,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        AgentError::InvalidArgument(msg.into())
    }
}
