//! Error kinds for the decision engine. The facade never propagates these
//! out of `message_received` / `received_blocks`; they surface only via
//! `tracing` logs and the `EngineEvent::Error` telemetry stream.

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine has not been started")]
    NotStarted,

    #[error("block store error: {0}")]
    BlockStoreError(#[source] Arc<dyn std::error::Error + Send + Sync>),

    #[error("network send error: {0}")]
    NetworkSendError(#[source] Arc<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
    pub fn block_store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        EngineError::BlockStoreError(Arc::new(err))
    }

    pub fn network_send(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        EngineError::NetworkSendError(Arc::new(err))
    }
}
