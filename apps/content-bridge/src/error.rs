use bridge_transport::ChannelError;
use thiserror::Error;

use crate::storage::StorageError;
use crate::ui::UiError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to connect to background: {0}")]
    Connect(#[from] ChannelError),
    #[error("supervisor already destroyed")]
    Destroyed,
    #[error("ui error: {0}")]
    Ui(#[from] UiError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
