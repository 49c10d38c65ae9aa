#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Client name {0} is already in use on the server")]
    AlreadyInUse(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Session is closed")]
    SessionClosed,
}
