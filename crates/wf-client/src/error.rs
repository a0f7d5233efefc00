use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("control channel has not been initialised")]
    NotInitialized,
    #[error("invalid daemon endpoint `{endpoint}`: {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("no running daemon is registered")]
    NoDaemon,
    #[error("daemon did not answer: {0}")]
    Unreachable(#[from] tonic::Status),
}
