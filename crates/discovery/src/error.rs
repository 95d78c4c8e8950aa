use thiserror::Error;

/// Failures of a single discovery strategy. They are logged and that strategy
/// is skipped; the others keep running.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("could not bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("no port of {0:?} could be bound")]
    NoPorts(Vec<u16>),
    #[error("could not join multicast group: {0}")]
    Multicast(std::io::Error),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
