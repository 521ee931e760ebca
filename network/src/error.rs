use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("tap error: {0}")]
    Tap(String),

    #[error("interface {0:?} not found")]
    InterfaceNotFound(String),

    #[error("interface {0:?} has no IPv4 address")]
    NoAddress(String),

    #[error("interface {0:?} has no route with a gateway")]
    NoGateway(String),

    #[error("no active or valid interfaces available")]
    NoUsableInterfaces,

    #[error("invalid route table entry: {0}")]
    InvalidRoute(String),

    #[error("failed to read DNS configuration from {path}: {source}")]
    Resolver {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dhcp server on {bridge}: {reason}")]
    Dhcp { bridge: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}
