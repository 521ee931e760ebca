use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("invalid disk specification {0:?}: expected <id>:<file>")]
    InvalidDisk(String),

    #[error("invalid host volume specification {0:?}: expected <mount tag>:<host path>")]
    InvalidHostVolume(String),
}
