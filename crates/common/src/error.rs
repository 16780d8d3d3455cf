#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid network magic")]
    InvalidNetwork,
    #[error("invalid script type")]
    InvalidScriptType,
}
