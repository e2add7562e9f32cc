use thiserror::Error;

/// Why a header was not accepted into the chain.
#[derive(Error, Debug)]
pub enum HeaderError {
    /// The header's previous-hash does not match the stored predecessor.
    #[error("header does not link to the stored chain")]
    Unlinked,

    /// The header's own hash does not meet its declared target.
    #[error("header hash does not satisfy its proof-of-work target")]
    BadProofOfWork,

    /// The declared target is malformed or easier than the network allows.
    #[error("header declares an invalid difficulty target")]
    BadDifficulty,

    /// A height-zero header that is not the network's genesis block.
    #[error("first header is not the genesis block")]
    WrongGenesis,

    /// The headers file could not be read or written.
    #[error("headers file io error: {0}")]
    Io(#[from] std::io::Error),
}
