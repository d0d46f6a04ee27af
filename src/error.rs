use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy of the engine. `NoSpace` deliberately has no variant
/// here: it is an internal signal caught inside [`crate::physical::btree`]
/// and turned into a page split before it can escape a public call.
#[derive(Debug, Error)]
pub enum Error {
    #[error("page size {0} is not a power of two in [512, 65536]")]
    InvalidPageSize(u32),

    #[error("record of {len} bytes exceeds the maximum representable size ({max} bytes) for this page geometry")]
    TooLong { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed page or record: {0}")]
    Malformed(String),

    #[error("key not found")]
    NotFound,

    #[error("column read requested a type incompatible with the stored value: {0}")]
    TypeMismatch(String),

    #[error("operation attempted on a closed handle")]
    Closed,
}
