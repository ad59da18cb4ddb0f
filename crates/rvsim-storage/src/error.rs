use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("unaligned buffer length {len} (expected multiple of {alignment})")]
    UnalignedLength { len: usize, alignment: usize },

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("image is read-only")]
    ReadOnly,

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DiskError {
    fn from(err: std::io::Error) -> Self {
        DiskError::Io(err.to_string())
    }
}
