//! Shared types: crate error, result alias, reduction element types.

use thiserror::Error;

/// Errors raised while generating or mapping kernel code.
///
/// Contract violations (zero thread counts, out-of-range register indices,
/// late constant registration) are assertions, not variants here.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("assembler error: {0}")]
    Assembler(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("executable memory error: {0}")]
    Mmap(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("scratchpad error: {0}")]
    Scratchpad(String),
}

pub type JitResult<T> = Result<T, JitError>;

#[cfg(feature = "jit-x86")]
impl From<iced_x86::IcedError> for JitError {
    fn from(e: iced_x86::IcedError) -> Self {
        JitError::Assembler(e.to_string())
    }
}

/// Element type handled by the reduction driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    S32,
}

impl DataType {
    /// Size of one element in bytes.
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 4,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::F32 => write!(f, "f32"),
            DataType::S32 => write!(f, "s32"),
        }
    }
}

/// Rust element types the reducers accept.
pub trait ReduceElem: Copy + Send + Sync + Default + std::fmt::Debug + 'static {
    const DATA_TYPE: DataType;
}

impl ReduceElem for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl ReduceElem for i32 {
    const DATA_TYPE: DataType = DataType::S32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = JitError::Unsupported("round backward".into());
        assert_eq!(e.to_string(), "unsupported: round backward");
        let e = JitError::Assembler("bad operand".into());
        assert!(e.to_string().starts_with("assembler error"));
    }

    #[test]
    fn test_elem_types() {
        assert_eq!(<f32 as ReduceElem>::DATA_TYPE, DataType::F32);
        assert_eq!(<i32 as ReduceElem>::DATA_TYPE, DataType::S32);
        assert_eq!(DataType::S32.size_in_bytes(), 4);
    }
}
