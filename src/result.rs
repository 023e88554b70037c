use thiserror::Error;

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Failed to map memory: {0}")]
    FailedToMap(String),
    #[error("No allocator supports the requested heap kind, flags and state mode")]
    NoCompatibleAllocator,
    #[error("Invalid AllocationCreateDesc")]
    InvalidAllocationCreateDesc,
    #[error("Invalid AllocatorCreateDesc {0}")]
    InvalidAllocatorCreateDesc(String),
    #[error("Descriptor heap exhausted")]
    HeapExhausted,
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<V, E = AllocationError> = ::core::result::Result<V, E>;
