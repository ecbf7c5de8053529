//! Error types for the launchers and requests

use core::fmt;

/// Result type for launcher operations
pub type LaunchResult<T> = Result<T, LaunchError>;

/// Errors that can occur while building requests or running launchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// Serialized request does not fit the worker's request buffer
    RequestTooLarge { size: usize, capacity: usize },

    /// Write-set names the same key twice
    DuplicateKey(u64),

    /// Write-set names a key the record store does not hold
    UnknownKey(u64),

    /// Request targets a store other than the one the pool was built over
    ForeignDatabase,

    /// Request targets a store that forked workers cannot see
    NotProcessShared,

    /// Launcher has been shut down
    ShutDown,

    /// Configuration rejected by validation
    InvalidConfig(&'static str),

    /// Request buffer failed validation while decoding
    CorruptRequest(&'static str),

    /// Shared memory mapping failed
    MemoryError(MemoryError),

    /// Process-shared synchronization primitive failed
    SyncError(SyncError),

    /// Worker thread or process error
    WorkerError(WorkerError),
}

/// Failure classes
///
/// `Capacity` and `Usage` are caller mistakes and recoverable: nothing was
/// handed to a worker. `Resource` means the pool could not be built or torn
/// down cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Capacity,
    Usage,
    Resource,
}

impl LaunchError {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            LaunchError::RequestTooLarge { .. } => ErrorClass::Capacity,
            LaunchError::DuplicateKey(_)
            | LaunchError::UnknownKey(_)
            | LaunchError::ForeignDatabase
            | LaunchError::NotProcessShared
            | LaunchError::ShutDown
            | LaunchError::InvalidConfig(_)
            | LaunchError::CorruptRequest(_) => ErrorClass::Usage,
            LaunchError::MemoryError(_)
            | LaunchError::SyncError(_)
            | LaunchError::WorkerError(_) => ErrorClass::Resource,
        }
    }

    /// Whether the launcher that produced this error can keep dispatching
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        self.class() != ErrorClass::Resource
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchError::RequestTooLarge { size, capacity } => {
                write!(f, "request of {} bytes exceeds {} byte buffer", size, capacity)
            }
            LaunchError::DuplicateKey(key) => write!(f, "duplicate key {} in write-set", key),
            LaunchError::UnknownKey(key) => write!(f, "unknown record key {}", key),
            LaunchError::ForeignDatabase => write!(f, "request targets a different record store"),
            LaunchError::NotProcessShared => write!(f, "record store is not process-shared"),
            LaunchError::ShutDown => write!(f, "launcher shut down"),
            LaunchError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            LaunchError::CorruptRequest(msg) => write!(f, "corrupt request buffer: {}", msg),
            LaunchError::MemoryError(e) => write!(f, "memory error: {}", e),
            LaunchError::SyncError(e) => write!(f, "sync error: {}", e),
            LaunchError::WorkerError(e) => write!(f, "worker error: {}", e),
        }
    }
}

impl std::error::Error for LaunchError {}

/// Shared memory errors (errno attached)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    MapFailed(i32),

    /// munmap failed
    UnmapFailed(i32),

    /// Requested region size is zero or overflows
    InvalidSize,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::MapFailed(e) => write!(f, "mmap failed: errno {}", e),
            MemoryError::UnmapFailed(e) => write!(f, "munmap failed: errno {}", e),
            MemoryError::InvalidSize => write!(f, "invalid region size"),
        }
    }
}

impl From<MemoryError> for LaunchError {
    fn from(e: MemoryError) -> Self {
        LaunchError::MemoryError(e)
    }
}

/// Process-shared mutex/condvar errors (pthread return code attached)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// pthread_*attr_* call failed
    AttrFailed(i32),

    /// pthread_mutex_init failed
    MutexInitFailed(i32),

    /// pthread_cond_init failed
    CondInitFailed(i32),

    /// pthread_*_destroy failed
    DestroyFailed(i32),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::AttrFailed(e) => write!(f, "attribute setup failed: {}", e),
            SyncError::MutexInitFailed(e) => write!(f, "mutex init failed: {}", e),
            SyncError::CondInitFailed(e) => write!(f, "condvar init failed: {}", e),
            SyncError::DestroyFailed(e) => write!(f, "destroy failed: {}", e),
        }
    }
}

impl From<SyncError> for LaunchError {
    fn from(e: SyncError) -> Self {
        LaunchError::SyncError(e)
    }
}

/// Worker thread/process errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed,

    /// fork failed (errno attached)
    ForkFailed(i32),

    /// Worker thread panicked
    Panicked,

    /// Worker process exited before it was told to stop
    Crashed { pid: i32 },

    /// waitpid failed (errno attached)
    ReapFailed(i32),

    /// Worker process reported requests it could not decode
    Faulted(u32),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::ForkFailed(e) => write!(f, "fork failed: errno {}", e),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
            WorkerError::Crashed { pid } => write!(f, "worker process {} exited unexpectedly", pid),
            WorkerError::ReapFailed(e) => write!(f, "waitpid failed: errno {}", e),
            WorkerError::Faulted(n) => write!(f, "worker rejected {} request buffer(s)", n),
        }
    }
}

impl From<WorkerError> for LaunchError {
    fn from(e: WorkerError) -> Self {
        LaunchError::WorkerError(e)
    }
}
