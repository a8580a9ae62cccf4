use core::fmt;

/// Recoverable kernel failures, returned to the caller and surfaced to user space as a negative errno
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No free physical page
    OutOfMemory,
    /// Every process slot is in use
    NoFreeProcess,
    /// The mmap region pool is empty, or the mmap window is exhausted
    NoFreeRegion,
    /// A user address is unmapped or lacks the needed permission
    BadAddress,
    InvalidArgument,
    /// `wait` found no child to wait for
    NoChildren,
    NoSuchProcess,
    BadFileDescriptor,
    /// The caller was killed while blocked
    Killed,
    Io,
    Unsupported,
}

impl KernelError {
    /// The Linux errno for this failure, negated as returned in `a0`
    #[must_use]
    pub const fn errno(self) -> isize {
        -match self {
            Self::NoSuchProcess => 3,
            Self::Killed => 4,
            Self::Io => 5,
            Self::BadFileDescriptor => 9,
            Self::NoChildren => 10,
            Self::NoFreeProcess => 11,
            Self::OutOfMemory | Self::NoFreeRegion => 12,
            Self::BadAddress => 14,
            Self::InvalidArgument => 22,
            Self::Unsupported => 38,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::OutOfMemory => "out of physical memory",
            Self::NoFreeProcess => "no free process slot",
            Self::NoFreeRegion => "no free vm region",
            Self::BadAddress => "bad user address",
            Self::InvalidArgument => "invalid argument",
            Self::NoChildren => "no children",
            Self::NoSuchProcess => "no such process",
            Self::BadFileDescriptor => "bad file descriptor",
            Self::Killed => "killed",
            Self::Io => "i/o error",
            Self::Unsupported => "unsupported",
        };
        f.write_str(message)
    }
}

/// Failure to reach a leaf entry while walking a page table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableWalkError {
    PageTableUnallocated,
    UnableToAllocate,
}

impl From<PageTableWalkError> for KernelError {
    fn from(value: PageTableWalkError) -> Self {
        match value {
            PageTableWalkError::PageTableUnallocated => Self::BadAddress,
            PageTableWalkError::UnableToAllocate => Self::OutOfMemory,
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
