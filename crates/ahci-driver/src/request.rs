//! I/O requests and their completion handles.

use std::sync::{Arc, Condvar, Mutex};

use bitflags::bitflags;

use crate::error::AhciError;

bitflags! {
    /// Per-request behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoFlags: u32 {
        /// The write must reach stable media before completing; the driver
        /// issues a cache flush after the final data transfer.
        const WRITE_SYNCHRONIZED = 1 << 0;
    }
}

/// What a request asks the device to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    /// Standalone cache flush with no data payload.
    Synchronize,
}

/// One physically contiguous piece of a request's data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgFragment {
    pub phys: u64,
    pub len: usize,
}

/// A block I/O request handed to a port.
///
/// Owned by exactly one place at a time: the caller, the port's wait queue,
/// or the command slot executing it. Progress counters are advanced by the
/// retirement path as each chunk of a large transfer finishes.
pub struct IoRequest {
    pub(crate) kind: RequestKind,
    /// Starting device byte offset. Must be sector aligned.
    pub(crate) offset: u64,
    /// Total transfer length in bytes. Must be a sector multiple.
    pub(crate) length: usize,
    /// Scatter list describing the data buffer.
    pub(crate) fragments: Vec<SgFragment>,
    /// Bytes of the first fragment(s) to skip before the transfer begins.
    pub(crate) buffer_offset: usize,
    pub(crate) flags: IoFlags,
    /// Bytes successfully transferred so far.
    pub(crate) bytes_completed: usize,
    /// Device byte offset the next chunk starts at.
    pub(crate) new_offset: u64,
    completion: Arc<CompletionState>,
}

impl IoRequest {
    fn new(
        kind: RequestKind,
        offset: u64,
        length: usize,
        fragments: Vec<SgFragment>,
        buffer_offset: usize,
        flags: IoFlags,
    ) -> (Self, CompletionHandle) {
        let completion = Arc::new(CompletionState::default());
        let handle = CompletionHandle(completion.clone());
        let request = Self {
            kind,
            offset,
            length,
            fragments,
            buffer_offset,
            flags,
            bytes_completed: 0,
            new_offset: offset,
            completion,
        };
        (request, handle)
    }

    pub fn read(offset: u64, length: usize, fragments: Vec<SgFragment>) -> (Self, CompletionHandle) {
        Self::new(RequestKind::Read, offset, length, fragments, 0, IoFlags::empty())
    }

    pub fn write(
        offset: u64,
        length: usize,
        fragments: Vec<SgFragment>,
        flags: IoFlags,
    ) -> (Self, CompletionHandle) {
        Self::new(RequestKind::Write, offset, length, fragments, 0, flags)
    }

    /// A read or write whose buffer starts partway into the scatter list.
    pub fn with_buffer_offset(
        kind: RequestKind,
        offset: u64,
        length: usize,
        fragments: Vec<SgFragment>,
        buffer_offset: usize,
        flags: IoFlags,
    ) -> (Self, CompletionHandle) {
        Self::new(kind, offset, length, fragments, buffer_offset, flags)
    }

    pub fn synchronize() -> (Self, CompletionHandle) {
        Self::new(RequestKind::Synchronize, 0, 0, Vec::new(), 0, IoFlags::empty())
    }

    pub(crate) fn is_io(&self) -> bool {
        matches!(self.kind, RequestKind::Read | RequestKind::Write)
    }

    pub(crate) fn is_write(&self) -> bool {
        self.kind == RequestKind::Write
    }

    /// Bytes of payload not yet transferred.
    pub(crate) fn bytes_remaining(&self) -> usize {
        self.length - self.bytes_completed
    }

    /// Signals the completion handle. Consumes the request; each request
    /// completes exactly once.
    pub(crate) fn complete(self, result: Result<(), AhciError>) {
        let bytes = self.bytes_completed;
        self.completion.signal(result, bytes);
    }
}

#[derive(Default)]
struct CompletionState {
    slot: Mutex<Option<(Result<(), AhciError>, usize)>>,
    cond: Condvar,
}

impl CompletionState {
    fn signal(&self, result: Result<(), AhciError>, bytes: usize) {
        let mut slot = self.slot.lock().unwrap();
        debug_assert!(slot.is_none());
        *slot = Some((result, bytes));
        self.cond.notify_all();
    }
}

/// Caller-side handle observing a request's completion.
///
/// Signalled exactly once with the final status and the number of bytes
/// actually transferred.
pub struct CompletionHandle(Arc<CompletionState>);

impl CompletionHandle {
    /// Blocks until the request completes.
    pub fn wait(&self) -> (Result<(), AhciError>, usize) {
        let mut slot = self.0.slot.lock().unwrap();
        while slot.is_none() {
            slot = self.0.cond.wait(slot).unwrap();
        }
        slot.unwrap()
    }

    /// Non-blocking status query.
    pub fn status(&self) -> Option<(Result<(), AhciError>, usize)> {
        *self.0.slot.lock().unwrap()
    }

    pub fn is_complete(&self) -> bool {
        self.status().is_some()
    }
}
