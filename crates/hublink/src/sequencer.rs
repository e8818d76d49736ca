// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Host-wide event id sequencer.
//!
//! Hands out unique, monotonically increasing `u64` ids to *any*
//! process on the host. The counter lives in a POSIX shared memory
//! segment (`shm_open` + `mmap`) and every read-increment-write is
//! guarded by a POSIX named semaphore so the update is atomic across
//! processes, not just across threads.
//!
//! ```text
//! +-------------+     +----------------------+     +-------------+
//! |  Process A  |     |  /dev/shm segment    |     |  Process B  |
//! |  next_id()--+---->|  magic | counter     |<----+--next_id()  |
//! +-------------+     +----------------------+     +-------------+
//!                        guarded by named sem
//! ```
//!
//! # Lifecycle
//!
//! Whichever process calls [`EventIdSequencer::attach`] first creates
//! the segment and semaphore; later processes attach to the existing
//! ones. Creation is idempotent (first-writer-wins): both paths verify
//! the magic word under the semaphore and initialize the counter only
//! if it is missing.
//!
//! # Degradation
//!
//! When the segment or semaphore cannot be reached, [`next_event_id`]
//! returns `0`, which callers must treat as "id unavailable", never as
//! a valid id. Valid ids start at 1. The typed API surfaces the same
//! condition as `None`.
//!
//! Linux-only: relies on `sem_timedwait` so a crashed semaphore holder
//! degrades the sequencer instead of deadlocking the host.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::{SEQUENCER_SEM_NAME, SEQUENCER_SHM_NAME};

/// Magic word marking an initialized counter page.
const SEQ_MAGIC: u64 = 0x4855_424c_5345_5131; // "HUBLSEQ1"

/// Segment size: one page holds the magic word and the counter.
const SEQ_SEGMENT_SIZE: usize = 4096;

/// Bound on semaphore waits. A holder that died with the semaphore
/// taken degrades the sequencer rather than hanging every producer.
const SEM_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors raised while attaching the shared counter.
#[derive(Debug)]
pub enum SequencerError {
    /// `shm_open` failed while creating or opening the segment.
    SegmentOpen(io::Error),
    /// `ftruncate` failed while sizing a fresh segment.
    SegmentSize(io::Error),
    /// `mmap` failed.
    Mmap(io::Error),
    /// `sem_open` failed.
    Semaphore(io::Error),
    /// Name does not follow POSIX shared-object naming rules.
    InvalidName(String),
    /// Segment exists but never reached its expected size.
    SegmentNotReady,
}

impl std::fmt::Display for SequencerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SegmentOpen(e) => write!(f, "sequencer segment open failed: {e}"),
            Self::SegmentSize(e) => write!(f, "sequencer segment sizing failed: {e}"),
            Self::Mmap(e) => write!(f, "sequencer mmap failed: {e}"),
            Self::Semaphore(e) => write!(f, "sequencer semaphore open failed: {e}"),
            Self::InvalidName(name) => write!(f, "invalid shared object name: {name}"),
            Self::SegmentNotReady => write!(f, "sequencer segment not sized by creator"),
        }
    }
}

impl std::error::Error for SequencerError {}

/// Handle to the host-wide event id counter.
///
/// Cheap to keep around for the life of a process; each service
/// normally attaches once and reuses the handle (or just calls
/// [`next_event_id`]).
pub struct EventIdSequencer {
    ptr: *mut u8,
    sem: *mut libc::sem_t,
    shm_name: String,
    sem_name: String,
}

// SAFETY: the mapped page is only ever mutated through AtomicU64
// accesses while the named semaphore is held; the semaphore pointer is
// used only via sem_* calls which are thread-safe per POSIX.
unsafe impl Send for EventIdSequencer {}
unsafe impl Sync for EventIdSequencer {}

impl EventIdSequencer {
    /// Attach to the well-known host counter, creating it if absent.
    pub fn attach() -> Result<Self, SequencerError> {
        Self::attach_named(SEQUENCER_SHM_NAME, SEQUENCER_SEM_NAME)
    }

    /// Attach to a counter with explicit object names (test rigs).
    pub fn attach_named(shm_name: &str, sem_name: &str) -> Result<Self, SequencerError> {
        validate_name(shm_name)?;
        validate_name(sem_name)?;

        let c_shm =
            CString::new(shm_name).map_err(|_| SequencerError::InvalidName(shm_name.into()))?;
        let c_sem =
            CString::new(sem_name).map_err(|_| SequencerError::InvalidName(sem_name.into()))?;

        // Try to create first; EEXIST means another process won the
        // race and we attach to its segment instead.
        // SAFETY: c_shm is a valid NUL-terminated string; shm_open
        // returns an owned fd or -1 (checked below).
        let mut created = true;
        let mut fd = unsafe {
            libc::shm_open(
                c_shm.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(SequencerError::SegmentOpen(err));
            }
            created = false;
            // SAFETY: same as above, minus the create flags.
            fd = unsafe { libc::shm_open(c_shm.as_ptr(), libc::O_RDWR, 0) };
            if fd < 0 {
                return Err(SequencerError::SegmentOpen(io::Error::last_os_error()));
            }
        }

        if created {
            // SAFETY: fd is a valid descriptor from shm_open above.
            let ret = unsafe { libc::ftruncate(fd, SEQ_SEGMENT_SIZE as libc::off_t) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // SAFETY: fd is valid and not used after this point.
                unsafe { libc::close(fd) };
                // SAFETY: c_shm is a valid NUL-terminated string.
                unsafe { libc::shm_unlink(c_shm.as_ptr()) };
                return Err(SequencerError::SegmentSize(err));
            }
        } else if let Err(e) = wait_for_segment_size(fd) {
            // SAFETY: fd is valid and not used after this point.
            unsafe { libc::close(fd) };
            return Err(e);
        }

        // SAFETY: fd is valid and sized to SEQ_SEGMENT_SIZE; MAP_SHARED
        // with PROT_READ|PROT_WRITE is the standard cross-process
        // mapping. mmap returns MAP_FAILED on error (checked below).
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                SEQ_SEGMENT_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: the mapping (if any) keeps its own reference; fd is
        // not used past this point.
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(SequencerError::Mmap(io::Error::last_os_error()));
        }

        // sem_open with O_CREAT is idempotent: the initial value 1 only
        // applies when this call actually creates the semaphore.
        // SAFETY: c_sem is a valid NUL-terminated string; the extra
        // variadic args match the O_CREAT signature of sem_open.
        let sem = unsafe {
            libc::sem_open(
                c_sem.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            // SAFETY: ptr is a valid mapping of SEQ_SEGMENT_SIZE bytes.
            unsafe { libc::munmap(ptr, SEQ_SEGMENT_SIZE) };
            return Err(SequencerError::Semaphore(err));
        }

        let seq = Self {
            ptr: ptr.cast::<u8>(),
            sem,
            shm_name: shm_name.to_string(),
            sem_name: sem_name.to_string(),
        };

        // First-writer-wins initialization: whoever gets the semaphore
        // first writes the magic word; everyone else sees it and leaves
        // the counter alone.
        if seq.lock() {
            if seq.magic().load(Ordering::Relaxed) != SEQ_MAGIC {
                seq.counter().store(0, Ordering::Relaxed);
                seq.magic().store(SEQ_MAGIC, Ordering::Relaxed);
                log::debug!("[SEQ] Initialized counter segment {}", seq.shm_name);
            }
            seq.unlock();
        }

        Ok(seq)
    }

    /// Next host-wide unique id, or `None` when the counter is
    /// unavailable (semaphore timeout or uninitialized segment).
    pub fn next_id(&self) -> Option<u64> {
        if !self.lock() {
            log::warn!("[SEQ] Semaphore wait timed out; id unavailable");
            return None;
        }
        let id = if self.magic().load(Ordering::Relaxed) == SEQ_MAGIC {
            let next = self.counter().load(Ordering::Relaxed) + 1;
            self.counter().store(next, Ordering::Relaxed);
            Some(next)
        } else {
            None
        };
        self.unlock();
        id
    }

    /// Peek at the most recently issued id without consuming one.
    pub fn current(&self) -> Option<u64> {
        if !self.lock() {
            return None;
        }
        let id = if self.magic().load(Ordering::Relaxed) == SEQ_MAGIC {
            Some(self.counter().load(Ordering::Relaxed))
        } else {
            None
        };
        self.unlock();
        id
    }

    /// Remove the named segment and semaphore from the host. Meant for
    /// test cleanup; live processes keep their mappings until drop.
    pub fn unlink(shm_name: &str, sem_name: &str) {
        if let Ok(c_shm) = CString::new(shm_name) {
            // SAFETY: valid NUL-terminated string; ENOENT is fine.
            unsafe { libc::shm_unlink(c_shm.as_ptr()) };
        }
        if let Ok(c_sem) = CString::new(sem_name) {
            // SAFETY: valid NUL-terminated string; ENOENT is fine.
            unsafe { libc::sem_unlink(c_sem.as_ptr()) };
        }
    }

    fn magic(&self) -> &AtomicU64 {
        // SAFETY: ptr is a live page-aligned mapping of at least 16
        // bytes; offset 0 is u64-aligned.
        unsafe { &*self.ptr.cast::<AtomicU64>() }
    }

    fn counter(&self) -> &AtomicU64 {
        // SAFETY: as above; offset 8 stays within the mapping and keeps
        // u64 alignment.
        unsafe { &*self.ptr.add(8).cast::<AtomicU64>() }
    }

    /// Acquire the cross-process lock with a bounded wait.
    fn lock(&self) -> bool {
        let deadline = sem_deadline(SEM_WAIT_TIMEOUT);
        loop {
            // SAFETY: self.sem is a valid semaphore from sem_open;
            // deadline is a valid timespec on the stack.
            let ret = unsafe { libc::sem_timedwait(self.sem, &deadline) };
            if ret == 0 {
                return true;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => {}
                _ => return false,
            }
        }
    }

    fn unlock(&self) {
        // SAFETY: self.sem is a valid semaphore this handle owns a
        // reference to; post after a successful wait is always legal.
        unsafe { libc::sem_post(self.sem) };
    }
}

impl Drop for EventIdSequencer {
    fn drop(&mut self) {
        // SAFETY: ptr/sem come from successful mmap/sem_open in attach
        // and Drop runs at most once. Names are not unlinked here; the
        // segment outlives any single process on purpose.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), SEQ_SEGMENT_SIZE);
            libc::sem_close(self.sem);
        }
        log::debug!("[SEQ] Detached {} / {}", self.shm_name, self.sem_name);
    }
}

/// POSIX shared-object names: leading `/`, no other `/`, bounded length.
fn validate_name(name: &str) -> Result<(), SequencerError> {
    if !name.starts_with('/') || name[1..].contains('/') || name.len() > 250 || name.len() < 2 {
        return Err(SequencerError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// An attacher can observe the segment between the creator's shm_open
/// and ftruncate. Wait briefly for it to reach full size; mapping a
/// zero-length segment would fault on first access.
fn wait_for_segment_size(fd: libc::c_int) -> Result<(), SequencerError> {
    for _ in 0..50 {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is a valid descriptor and stat is a zeroed
        // out-param of the correct type.
        let ret = unsafe { libc::fstat(fd, &mut stat) };
        if ret < 0 {
            return Err(SequencerError::SegmentOpen(io::Error::last_os_error()));
        }
        if stat.st_size as usize >= SEQ_SEGMENT_SIZE {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Err(SequencerError::SegmentNotReady)
}

/// Absolute CLOCK_REALTIME deadline for `sem_timedwait`.
fn sem_deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: now is a valid out-param for clock_gettime.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + libc::c_long::from(timeout.subsec_nanos());
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

static GLOBAL_SEQUENCER: OnceLock<Option<EventIdSequencer>> = OnceLock::new();

/// Next host-wide unique event id, `0` when unavailable.
///
/// Compatibility shim over the typed API: the managed-language peer
/// treats `0` as the "id unavailable" sentinel, and the event codec
/// reserves it for "not yet assigned".
pub fn next_event_id() -> u64 {
    let seq = GLOBAL_SEQUENCER.get_or_init(|| match EventIdSequencer::attach() {
        Ok(seq) => Some(seq),
        Err(e) => {
            log::warn!("[SEQ] Sequencer unavailable, event ids degrade to 0: {}", e);
            None
        }
    });
    seq.as_ref()
        .and_then(EventIdSequencer::next_id)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn unique_names() -> (String, String) {
        let tag = fastrand::u64(..);
        (
            format!("/hublink_test_seq_{tag:x}"),
            format!("/hublink_test_sem_{tag:x}"),
        )
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("/ok_name").is_ok());
        assert!(validate_name("no_slash").is_err());
        assert!(validate_name("/nested/name").is_err());
        assert!(validate_name("/").is_err());
    }

    #[test]
    fn test_ids_are_strictly_increasing() {
        let (shm, sem) = unique_names();
        let seq = EventIdSequencer::attach_named(&shm, &sem).expect("attach");

        let mut last = 0;
        for _ in 0..100 {
            let id = seq.next_id().expect("id");
            assert!(id > last, "id {id} not greater than {last}");
            last = id;
        }

        drop(seq);
        EventIdSequencer::unlink(&shm, &sem);
    }

    #[test]
    fn test_first_id_is_one() {
        let (shm, sem) = unique_names();
        let seq = EventIdSequencer::attach_named(&shm, &sem).expect("attach");
        assert_eq!(seq.next_id(), Some(1));
        drop(seq);
        EventIdSequencer::unlink(&shm, &sem);
    }

    #[test]
    fn test_attach_is_idempotent() {
        let (shm, sem) = unique_names();
        let seq1 = EventIdSequencer::attach_named(&shm, &sem).expect("attach 1");
        assert_eq!(seq1.next_id(), Some(1));

        // Second attach must see the existing counter, not reset it.
        let seq2 = EventIdSequencer::attach_named(&shm, &sem).expect("attach 2");
        assert_eq!(seq2.next_id(), Some(2));
        assert_eq!(seq1.next_id(), Some(3));

        drop(seq1);
        drop(seq2);
        EventIdSequencer::unlink(&shm, &sem);
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let (shm, sem) = unique_names();
        let seq = Arc::new(EventIdSequencer::attach_named(&shm, &sem).expect("attach"));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let seq = Arc::clone(&seq);
            handles.push(std::thread::spawn(move || {
                (0..250)
                    .map(|_| seq.next_id().expect("id"))
                    .collect::<Vec<u64>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("join") {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 1000);
        assert_eq!(seq.current(), Some(1000));

        drop(seq);
        EventIdSequencer::unlink(&shm, &sem);
    }

    #[test]
    fn test_current_peeks_without_consuming() {
        let (shm, sem) = unique_names();
        let seq = EventIdSequencer::attach_named(&shm, &sem).expect("attach");
        assert_eq!(seq.current(), Some(0));
        seq.next_id();
        assert_eq!(seq.current(), Some(1));
        assert_eq!(seq.current(), Some(1));
        drop(seq);
        EventIdSequencer::unlink(&shm, &sem);
    }

    #[test]
    fn test_global_shim_never_panics() {
        // Whatever the host allows, this must return without panicking;
        // 0 is the documented degrade value.
        let _ = next_event_id();
    }
}
