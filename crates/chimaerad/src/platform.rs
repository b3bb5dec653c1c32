//! OS-specific memory reservation and thread scheduling.
//!
//! Everything above this module is platform-agnostic: it asks a [`Platform`]
//! for a [`Region`] to build an arena on, and for elevated scheduling on
//! device worker threads.

use memmap2::MmapMut;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to reserve {bytes} bytes: {source}")]
    Reserve {
        bytes: usize,
        source: std::io::Error,
    },

    #[error("failed to set thread priority {priority}: os error {code}")]
    Priority { priority: i32, code: i32 },
}

/// A contiguous block of memory owned by an arena.
pub enum Region {
    Mapped(MmapMut),
    Heap(Box<[u8]>),
}

impl Region {
    /// Zeroed heap region. Available on every platform.
    pub fn heap(bytes: usize) -> Self {
        Region::Heap(vec![0u8; bytes].into_boxed_slice())
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Region::Mapped(map) => &map[..],
            Region::Heap(buf) => &buf[..],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Region::Mapped(map) => &mut map[..],
            Region::Heap(buf) => &mut buf[..],
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Region::Mapped(_) => "mapped",
            Region::Heap(_) => "heap",
        };
        f.debug_struct("Region")
            .field("kind", &kind)
            .field("len", &self.len())
            .finish()
    }
}

pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reserve `bytes` of zeroed memory, optionally pinned in RAM.
    fn reserve(&self, bytes: usize, lock: bool) -> Result<Region, PlatformError>;

    /// Raise the calling thread to round-robin scheduling at `priority`.
    fn promote_current_thread(&self, priority: i32) -> Result<(), PlatformError>;
}

/// The implementation for the target OS.
pub fn native() -> Arc<dyn Platform> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxPlatform)
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(MacPlatform)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Arc::new(PortablePlatform)
    }
}

fn map_anon(bytes: usize) -> Result<MmapMut, PlatformError> {
    MmapMut::map_anon(bytes).map_err(|source| PlatformError::Reserve { bytes, source })
}

#[cfg(unix)]
fn set_round_robin(priority: i32) -> Result<(), PlatformError> {
    // SAFETY: pthread_self is always valid for the calling thread and the
    // param struct outlives the call.
    let code = unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_RR);
        let param = libc::sched_param {
            sched_priority: priority.min(max),
        };
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param)
    };
    if code == 0 {
        Ok(())
    } else {
        Err(PlatformError::Priority { priority, code })
    }
}

/// Anonymous mappings pinned with mlock; SCHED_RR worker threads.
#[cfg(target_os = "linux")]
pub struct LinuxPlatform;

#[cfg(target_os = "linux")]
impl Platform for LinuxPlatform {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn reserve(&self, bytes: usize, lock: bool) -> Result<Region, PlatformError> {
        let map = map_anon(bytes)?;
        if lock {
            if let Err(e) = map.lock() {
                // RLIMIT_MEMLOCK is commonly low for non-audio users.
                warn!("mlock of {} bytes failed, continuing unpinned: {}", bytes, e);
            }
        }
        Ok(Region::Mapped(map))
    }

    fn promote_current_thread(&self, priority: i32) -> Result<(), PlatformError> {
        set_round_robin(priority)
    }
}

/// Anonymous mappings; pthread round-robin clamped to the system maximum.
#[cfg(target_os = "macos")]
pub struct MacPlatform;

#[cfg(target_os = "macos")]
impl Platform for MacPlatform {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn reserve(&self, bytes: usize, lock: bool) -> Result<Region, PlatformError> {
        let map = map_anon(bytes)?;
        if lock {
            if let Err(e) = map.lock() {
                debug!("mlock unavailable: {}", e);
            }
        }
        Ok(Region::Mapped(map))
    }

    fn promote_current_thread(&self, priority: i32) -> Result<(), PlatformError> {
        set_round_robin(priority)
    }
}

/// Plain heap memory and default scheduling.
pub struct PortablePlatform;

impl Platform for PortablePlatform {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn reserve(&self, bytes: usize, _lock: bool) -> Result<Region, PlatformError> {
        Ok(Region::heap(bytes))
    }

    fn promote_current_thread(&self, priority: i32) -> Result<(), PlatformError> {
        debug!("thread priority {} requested, not supported here", priority);
        Ok(())
    }
}
