use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use serde::Deserialize;
use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::mem::size_of;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::ptr::NonNull;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("shared region {name} does not exist")]
    NotFound { name: String },
    #[error("shared region {name} already exists")]
    AlreadyExists { name: String },
    #[error("shared region {name} holds {found} bytes, expected {expected}")]
    Undersized {
        name: String,
        found: u64,
        expected: usize,
    },
    #[error("invalid shared region name {0:?}")]
    InvalidName(String),
    #[error("only the owner may destroy shared region {name}")]
    NotOwner { name: String },
    #[error("{op} failed for shared region {name}: {source}")]
    Sys {
        op: &'static str,
        name: String,
        #[source]
        source: Errno,
    },
    #[error("io error on shared region {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("record in {name} kept changing over {attempts} reads")]
    Torn { name: String, attempts: u32 },
}

impl ChannelError {
    /// Errors a consumer should wait out while the owner is still starting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChannelError::NotFound { .. } | ChannelError::Undersized { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("gave up attaching {name} after {attempts} attempts: {last}")]
    Exhausted {
        name: String,
        attempts: u32,
        #[source]
        last: ChannelError,
    },
    #[error(transparent)]
    Fatal(#[from] ChannelError),
}

/// Marker for `#[repr(C)]` records that live in a shared region.
///
/// # Safety
///
/// Every field must be an atomic (or a struct/array of them) so that shared
/// references across processes are sound, and the all-zero bit pattern must be
/// a valid value because freshly truncated regions are zero-filled.
pub unsafe trait SharedRecord: Sync {
    const KIND: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owner,
    Attached,
}

/// A mapped POSIX shared-memory region holding one `R`.
pub struct Region<R: SharedRecord> {
    name: String,
    ptr: NonNull<R>,
    ownership: Ownership,
    _record: PhantomData<R>,
}

// SAFETY: `R: SharedRecord` is atomics-only, so the mapping may be shared and
// moved across threads like `&R`.
unsafe impl<R: SharedRecord> Send for Region<R> {}
unsafe impl<R: SharedRecord> Sync for Region<R> {}

impl<R: SharedRecord> Region<R> {
    pub fn create(name: &str) -> Result<Self, ChannelError> {
        validate_name(name)?;
        let fd = match shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        ) {
            Ok(fd) => fd,
            Err(Errno::EEXIST) => {
                return Err(ChannelError::AlreadyExists {
                    name: name.to_string(),
                })
            }
            Err(source) => return Err(sys("shm_open", name, source)),
        };
        let file = File::from(fd);
        if let Err(source) = file.set_len(size_of::<R>() as u64) {
            let _ = shm_unlink(name);
            return Err(ChannelError::Io {
                name: name.to_string(),
                source,
            });
        }
        let ptr = match map::<R>(&file, name) {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = shm_unlink(name);
                return Err(err);
            }
        };
        info!(region = name, kind = R::KIND, bytes = size_of::<R>(), "channel_created");
        Ok(Self {
            name: name.to_string(),
            ptr,
            ownership: Ownership::Owner,
            _record: PhantomData,
        })
    }

    /// Like `create`, but clears a leftover region of the same name first.
    pub fn create_fresh(name: &str) -> Result<Self, ChannelError> {
        match Self::create(name) {
            Err(ChannelError::AlreadyExists { .. }) => {
                warn!(region = name, "stale_channel_replaced");
                unlink_region(name)?;
                Self::create(name)
            }
            other => other,
        }
    }

    pub fn attach(name: &str) -> Result<Self, ChannelError> {
        validate_name(name)?;
        let fd = match shm_open(name, OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => {
                return Err(ChannelError::NotFound {
                    name: name.to_string(),
                })
            }
            Err(source) => return Err(sys("shm_open", name, source)),
        };
        let file = File::from(fd);
        let found = file
            .metadata()
            .map_err(|source| ChannelError::Io {
                name: name.to_string(),
                source,
            })?
            .len();
        // The creator opens before it sizes; an empty region is not ready yet.
        if found < size_of::<R>() as u64 {
            return Err(ChannelError::Undersized {
                name: name.to_string(),
                found,
                expected: size_of::<R>(),
            });
        }
        let ptr = map::<R>(&file, name)?;
        debug!(region = name, kind = R::KIND, "channel_attached");
        Ok(Self {
            name: name.to_string(),
            ptr,
            ownership: Ownership::Attached,
            _record: PhantomData,
        })
    }

    pub fn attach_with_retry(name: &str, policy: &AttachPolicy) -> Result<Self, AttachError> {
        policy.run(name, || Self::attach(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn record(&self) -> &R {
        // SAFETY: the mapping is at least `size_of::<R>()` bytes, page aligned,
        // zero-initialised or written through atomics only, and lives until drop.
        unsafe { self.ptr.as_ref() }
    }

    /// Unlinks the region name. The mapping itself goes away on drop.
    pub fn destroy(self) -> Result<(), ChannelError> {
        if self.ownership != Ownership::Owner {
            return Err(ChannelError::NotOwner {
                name: self.name.clone(),
            });
        }
        unlink_region(&self.name)?;
        info!(region = %self.name, kind = R::KIND, "channel_destroyed");
        Ok(())
    }
}

impl<R: SharedRecord> Deref for Region<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.record()
    }
}

impl<R: SharedRecord> Drop for Region<R> {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from a successful mmap of exactly this length and
        // no references into the mapping outlive `self`.
        if let Err(err) = unsafe { munmap(self.ptr.cast(), size_of::<R>()) } {
            warn!(region = %self.name, error = %err, "channel_unmap_failed");
        }
    }
}

/// Removes a region name. A second call for the same name reports `NotFound`.
pub fn unlink_region(name: &str) -> Result<(), ChannelError> {
    validate_name(name)?;
    match shm_unlink(name) {
        Ok(()) => Ok(()),
        Err(Errno::ENOENT) => Err(ChannelError::NotFound {
            name: name.to_string(),
        }),
        Err(source) => Err(sys("shm_unlink", name, source)),
    }
}

pub fn region_name(session: &str, kind: &str) -> String {
    format!("/{}-{}", sanitize_component(session), sanitize_component(kind))
}

pub fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn validate_name(name: &str) -> Result<(), ChannelError> {
    let valid = name.len() > 1
        && name.len() <= MAX_NAME_LEN
        && name.starts_with('/')
        && !name[1..].contains('/')
        && !name.contains('\0');
    if valid {
        Ok(())
    } else {
        Err(ChannelError::InvalidName(name.to_string()))
    }
}

fn map<R>(file: &File, name: &str) -> Result<NonNull<R>, ChannelError> {
    let len = NonZeroUsize::new(size_of::<R>())
        .ok_or_else(|| ChannelError::InvalidName(name.to_string()))?;
    // SAFETY: a fresh shared mapping of a descriptor we own; the kernel picks
    // the address so nothing else is aliased.
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )
    }
    .map_err(|source| sys("mmap", name, source))?;
    Ok(ptr.cast())
}

fn sys(op: &'static str, name: &str, source: Errno) -> ChannelError {
    ChannelError::Sys {
        op,
        name: name.to_string(),
        source,
    }
}

/// Bounded, doubling backoff for consumers racing their channel's creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for AttachPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttachConfig {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for AttachConfig {
    fn default() -> Self {
        let policy = AttachPolicy::default();
        Self {
            attempts: policy.attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
        }
    }
}

impl From<AttachConfig> for AttachPolicy {
    fn from(config: AttachConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
        }
    }
}

impl AttachPolicy {
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let next = current + current;
        if next > self.max_backoff {
            self.max_backoff
        } else {
            next
        }
    }

    pub fn run<T>(
        &self,
        name: &str,
        mut attempt: impl FnMut() -> Result<T, ChannelError>,
    ) -> Result<T, AttachError> {
        let attempts = self.attempts.max(1);
        let mut backoff = self.initial_backoff;
        let mut tried = 0;
        loop {
            tried += 1;
            match attempt() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && tried < attempts => {
                    debug!(region = name, attempt = tried, error = %err, "channel_attach_retry");
                    std::thread::sleep(backoff);
                    backoff = self.next_backoff(backoff);
                }
                Err(err) if err.is_retryable() => {
                    warn!(region = name, attempts = tried, error = %err, "channel_attach_exhausted");
                    return Err(AttachError::Exhausted {
                        name: name.to_string(),
                        attempts: tried,
                        last: err,
                    });
                }
                Err(err) => return Err(AttachError::Fatal(err)),
            }
        }
    }
}
