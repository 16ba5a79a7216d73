use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Sequence counter guarding a multi-word record with one writer.
///
/// Odd values mean a write is in flight. Readers that observe an odd value,
/// or a different value after reading, re-poll.
#[repr(transparent)]
pub struct SeqCounter(AtomicU64);

impl SeqCounter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn write<T>(&self, body: impl FnOnce() -> T) -> T {
        let seq = self.0.load(Ordering::Relaxed);
        self.0.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        let out = body();
        self.0.store(seq.wrapping_add(2), Ordering::Release);
        out
    }

    pub fn read<T>(&self, attempts: u32, mut body: impl FnMut() -> T) -> Option<T> {
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                std::thread::yield_now();
            }
            let before = self.0.load(Ordering::Acquire);
            if before & 1 == 1 {
                continue;
            }
            let value = body();
            fence(Ordering::Acquire);
            if self.0.load(Ordering::Relaxed) == before {
                return Some(value);
            }
        }
        None
    }
}

impl Default for SeqCounter {
    fn default() -> Self {
        Self::new()
    }
}
