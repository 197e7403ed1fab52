//! Single-process lock backend: a `HashMap` behind a `std::sync::Mutex`.
//!
//! This is both the backend used by a single-replica deployment and the
//! fallback a [`super::LockService`] degrades to when a distributed backend
//! can't be reached at startup. It's the only backend that actually tracks
//! a reader count rather than serializing readers behind the same slot as
//! writers, since doing so needs no network round trip.
//!
//! Writer-preference: a `pending_writers` counter per key, bumped while
//! [`super::LockService`] is retrying an exclusive acquisition. While it's
//! above zero, `try_acquire_shared` refuses new readers even if the key is
//! free, so a steady stream of readers can't starve a waiting writer. This
//! only covers the retrying `lock`/`rlock` path; a one-shot `try_lock`
//! doesn't register intent, since there's no retry loop to bound it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ServerResult;
use crate::lock::LockBackend;

#[derive(Debug, Clone, Copy)]
enum Holder {
    Shared(u32),
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    holder: Holder,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct InProcessBackend {
    slots: Mutex<HashMap<String, Slot>>,
    pending_writers: Mutex<HashMap<String, u32>>,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(slot: &Slot) -> bool {
        Instant::now() < slot.expires_at
    }

    fn has_pending_writer(&self, key: &str) -> bool {
        self.pending_writers
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|count| *count > 0)
    }
}

#[async_trait::async_trait]
impl LockBackend for InProcessBackend {
    async fn try_acquire_exclusive(&self, key: &str, ttl: Duration) -> ServerResult<bool> {
        let mut slots = self.slots.lock().unwrap();
        let occupied = slots.get(key).is_some_and(Self::live);
        if occupied {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot { holder: Holder::Exclusive, expires_at: Instant::now() + ttl },
        );
        Ok(true)
    }

    async fn release_exclusive(&self, key: &str) -> ServerResult<()> {
        let mut slots = self.slots.lock().unwrap();
        if matches!(slots.get(key), Some(s) if matches!(s.holder, Holder::Exclusive)) {
            slots.remove(key);
        }
        Ok(())
    }

    async fn try_acquire_shared(&self, key: &str, ttl: Duration) -> ServerResult<bool> {
        if self.has_pending_writer(key) {
            return Ok(false);
        }

        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(key) {
            Some(slot) if Self::live(slot) => match &mut slot.holder {
                Holder::Shared(count) => {
                    *count += 1;
                    slot.expires_at = slot.expires_at.max(Instant::now() + ttl);
                    Ok(true)
                }
                Holder::Exclusive => Ok(false),
            },
            _ => {
                slots.insert(
                    key.to_string(),
                    Slot { holder: Holder::Shared(1), expires_at: Instant::now() + ttl },
                );
                Ok(true)
            }
        }
    }

    async fn release_shared(&self, key: &str) -> ServerResult<()> {
        let mut slots = self.slots.lock().unwrap();
        let remove = match slots.get_mut(key) {
            Some(slot) => match &mut slot.holder {
                Holder::Shared(count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                Holder::Exclusive => false,
            },
            None => false,
        };
        if remove {
            slots.remove(key);
        }
        Ok(())
    }

    async fn mark_writer_pending(&self, key: &str) -> ServerResult<()> {
        *self.pending_writers.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn clear_writer_pending(&self, key: &str) -> ServerResult<()> {
        let mut pending = self.pending_writers.lock().unwrap();
        if let Some(count) = pending.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pending.remove(key);
            }
        }
        Ok(())
    }
}
