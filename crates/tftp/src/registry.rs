//! Filenames with a transfer in progress
//!
//! A name may be read by any number of GETs at once, or written by exactly
//! one PUT, never both.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ErrorKind;
use crate::negotiate::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Use {
    Reading(usize),
    Writing,
}

/// Shared table of busy filenames
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<String, Use>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Use>> {
        // The map stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `filename` for a transfer in `direction`
    ///
    /// Fails with `EACCESS` when the claim conflicts with a transfer in
    /// progress. The claim lasts until the returned guard is dropped.
    pub fn claim(&self, filename: &str, direction: Direction) -> Result<Claim, ErrorKind> {
        let mut map = self.lock();
        match (map.entry(filename.to_string()), direction) {
            (Entry::Vacant(slot), Direction::Get) => {
                slot.insert(Use::Reading(1));
            }
            (Entry::Vacant(slot), Direction::Put) => {
                slot.insert(Use::Writing);
            }
            (Entry::Occupied(mut slot), Direction::Get) if matches!(slot.get(), Use::Reading(_)) => {
                if let Use::Reading(n) = slot.get_mut() {
                    *n += 1;
                }
            }
            (Entry::Occupied(slot), _) => {
                tracing::debug!("{} is busy ({:?}), refusing {}", filename, slot.get(), direction.as_str());
                return Err(ErrorKind::Access);
            }
        }
        Ok(Claim {
            registry: self.clone(),
            filename: filename.to_string(),
        })
    }

    fn release(&self, filename: &str) {
        let mut map = self.lock();
        match map.get_mut(filename) {
            Some(Use::Reading(n)) if *n > 1 => *n -= 1,
            Some(_) => {
                map.remove(filename);
            }
            None => {}
        }
    }
}

/// A registry entry, released on drop
#[derive(Debug)]
pub struct Claim {
    registry: Registry,
    filename: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.registry.release(&self.filename);
    }
}
