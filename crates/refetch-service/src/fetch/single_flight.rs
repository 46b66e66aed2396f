//! The in-flight resolver table.
//!
//! Exactly one underlying resolution runs per key at a time; concurrent
//! callers attach to the running one. Each entry counts its attached
//! callers and is removed once the count returns to zero, so a later call
//! starts a fresh resolution. The mutex is only held across table
//! bookkeeping, never across an await.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

struct Entry<T: Clone> {
    future: Shared<BoxFuture<'static, T>>,
    attached: usize,
}

/// A keyed table of shared, reference-counted resolutions.
pub(crate) struct SingleFlight<T: Clone> {
    entries: Mutex<HashMap<String, Entry<T>>>,
}

/// Decrements the attached-caller count for one key when dropped.
///
/// Dropping is the one exit path shared by completion and cancellation,
/// so a caller that is cancelled mid-await still detaches.
struct DetachOnDrop<'a, T: Clone> {
    table: &'a SingleFlight<T>,
    key: &'a str,
}

impl<T: Clone> Drop for DetachOnDrop<'_, T> {
    fn drop(&mut self) {
        let mut entries = self.table.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(self.key) {
            entry.attached -= 1;
            if entry.attached == 0 {
                entries.remove(self.key);
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches to the resolution in flight for `key`, or starts the one
    /// built by `start` if there is none.
    pub async fn run<F>(&self, key: &str, start: F) -> T
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        let shared = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(key) {
                Some(entry) => {
                    entry.attached += 1;
                    entry.future.clone()
                }
                None => {
                    let future = start().shared();
                    entries.insert(
                        key.to_owned(),
                        Entry {
                            future: future.clone(),
                            attached: 1,
                        },
                    );
                    future
                }
            }
        };

        let _detach = DetachOnDrop { table: self, key };
        shared.await
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
