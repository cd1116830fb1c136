//! Bounded, persisted pool of known peer addresses.
//!
//! The pool is an insertion-ordered set of [`AddressItem`] records keyed by
//! [`Authority`]. Overflow evicts the oldest entry. Dialing sessions `take`
//! addresses out of the pool and `restore` them when the connect attempt
//! fails; address gossip flows in through `save`.
//!
//! The pool persists to a single file: a little-endian u32 record count
//! followed by the records in wire form. Saving writes a sibling temp file
//! and renames it over the target so a crash never leaves a torn file.

use crate::authority::{AddressItem, Authority, ADDRESS_ITEM_SIZE};
use crate::error::NetworkError;
use crate::nonce::random_index;
use log::{debug, warn};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

struct Inner {
    order: VecDeque<AddressItem>,
    index: HashSet<Authority>,
}

/// Bounded FIFO-evicting set of peer addresses.
pub struct AddressPool {
    capacity: usize,
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl AddressPool {
    /// Create an empty pool persisting at `path`.
    ///
    /// A zero capacity disables the pool entirely.
    pub fn new(capacity: usize, path: PathBuf) -> Self {
        AddressPool {
            capacity,
            path,
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                index: HashSet::new(),
            }),
        }
    }

    /// Number of addresses currently held.
    pub fn count(&self) -> usize {
        self.inner.lock().expect("pool poisoned").order.len()
    }

    /// Remove and return one address for dialing.
    ///
    /// Picks randomly among the freshest quarter of the pool so dial attempts
    /// prefer recently gossiped peers without being fully predictable.
    pub fn take(&self) -> Option<AddressItem> {
        let mut inner = self.inner.lock().expect("pool poisoned");
        let count = inner.order.len();
        if count == 0 {
            return None;
        }

        let quarter = (count / 4).max(1);
        let position = (count - quarter) + random_index(quarter);

        let item = inner.order.remove(position)?;
        inner.index.remove(&item.authority());
        Some(item)
    }

    /// Copy out up to `wanted` distinct addresses without removing them.
    pub fn fetch(&self, wanted: usize) -> Vec<AddressItem> {
        let inner = self.inner.lock().expect("pool poisoned");
        let count = inner.order.len();
        if count == 0 || wanted == 0 {
            return Vec::new();
        }

        if count <= wanted {
            return inner.order.iter().copied().collect();
        }

        // Stride sample from a random offset; distinct by construction.
        let step = count / wanted;
        let offset = random_index(count);
        (0..wanted)
            .map(|sample| inner.order[(offset + sample * step) % count])
            .collect()
    }

    /// Merge gossiped addresses into the pool, evicting the oldest on
    /// overflow. Returns the number of addresses accepted.
    pub fn save(&self, items: &[AddressItem]) -> usize {
        if self.capacity == 0 {
            return 0;
        }

        let mut inner = self.inner.lock().expect("pool poisoned");
        let mut accepted = 0;

        for item in items {
            let authority = item.authority();
            if !authority.is_specified() || !authority.is_routable() {
                continue;
            }
            if !inner.index.insert(authority) {
                continue;
            }

            if inner.order.len() == self.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.index.remove(&evicted.authority());
                }
            }

            inner.order.push_back(*item);
            accepted += 1;
        }

        accepted
    }

    /// Return an address taken for a dial attempt that failed to connect.
    pub fn restore(&self, item: &AddressItem) {
        self.save(std::slice::from_ref(item));
    }

    /// Load the persisted pool, replacing current contents.
    ///
    /// A missing file is not an error; the pool simply starts empty.
    pub fn load(&self) -> Result<usize, NetworkError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!("No address pool file at {}", self.path.display());
                return Ok(0);
            }
            Err(error) => {
                warn!("Failed to read address pool file: {error}");
                return Err(NetworkError::FileLoad);
            }
        };

        if bytes.len() < 4 {
            return Err(NetworkError::FileLoad);
        }

        let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let records = &bytes[4..];
        if records.len() != declared * ADDRESS_ITEM_SIZE {
            return Err(NetworkError::FileLoad);
        }

        let mut items = Vec::with_capacity(declared);
        for record in records.chunks_exact(ADDRESS_ITEM_SIZE) {
            items.push(AddressItem::from_bytes(record).map_err(|_| NetworkError::FileLoad)?);
        }

        {
            let mut inner = self.inner.lock().expect("pool poisoned");
            inner.order.clear();
            inner.index.clear();
        }

        let loaded = self.save(&items);
        debug!("Loaded {loaded} addresses from {}", self.path.display());
        Ok(loaded)
    }

    /// Persist the pool atomically (write temp, rename over target).
    pub fn snapshot(&self) -> Result<(), NetworkError> {
        let items: Vec<AddressItem> = {
            let inner = self.inner.lock().expect("pool poisoned");
            inner.order.iter().copied().collect()
        };

        let mut bytes = Vec::with_capacity(4 + items.len() * ADDRESS_ITEM_SIZE);
        bytes.extend_from_slice(&(items.len() as u32).to_le_bytes());
        for item in &items {
            bytes.extend_from_slice(&item.to_bytes());
        }

        let temp = self.path.with_extension("tmp");
        std::fs::write(&temp, &bytes).map_err(|error| {
            warn!("Failed to write address pool file: {error}");
            NetworkError::FileSave
        })?;
        std::fs::rename(&temp, &self.path).map_err(|error| {
            warn!("Failed to replace address pool file: {error}");
            NetworkError::FileSave
        })?;

        debug!("Saved {} addresses to {}", items.len(), self.path.display());
        Ok(())
    }
}
