use crate::core::Block;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Download {
    source: Option<String>,
    requested: Option<Vec<u8>>,
    in_transit: VecDeque<Vec<u8>>,
    downloaded: Vec<Block>,
}

/// How a received block relates to the running download.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The block the download was waiting for
    Expected,
    /// No download is running
    Unsolicited(Block),
    /// Not requested, or sent by a peer other than the download source
    Unexpected(Block),
}

/// Block download from a single peer: the hash requested last, the
/// announced hashes still to request, and the blocks already received, in
/// announcement order (tip first).
#[derive(Default)]
pub struct SyncState {
    inner: Mutex<Download>,
}

impl SyncState {
    pub fn new() -> SyncState {
        SyncState::default()
    }

    fn lock(&self) -> MutexGuard<'_, Download> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a download of `hashes` from `source` and returns the first hash
    /// to request. A download from another peer that is still running keeps
    /// going and the announcement is ignored; the same peer may restart it.
    pub fn begin(&self, source: &str, hashes: Vec<Vec<u8>>) -> Option<Vec<u8>> {
        let mut download = self.lock();
        if download.source.as_deref().is_some_and(|current| current != source) {
            return None;
        }

        *download = Download::default();
        let mut in_transit: VecDeque<Vec<u8>> = hashes.into();
        let first = in_transit.pop_front()?;
        download.source = Some(source.to_string());
        download.requested = Some(first.clone());
        download.in_transit = in_transit;
        Some(first)
    }

    /// Accepts `block` from `source` if it is the one the download waits for.
    pub fn record(&self, source: &str, block: Block) -> Delivery {
        let mut download = self.lock();
        let Some(current) = download.source.as_deref() else {
            return Delivery::Unsolicited(block);
        };
        let expected = current == source
            && download.requested.as_deref() == Some(block.get_hash());
        if !expected {
            return Delivery::Unexpected(block);
        }
        download.requested = None;
        download.downloaded.push(block);
        Delivery::Expected
    }

    /// Source and hash of the next block to request, if any remain.
    pub fn next_request(&self) -> Option<(String, Vec<u8>)> {
        let mut download = self.lock();
        let source = download.source.clone()?;
        let next = download.in_transit.pop_front()?;
        download.requested = Some(next.clone());
        Some((source, next))
    }

    pub fn source(&self) -> Option<String> {
        self.lock().source.clone()
    }

    /// Hands over the finished download and resets the state.
    pub fn take_downloaded(&self) -> Vec<Block> {
        let mut download = self.lock();
        std::mem::take(&mut *download).downloaded
    }

    /// Drops the download if it comes from `source`. Returns whether it did.
    pub fn abort_from(&self, source: &str) -> bool {
        let mut download = self.lock();
        if download.source.as_deref() != Some(source) {
            return false;
        }
        *download = Download::default();
        true
    }
}
