use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use grid_core::MemberId;

const WORD_BITS: usize = 64;
const GROW: usize = 8;

/// Per-member backlog flags, mutated from transport send paths that must
/// never contend with the membership mutex. Reads see a lock-free snapshot;
/// growth replaces the word array while sharing the existing atomic cells,
/// so a flag flipped mid-growth lands in both the old and new snapshot.
#[derive(Debug)]
pub(crate) struct BacklogBitset {
    words: ArcSwap<Vec<Arc<AtomicU64>>>,
    grow: parking_lot::Mutex<()>,
}

impl Default for BacklogBitset {
    fn default() -> Self {
        BacklogBitset {
            words: ArcSwap::from_pointee(Vec::new()),
            grow: parking_lot::Mutex::new(()),
        }
    }
}

impl BacklogBitset {
    pub(crate) fn get(&self, id: MemberId) -> bool {
        let word = id.index() / WORD_BITS;
        let bit = 1u64 << (id.index() % WORD_BITS);
        let words = self.words.load();
        match words.get(word) {
            Some(cell) => cell.load(Ordering::Acquire) & bit != 0,
            None => false,
        }
    }

    pub(crate) fn set(&self, id: MemberId, excessive: bool) {
        let word = id.index() / WORD_BITS;
        let bit = 1u64 << (id.index() % WORD_BITS);
        let cell = self.word(word);
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let next = if excessive { current | bit } else { current & !bit };
            if next == current {
                return;
            }
            match cell.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    fn word(&self, index: usize) -> Arc<AtomicU64> {
        let words = self.words.load();
        if let Some(cell) = words.get(index) {
            return cell.clone();
        }
        drop(words);
        let _guard = self.grow.lock();
        // another grower may have won the race
        let words = self.words.load_full();
        if let Some(cell) = words.get(index) {
            return cell.clone();
        }
        let mut grown = Vec::with_capacity(index + GROW);
        grown.extend(words.iter().cloned());
        while grown.len() < index + GROW {
            grown.push(Arc::new(AtomicU64::new(0)));
        }
        let cell = grown[index].clone();
        self.words.store(Arc::new(grown));
        cell
    }
}
