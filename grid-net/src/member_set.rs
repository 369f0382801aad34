use std::fmt::{Display, Formatter};

use grid_core::MemberId;

const WORD_BITS: usize = 64;

/// A set of member ids backed by a growable bitset. Member ids are small
/// integers, so a word array beats a hash set for the addressing and poll
/// bookkeeping done on every request.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MemberIdSet {
    words: Vec<u64>,
    len: usize,
}

impl MemberIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn singleton(id: MemberId) -> Self {
        let mut set = Self::new();
        set.insert(id);
        set
    }

    pub fn insert(&mut self, id: MemberId) -> bool {
        debug_assert!(id.is_valid());
        let (word, bit) = Self::locate(id);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let present = self.words[word] & bit != 0;
        if !present {
            self.words[word] |= bit;
            self.len += 1;
        }
        !present
    }

    pub fn remove(&mut self, id: MemberId) -> bool {
        let (word, bit) = Self::locate(id);
        if word >= self.words.len() || self.words[word] & bit == 0 {
            return false;
        }
        self.words[word] &= !bit;
        self.len -= 1;
        true
    }

    pub fn contains(&self, id: MemberId) -> bool {
        let (word, bit) = Self::locate(id);
        word < self.words.len() && self.words[word] & bit != 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.len = 0;
    }

    /// The lowest member id in the set.
    pub fn first_id(&self) -> Option<MemberId> {
        for (i, word) in self.words.iter().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros() as usize;
                return Some(MemberId((i * WORD_BITS + bit) as u16));
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| MemberId((i * WORD_BITS + bit) as u16))
        })
    }

    fn locate(id: MemberId) -> (usize, u64) {
        (id.index() / WORD_BITS, 1u64 << (id.index() % WORD_BITS))
    }
}

impl FromIterator<MemberId> for MemberIdSet {
    fn from_iter<T: IntoIterator<Item = MemberId>>(iter: T) -> Self {
        let mut set = MemberIdSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl Display for MemberIdSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        write!(f, "[")?;
        for id in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", id)?;
            first = false;
        }
        write!(f, "]")
    }
}
