//! Dirty chunk bitmap.
//!
//! Records which chunks of one database were written since the last completed
//! flush. Iteration yields chunk numbers in ascending order, which is the order
//! the flush path queues them in.

/// Number of bits per word in the backing store.
const BITS_PER_WORD: u64 = 64;

/// Bitset over chunk numbers that grows on demand.
#[derive(Debug, Clone, Default)]
pub struct DirtyBitmap {
    words: Vec<u64>,
    count: usize,
}

impl DirtyBitmap {
    /// Creates an empty bitmap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a chunk as dirty. Returns `true` if it was clean before.
    pub fn mark(&mut self, chunk: u64) -> bool {
        let word = (chunk / BITS_PER_WORD) as usize;
        let bit = 1u64 << (chunk % BITS_PER_WORD);

        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }

        let newly = self.words[word] & bit == 0;
        if newly {
            self.words[word] |= bit;
            self.count += 1;
        }
        newly
    }

    /// Returns `true` if the chunk is marked dirty.
    #[cfg(test)]
    pub fn contains(&self, chunk: u64) -> bool {
        let word = (chunk / BITS_PER_WORD) as usize;
        self.words.get(word).is_some_and(|w| w & (1u64 << (chunk % BITS_PER_WORD)) != 0)
    }

    /// Iterates dirty chunk numbers in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(index, &word)| {
            let base = index as u64 * BITS_PER_WORD;
            let mut remaining = word;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = u64::from(remaining.trailing_zeros());
                remaining &= remaining - 1;
                Some(base + bit)
            })
        })
    }

    /// Number of dirty chunks.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if no chunk is dirty.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Clears all dirty flags.
    pub fn clear(&mut self) {
        self.words.clear();
        self.count = 0;
    }
}
