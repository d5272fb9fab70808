//! A bit array over priority levels supporting constant-time "find lowest
//! set bit" (the scheduler's "is there a runnable thread at this priority or
//! higher" query), via the classic 32-bit de Bruijn multiply-and-shift
//! trick.
//!
//! `PRIORITY_LEVELS` is capped at 32 by the surrounding crate, so unlike a
//! general-purpose bitmap this never needs more than one `u32` word.

use core::fmt;

/// Index into a 32-entry de Bruijn lookup table, built from the sequence
/// `0x077CB531`. Cross-checked against the `MultiplyDeBruijnBitPosition`
/// table used for the same purpose in the reference implementation this
/// scheduler is modeled on.
const DEBRUIJN_TABLE: [u8; 32] = [
    0, 1, 28, 2, 29, 14, 24, 3, 30, 22, 20, 15, 25, 17, 4, 8, 31, 27, 13, 23, 21, 19, 16, 7, 26,
    12, 18, 6, 11, 5, 10, 9,
];

/// Position of the lowest set bit of `x`, or `None` if `x == 0`.
#[inline]
pub fn find_lowest_set_bit(x: u32) -> Option<usize> {
    if x == 0 {
        return None;
    }
    let isolated = x & x.wrapping_neg();
    let index = (isolated.wrapping_mul(0x077C_B531)) >> 27;
    Some(DEBRUIJN_TABLE[index as usize] as usize)
}

/// A bit array over at most 32 priority levels.
pub trait PrioBitmap: Default + Clone + Copy + fmt::Debug {
    /// Returns whether bit `i` is set.
    fn get(&self, i: usize) -> bool;
    /// Clears bit `i`.
    fn clear(&mut self, i: usize);
    /// Sets bit `i`.
    fn set(&mut self, i: usize);
    /// Returns the lowest set bit's index, the highest-priority runnable
    /// level.
    fn find_set(&self) -> Option<usize>;
}

/// Concrete [`PrioBitmap`] for up to `LEN` (≤ 32) priority levels.
#[derive(Clone, Copy, Default)]
pub struct PriorityBitmap<const LEN: usize> {
    bits: u32,
}

impl<const LEN: usize> PriorityBitmap<LEN> {
    const _ASSERT_LEN_FITS: () = assert!(LEN <= 32, "PRIORITY_LEVELS must be <= 32");

    pub const fn new() -> Self {
        let () = Self::_ASSERT_LEN_FITS;
        Self { bits: 0 }
    }
}

impl<const LEN: usize> fmt::Debug for PriorityBitmap<LEN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries((0..LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl<const LEN: usize> PrioBitmap for PriorityBitmap<LEN> {
    fn get(&self, i: usize) -> bool {
        assert!(i < LEN);
        (self.bits >> i) & 1 != 0
    }

    fn clear(&mut self, i: usize) {
        assert!(i < LEN);
        self.bits &= !(1 << i);
    }

    fn set(&mut self, i: usize) {
        assert!(i < LEN);
        self.bits |= 1 << i;
    }

    fn find_set(&self) -> Option<usize> {
        find_lowest_set_bit(self.bits).filter(|&i| i < LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    #[test]
    fn debruijn_matches_trailing_zeros_exhaustively() {
        assert_eq!(find_lowest_set_bit(0), None);
        for i in 0..32u32 {
            let x = 1u32 << i;
            assert_eq!(find_lowest_set_bit(x), Some(i as usize));
        }
    }

    #[quickcheck]
    fn debruijn_matches_trailing_zeros(x: u32) -> bool {
        find_lowest_set_bit(x) == (if x == 0 { None } else { Some(x.trailing_zeros() as usize) })
    }

    struct BTreePrioBitmap(BTreeSet<usize>);

    impl BTreePrioBitmap {
        fn new() -> Self {
            Self(BTreeSet::new())
        }
        fn clear(&mut self, i: usize) {
            self.0.remove(&i);
        }
        fn set(&mut self, i: usize) {
            self.0.insert(i);
        }
        fn find_set(&self) -> Option<usize> {
            self.0.iter().next().copied()
        }
    }

    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    fn interpret(bytecode: &[u8], len: usize) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known = std::vec::Vec::new();
        std::iter::from_fn(move || {
            if len == 0 {
                return None;
            }
            let instr = bytecode.get(i..i + 2)?;
            i += 2;
            let bit = (instr[1] as usize) % len;
            if instr[0] % 2 == 0 || known.is_empty() {
                known.push(bit);
                Some(Cmd::Insert(bit))
            } else {
                let idx = bit % known.len();
                Some(Cmd::Remove(known.swap_remove(idx)))
            }
        })
    }

    fn test_inner<const LEN: usize>(bytecode: std::vec::Vec<u8>) {
        let mut subject = PriorityBitmap::<LEN>::new();
        let mut reference = BTreePrioBitmap::new();
        for cmd in interpret(&bytecode, LEN) {
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.set(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.clear(bit);
                }
            }
            assert_eq!(subject.find_set(), reference.find_set());
        }
    }

    #[quickcheck]
    fn matches_reference_model_16(bytecode: std::vec::Vec<u8>) {
        test_inner::<16>(bytecode);
    }

    #[quickcheck]
    fn matches_reference_model_32(bytecode: std::vec::Vec<u8>) {
        test_inner::<32>(bytecode);
    }
}
