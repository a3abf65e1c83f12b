//! Literal pools, placed after the code
use std::collections::HashMap;

use crate::{program::Constant, Error};

/// Deduplicated literals, grouped by width
#[derive(Default)]
pub struct Pools {
    wide: Vec<[u32; 4]>,
    double: Vec<u64>,
    single: Vec<u32>,
    index: HashMap<Constant, usize>,
}

/// Byte offsets of each pool, relative to the start of the buffer
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolLayout {
    /// Start of the 16-byte pool (16-byte aligned)
    pub base16: usize,
    /// Start of the 8-byte pool
    pub base8: usize,
    /// Start of the 4-byte pool
    pub base4: usize,
    /// End of the last pool
    pub end: usize,
}

impl Pools {
    /// Adds a literal, returning its index within its pool
    pub fn intern(&mut self, c: Constant) -> usize {
        if let Some(i) = self.index.get(&c) {
            return *i;
        }
        let i = match c {
            Constant::Sixteen(v) => {
                self.wide.push(v);
                self.wide.len() - 1
            }
            Constant::Eight(v) => {
                self.double.push(v);
                self.double.len() - 1
            }
            Constant::Four(v) => {
                self.single.push(v);
                self.single.len() - 1
            }
        };
        self.index.insert(c, i);
        i
    }

    /// Number of distinct literals
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Lays out the pools after `code_len` bytes of code
    pub fn layout(&self, code_len: usize) -> Result<PoolLayout, Error> {
        let base16 = code_len.next_multiple_of(16);
        let base8 = base16 + 16 * self.wide.len();
        let base4 = base8 + 8 * self.double.len();
        let end = base4 + 4 * self.single.len();
        if end > i32::MAX as usize {
            return Err(Error::PoolOverflow(end));
        }
        Ok(PoolLayout {
            base16,
            base8,
            base4,
            end,
        })
    }

    /// Returns the buffer offset of an interned literal
    ///
    /// # Panics
    /// If the literal was never interned
    pub fn offset(&self, layout: &PoolLayout, c: Constant) -> usize {
        let Some(&i) = self.index.get(&c) else {
            panic!("literal {c:?} is not pooled");
        };
        match c {
            Constant::Sixteen(..) => layout.base16 + 16 * i,
            Constant::Eight(..) => layout.base8 + 8 * i,
            Constant::Four(..) => layout.base4 + 4 * i,
        }
    }

    /// Appends padding and every pool to the code in `out`
    pub fn write(&self, layout: &PoolLayout, out: &mut Vec<u8>) {
        out.resize(layout.base16, 0);
        for v in &self.wide {
            for lane in v {
                out.extend_from_slice(&lane.to_le_bytes());
            }
        }
        for v in &self.double {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in &self.single {
            out.extend_from_slice(&v.to_le_bytes());
        }
        debug_assert_eq!(out.len(), layout.end);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_layout() {
        let mut pools = Pools::default();
        let one = Constant::splat(1.0);
        let v = Constant::vector([1.0, 2.0, 3.0, 4.0]);
        let d = Constant::Eight(0x0123_4567_89ab_cdef);
        assert_eq!(pools.intern(one), 0);
        assert_eq!(pools.intern(v), 0);
        assert_eq!(pools.intern(d), 0);
        assert_eq!(pools.intern(Constant::splat(2.0)), 1);
        assert_eq!(pools.intern(one), 0);
        assert_eq!(pools.len(), 4);

        let layout = pools.layout(21).unwrap();
        assert_eq!(
            layout,
            PoolLayout {
                base16: 32,
                base8: 48,
                base4: 56,
                end: 64
            }
        );
        assert_eq!(pools.offset(&layout, Constant::splat(2.0)), 60);

        let mut out = vec![0xCC; 21];
        pools.write(&layout, &mut out);
        assert_eq!(out.len(), 64);
        assert_eq!(&out[32..36], &1.0f32.to_le_bytes());
        assert_eq!(&out[48..56], &0x0123_4567_89ab_cdefu64.to_le_bytes());
        assert_eq!(&out[56..60], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_overflow() {
        let pools = Pools::default();
        assert!(matches!(
            pools.layout(i32::MAX as usize + 1),
            Err(Error::PoolOverflow(..))
        ));
    }
}
