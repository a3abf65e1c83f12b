//! Variable to stack-slot mapping
use crate::program::op::VarId;

/// Size of a single variable's stack slot
pub const SLOT_SIZE: usize = 16;

/// Maps each variable to a byte offset within the stack frame
///
/// The mapping is built once, before scheduling, and is read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct Mapper {
    slots: Vec<Option<u32>>,
    used: usize,
}

impl Mapper {
    /// Builds a mapper from variables in first-use order
    ///
    /// `var_count` is the number of variables allocated by the program;
    /// repeated variables in `vars` are assigned a single slot.
    pub fn new(
        var_count: usize,
        vars: impl IntoIterator<Item = VarId>,
    ) -> Self {
        let mut slots = vec![None; var_count];
        let mut used = 0;
        for v in vars {
            let slot = &mut slots[v.index()];
            if slot.is_none() {
                *slot = Some((used * SLOT_SIZE) as u32);
                used += 1;
            }
        }
        Self { slots, used }
    }

    /// Returns the byte offset of a variable, relative to the frame base
    ///
    /// # Panics
    /// If the variable is not referenced by any operator
    pub fn offset_of(&self, v: VarId) -> u32 {
        match self.slots.get(v.index()).copied().flatten() {
            Some(offset) => offset,
            None => panic!("variable {v} is not mapped"),
        }
    }

    /// Checks whether the given variable has a slot
    pub fn is_mapped(&self, v: VarId) -> bool {
        matches!(self.slots.get(v.index()), Some(Some(..)))
    }

    /// Number of mapped variables
    pub fn len(&self) -> usize {
        self.used
    }

    /// Checks whether no variables are mapped
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Total frame size required by all slots, in bytes
    pub fn frame_size(&self) -> usize {
        self.used * SLOT_SIZE
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_first_use_order() {
        let m = Mapper::new(4, [VarId(2), VarId(0), VarId(2), VarId(3)]);
        assert_eq!(m.offset_of(VarId(2)), 0);
        assert_eq!(m.offset_of(VarId(0)), 16);
        assert_eq!(m.offset_of(VarId(3)), 32);
        assert!(!m.is_mapped(VarId(1)));
        assert_eq!(m.len(), 3);
        assert_eq!(m.frame_size(), 48);
    }

    #[test]
    #[should_panic(expected = "v1 is not mapped")]
    fn test_unmapped() {
        let m = Mapper::new(2, [VarId(0)]);
        m.offset_of(VarId(1));
    }
}
