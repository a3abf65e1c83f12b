//! Pooled edge records for the dependency graph
use crate::{program::op::OpId, Error};

/// Index of a [`Hook`] within a [`Hooks`] arena
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HookId(u32);

/// A single edge in a singly-linked adjacency list
#[derive(Copy, Clone, Debug)]
pub struct Hook {
    /// Operator at the far end of the edge
    pub op: OpId,
    /// Next hook in the same list
    pub next: Option<HookId>,
}

/// Arena of hooks, with a free-index stack for recycling
#[derive(Default)]
pub struct Hooks {
    slots: Vec<Hook>,
    free: Vec<HookId>,
}

impl Hooks {
    /// Builds an empty arena
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a hook, reusing a recycled slot if one is available
    pub fn alloc(
        &mut self,
        op: OpId,
        next: Option<HookId>,
    ) -> Result<HookId, Error> {
        let hook = Hook { op, next };
        if let Some(id) = self.free.pop() {
            self.slots[id.0 as usize] = hook;
            return Ok(id);
        }
        let index = u32::try_from(self.slots.len())
            .map_err(|_| Error::OutOfMemory)?;
        self.slots.try_reserve(1)?;
        self.slots.push(hook);
        Ok(HookId(index))
    }

    /// Returns a hook to the free stack
    ///
    /// The caller must have already unlinked it from its list.
    pub fn recycle(&mut self, id: HookId) {
        debug_assert!(!self.free.contains(&id), "hook recycled twice");
        self.free.push(id);
    }

    /// Recycles every hook in the list starting at `head`
    pub fn recycle_list(&mut self, mut head: Option<HookId>) {
        while let Some(h) = head {
            head = self[h].next;
            self.recycle(h);
        }
    }

    /// Iterates over the operators in the list starting at `head`
    pub fn iter(&self, head: Option<HookId>) -> HookIter<'_> {
        HookIter { hooks: self, next: head }
    }

    /// Number of hooks currently linked into some list
    #[cfg(test)]
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Total number of hook slots ever allocated
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl std::ops::Index<HookId> for Hooks {
    type Output = Hook;
    fn index(&self, id: HookId) -> &Hook {
        &self.slots[id.0 as usize]
    }
}

/// Iterator over a linked list of hooks
pub struct HookIter<'a> {
    hooks: &'a Hooks,
    next: Option<HookId>,
}

impl Iterator for HookIter<'_> {
    type Item = OpId;
    fn next(&mut self) -> Option<OpId> {
        let h = self.next?;
        let hook = self.hooks[h];
        self.next = hook.next;
        Some(hook.op)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_recycle() {
        let mut hooks = Hooks::new();
        let a = hooks.alloc(OpId(0), None).unwrap();
        let b = hooks.alloc(OpId(1), Some(a)).unwrap();
        let c = hooks.alloc(OpId(2), Some(b)).unwrap();
        assert_eq!(
            hooks.iter(Some(c)).collect::<Vec<_>>(),
            vec![OpId(2), OpId(1), OpId(0)]
        );
        assert_eq!(hooks.live(), 3);

        hooks.recycle_list(Some(c));
        assert_eq!(hooks.live(), 0);

        // Recycled slots are handed out before the arena grows
        for i in 0..3 {
            hooks.alloc(OpId(i), None).unwrap();
        }
        assert_eq!(hooks.capacity(), 3);
        hooks.alloc(OpId(3), None).unwrap();
        assert_eq!(hooks.capacity(), 4);
    }
}
