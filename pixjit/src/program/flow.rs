//! Parallel operator streams, merged into the main sequence on demand
use crate::{program::Program, Error};

/// Number of side flows available while split
pub const MAX_FLOWS: usize = 4;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(super) enum FlowState {
    #[default]
    Main,
    Split {
        current: usize,
    },
}

/// A detachable operator sequence
#[derive(Default)]
pub(super) struct Flow {
    pub ops: Vec<super::OpId>,
    pub reversed: bool,
}

impl Program {
    fn current_flow(&self, what: &str) -> usize {
        match self.state {
            FlowState::Split { current } => current,
            FlowState::Main => panic!("{what} called outside of a split"),
        }
    }

    /// Parks the main sequence and starts appending to side flow 0
    ///
    /// # Panics
    /// If the program is already split
    pub fn split_flow(&mut self) {
        assert_eq!(self.state, FlowState::Main, "program is already split");
        assert!(!self.is_finished(), "cannot split a finished program");
        debug_assert!(self.flows.iter().all(|f| f.ops.is_empty()));
        std::mem::swap(&mut self.main, &mut self.seq);
        std::mem::swap(&mut self.seq, &mut self.flows[0].ops);
        self.state = FlowState::Split { current: 0 };
    }

    /// Switches the active side flow
    ///
    /// # Panics
    /// If the program is not split, or `id >= MAX_FLOWS`
    pub fn set_flow(&mut self, id: usize) {
        let current = self.current_flow("set_flow");
        assert!(id < MAX_FLOWS, "flow {id} is out of range");
        if id != current {
            std::mem::swap(&mut self.seq, &mut self.flows[current].ops);
            std::mem::swap(&mut self.seq, &mut self.flows[id].ops);
            self.state = FlowState::Split { current: id };
        }
    }

    /// Marks a side flow to be appended in reverse order when merged
    ///
    /// # Panics
    /// If the program is not split, or `id >= MAX_FLOWS`
    pub fn reverse_flow(&mut self, id: usize) {
        self.current_flow("reverse_flow");
        assert!(id < MAX_FLOWS, "flow {id} is out of range");
        self.flows[id].reversed = true;
    }

    /// Number of operators queued in the given side flow
    pub fn flow_len(&self, id: usize) -> usize {
        match self.state {
            FlowState::Split { current } if current == id => self.seq.len(),
            _ => self.flows[id].ops.len(),
        }
    }

    /// Returns to the main sequence, appending every side flow in index order
    ///
    /// Appended operators are renumbered to their new positions, and every
    /// side flow is left empty and unreversed.
    ///
    /// # Panics
    /// If the program is not split
    pub fn merge_flow(&mut self) -> Result<(), Error> {
        let current = self.current_flow("merge_flow");
        std::mem::swap(&mut self.seq, &mut self.flows[current].ops);
        std::mem::swap(&mut self.seq, &mut self.main);
        self.state = FlowState::Main;

        let extra: usize = self.flows.iter().map(|f| f.ops.len()).sum();
        self.seq.try_reserve(extra)?;
        for flow in &mut self.flows {
            if flow.reversed {
                self.seq.extend(flow.ops.drain(..).rev());
            } else {
                self.seq.append(&mut flow.ops);
            }
            flow.reversed = false;
        }
        for (i, id) in self.seq.iter().enumerate() {
            self.ops[id.index()].order = i as u32;
        }
        Ok(())
    }
}
