//! Hoisting of register/stack moves ahead of earlier instructions
use log::debug;

use crate::{
    config::Options,
    program::{can_exchange, can_exchange_with_instruction, Program, Span},
};

/// Work done by [`bubble`]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BubbleStats {
    /// Number of exchanges, either between two moves or between a move and
    /// an instruction
    pub swaps: usize,
    /// Number of moves that ended up attached to an earlier operator
    pub hoisted: usize,
}

/// Moves every shuffle record as early as hazards allow
///
/// Records never leave their span, and the set of moves performed is
/// unchanged; only their position in the instruction stream differs.
pub fn bubble(p: &mut Program, opts: &Options) -> BubbleStats {
    let mut stats = BubbleStats::default();
    let mut budget = opts.max_bubble_swaps.unwrap_or(usize::MAX);
    let spans = p.spans.clone();
    for span in &spans {
        bubble_span(p, span, &mut budget, &mut stats);
    }
    debug!(
        "bubbling: {} swaps, {} moves hoisted",
        stats.swaps, stats.hoisted
    );
    stats
}

fn bubble_span(
    p: &mut Program,
    span: &Span,
    budget: &mut usize,
    stats: &mut BubbleStats,
) {
    for pos in span.first + 1..span.last {
        let id = p.seq[pos];
        let mut i = 0;
        while i < p.ops[id.index()].shuffles.len() {
            let owner = hoist(p, span, pos, i, budget, stats);
            if owner == pos {
                i += 1;
            } else {
                stats.hoisted += 1;
            }
        }
    }
}

/// Moves one record as far forward as it can go, returning the position of
/// the operator that owns it afterwards
fn hoist(
    p: &mut Program,
    span: &Span,
    mut pos: usize,
    mut index: usize,
    budget: &mut usize,
    stats: &mut BubbleStats,
) -> usize {
    while *budget > 0 {
        let owner = p.seq[pos];
        let list = &p.ops[owner.index()].shuffles;
        let cur = *p.shuffle(list[index]);
        if index > 0 {
            let prev = *p.shuffle(list[index - 1]);
            if !can_exchange(&prev, &cur) {
                break;
            }
            p.ops[owner.index()].shuffles.swap(index - 1, index);
            index -= 1;
        } else {
            if pos == span.first {
                break;
            }
            let pred = p.seq[pos - 1];
            if !can_exchange_with_instruction(&cur, &p.ops[pred.index()]) {
                break;
            }
            let s = p.ops[owner.index()].shuffles.remove(0);
            let list = &mut p.ops[pred.index()].shuffles;
            list.push(s);
            index = list.len() - 1;
            pos -= 1;
        }
        *budget -= 1;
        stats.swaps += 1;
    }
    pos
}
