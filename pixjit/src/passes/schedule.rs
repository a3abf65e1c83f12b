//! List scheduling within each span
use std::collections::VecDeque;

use log::debug;

use crate::{
    config::{Options, SchedulePolicy},
    program::{OpId, Program},
    Error,
};

/// Picks the next operator to schedule, removing it from the ready list
///
/// Every operator in `ready` is unscheduled, so its `order` is still its
/// position from before this scheduling round.
fn choose_next(
    p: &Program,
    ready: &mut VecDeque<OpId>,
    policy: SchedulePolicy,
) -> Option<OpId> {
    match policy {
        SchedulePolicy::Fifo => ready.pop_front(),
        SchedulePolicy::CriticalPath => {
            let (i, _) = ready.iter().enumerate().max_by(|(_, a), (_, b)| {
                let (a, b) = (p.op(**a), p.op(**b));
                a.height.cmp(&b.height).then(b.order.cmp(&a.order))
            })?;
            ready.remove(i)
        }
    }
}

/// Computes the longest path from each operator to the end of its span
fn compute_heights(p: &mut Program, first: usize, last: usize) {
    for i in (first..last).rev() {
        let id = p.seq[i];
        let h = p
            .dependents(id)
            .map(|d| p.ops[d.index()].height)
            .max()
            .unwrap_or(0);
        p.ops[id.index()].height = h + 1;
    }
}

/// Schedules every span of an analyzed program
///
/// On return, the program sequence is sorted by the new `order` values, and
/// each span's `longest_chain_size` and `variety` are populated.
pub fn schedule(p: &mut Program, opts: &Options) -> Result<(), Error> {
    for i in 0..p.spans.len() {
        schedule_span(p, i, opts.policy)?;
    }
    Ok(())
}

fn schedule_span(
    p: &mut Program,
    index: usize,
    policy: SchedulePolicy,
) -> Result<(), Error> {
    let span = p.spans[index];
    if policy == SchedulePolicy::CriticalPath {
        compute_heights(p, span.first, span.last);
    }

    // Scanning backwards and pushing to the front leaves the ready list in
    // position order.
    let mut ready = VecDeque::new();
    ready.try_reserve(span.len())?;
    for i in (span.first..span.last).rev() {
        let id = p.seq[i];
        if p.ops[id.index()].blockers == 0 {
            ready.push_front(id);
        }
    }

    let mut variety = ready.len();
    let mut longest = 0;
    let mut next = span.first;
    let mut unblocked = vec![];
    while let Some(id) = choose_next(p, &mut ready, policy) {
        let op = &mut p.ops[id.index()];
        op.order = next as u32;
        next += 1;
        let chain = op.chain_size;
        longest = longest.max(chain);

        unblocked.clear();
        let mut head = op.dependents;
        while let Some(h) = head {
            let hook = p.hooks[h];
            head = hook.next;
            let d = &mut p.ops[hook.op.index()];
            d.blockers -= 1;
            d.chain_size = d.chain_size.max(chain + 1);
            if d.blockers == 0 {
                unblocked.push(hook.op);
            }
        }
        unblocked.sort_unstable_by_key(|d| p.ops[d.index()].order);
        ready.extend(unblocked.iter().copied());
        variety = variety.max(ready.len());
    }
    assert_eq!(
        next, span.last,
        "dependency cycle in span {index}: scheduled {} of {} operators",
        next - span.first,
        span.len()
    );

    let ops = &p.ops;
    p.seq[span.first..span.last]
        .sort_unstable_by_key(|id| ops[id.index()].order);

    let span = &mut p.spans[index];
    span.longest_chain_size = longest;
    span.variety = variety as u32;
    debug!(
        "span {index}: {} ops, longest chain {}, variety {}",
        span.len(),
        span.longest_chain_size,
        span.variety
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        passes::analyze,
        program::{Constant, Gpr, MemRef, Opcode},
    };

    fn prepare(p: &mut Program, opts: &Options) {
        p.finish().unwrap();
        analyze(p, opts).unwrap();
        schedule(p, opts).unwrap();
    }

    /// Builds a program with a few independent chains and a loop
    fn sample() -> Program {
        let mut p = Program::new();
        let c = p.load_const(Constant::splat(2.0)).unwrap();
        let l = p.label();
        p.place_label(l).unwrap();
        let x = p.splat_gpr(Gpr::Rsi).unwrap();
        let a = p.binary(Opcode::MulPs, x, c).unwrap();
        let b = p.unary(Opcode::SqrtPs, a).unwrap();
        let d = p.binary(Opcode::AddPs, c, c).unwrap();
        let e = p.binary(Opcode::MinPs, b, d).unwrap();
        let y = p.load_mem(MemRef::base(Gpr::Rdi, 0)).unwrap();
        let f = p.binary(Opcode::MaxPs, e, y).unwrap();
        p.store_mem(MemRef::base(Gpr::R8, 0), f).unwrap();
        p.add_gpr_imm(Gpr::R8, 16).unwrap();
        p.dec_gpr(Gpr::Rcx).unwrap();
        p.jump_if_not_zero(l).unwrap();
        p
    }

    fn check_valid(p: &Program) {
        for span in p.spans() {
            // Bijection onto the span's positions
            let mut seen = vec![false; span.len()];
            for i in span.first..span.last {
                let op = p.op(p.sequence()[i]);
                assert_eq!(op.order() as usize, i);
                assert!(!std::mem::replace(&mut seen[i - span.first], true));
            }
            // Topological validity
            for &id in &p.sequence()[span.first..span.last] {
                for d in p.dependents(id) {
                    assert!(p.op(id).order() < p.op(d).order());
                }
            }
        }
    }

    #[test]
    fn test_three_op_order() {
        let mut p = Program::new();
        let v1 = p.load_const(Constant::splat(3.0)).unwrap();
        let v2 = p.binary(Opcode::AddPs, v1, v1).unwrap();
        let two = p.load_const(Constant::splat(2.0)).unwrap();
        let _v3 = p.binary(Opcode::MulPs, v2, two).unwrap();
        let ids = p.sequence().to_vec();
        prepare(&mut p, &Options::default());

        check_valid(&p);
        let pos =
            |id: OpId| p.sequence().iter().position(|i| *i == id).unwrap();
        assert!(pos(ids[0]) < pos(ids[1]));
        assert!(pos(ids[1]) < pos(ids[3]));
        assert!(pos(ids[2]) < pos(ids[3]));
    }

    #[test]
    fn test_fifo_order() {
        let mut p = Program::new();
        let a = p.load_const(Constant::splat(1.0)).unwrap();
        let b = p.unary(Opcode::SqrtPs, a).unwrap();
        let c = p.load_const(Constant::splat(2.0)).unwrap();
        let _ = p.binary(Opcode::AddPs, b, c).unwrap();
        let ids = p.sequence().to_vec();
        prepare(&mut p, &Options::default());

        // Both constants are ready first, then the chain that follows
        assert_eq!(&p.sequence()[..4], &[ids[0], ids[2], ids[1], ids[3]]);
        assert_eq!(p.spans()[0].longest_chain_size, 4);
        assert_eq!(p.spans()[0].variety, 2);
    }

    #[test]
    fn test_critical_path_order() {
        let mut p = Program::new();
        let a = p.load_const(Constant::splat(1.0)).unwrap();
        let _ = p.unary(Opcode::SqrtPs, a).unwrap();
        let c = p.load_const(Constant::splat(2.0)).unwrap();
        let c = p.unary(Opcode::SqrtPs, c).unwrap();
        let c = p.unary(Opcode::RcpPs, c).unwrap();
        let _ = p.unary(Opcode::SqrtPs, c).unwrap();
        let ids = p.sequence().to_vec();
        let opts = Options {
            policy: SchedulePolicy::CriticalPath,
            ..Options::default()
        };
        prepare(&mut p, &opts);
        check_valid(&p);

        // The longer chain is started first
        assert_eq!(p.sequence()[0], ids[2]);
        assert_eq!(p.op(ids[2]).height, 5);
        assert_eq!(p.op(ids[0]).height, 3);
    }

    #[test]
    fn test_valid_and_idempotent() {
        for policy in [SchedulePolicy::Fifo, SchedulePolicy::CriticalPath] {
            let opts = Options {
                policy,
                ..Options::default()
            };
            let mut p = sample();
            prepare(&mut p, &opts);
            check_valid(&p);
            let first = p.sequence().to_vec();
            let spans = p.spans().to_vec();

            p.reset_graph();
            analyze(&mut p, &opts).unwrap();
            schedule(&mut p, &opts).unwrap();
            check_valid(&p);
            assert_eq!(p.sequence(), first.as_slice(), "{policy}");
            assert_eq!(p.spans(), spans.as_slice(), "{policy}");
        }
    }

    #[test]
    fn test_control_stays_last() {
        let mut p = sample();
        prepare(&mut p, &Options::default());
        for span in p.spans() {
            let last = p.op(p.sequence()[span.last - 1]);
            assert!(last.is_control());
        }
    }
}
