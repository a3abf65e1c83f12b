//! Dependency analysis within each span
use std::collections::HashMap;

use crate::{
    config::Options,
    program::{Location, OpFlags, OpId, Program, Span},
    Error,
};

/// Records an edge `from -> to`, unless it already exists
///
/// Returns `true` if a new edge was added.
fn link(p: &mut Program, from: OpId, to: OpId) -> Result<bool, Error> {
    debug_assert!(
        p.ops[from.index()].order < p.ops[to.index()].order,
        "edges must point forward"
    );
    if p.dependents(from).any(|d| d == to) {
        return Ok(false);
    }
    let head = p.ops[from.index()].dependents;
    let h = p.hooks.alloc(to, head)?;
    p.ops[from.index()].dependents = Some(h);
    p.ops[to.index()].blockers += 1;
    Ok(true)
}

/// Orders a reader and a writer of the same location by position
///
/// Writers are discovered in the order they were collected rather than in
/// program order, so the edge may point either way.
fn check_implicit(
    p: &mut Program,
    writer: OpId,
    reader: OpId,
) -> Result<bool, Error> {
    if writer == reader {
        return Ok(false);
    }
    if p.ops[writer.index()].order < p.ops[reader.index()].order {
        link(p, writer, reader)
    } else {
        link(p, reader, writer)
    }
}

/// Links the sole zero-flag producer of `consumer` to it
///
/// # Panics
/// If no producer exists in the span, or another flag-clobbering operator
/// sits between the producer and the consumer
fn check_flags(
    p: &mut Program,
    span: &Span,
    consumer: usize,
) -> Result<usize, Error> {
    let mut producer = None;
    for i in (span.first..consumer).rev() {
        let op = &p.ops[p.seq[i].index()];
        if op.flags.contains(OpFlags::CALCULATES_ZF) {
            producer = Some(i);
            break;
        }
        assert!(
            !op.flags.contains(OpFlags::CHANGES_ZF),
            "{} clobbers the zero flag before {} reads it",
            op.opcode,
            p.ops[p.seq[consumer].index()].opcode,
        );
    }
    let Some(producer) = producer else {
        panic!(
            "{} has no zero-flag producer in its span",
            p.ops[p.seq[consumer].index()].opcode
        );
    };

    let (pid, cid) = (p.seq[producer], p.seq[consumer]);
    let mut edges = usize::from(link(p, pid, cid)?);
    for i in span.first..span.last {
        if i == producer || i == consumer {
            continue;
        }
        let x = p.seq[i];
        if !p.ops[x.index()].touches_flags() {
            continue;
        }
        if i < producer {
            edges += usize::from(link(p, x, pid)?);
        } else if i > consumer {
            edges += usize::from(link(p, cid, x)?);
        }
    }
    Ok(edges)
}

/// Builds dependency edges for every span of a finished program
///
/// Returns the number of edges added.  Operators must be numbered by
/// position, which is the case after [`Program::finish`] and after
/// scheduling.
pub fn analyze(p: &mut Program, opts: &Options) -> Result<usize, Error> {
    assert!(p.is_finished(), "program must be finished before analysis");
    let mut edges = 0;
    let spans = p.spans.clone();
    for span in &spans {
        edges += analyze_span(p, span, opts)?;
    }
    Ok(edges)
}

fn analyze_span(
    p: &mut Program,
    span: &Span,
    opts: &Options,
) -> Result<usize, Error> {
    let ids = p.seq[span.first..span.last].to_vec();
    let mut edges = 0;

    // Collect writers of every location, in position order
    let mut writers: HashMap<Location, Vec<OpId>> = HashMap::new();
    for &id in &ids {
        for loc in p.ops[id.index()].writes() {
            writers.entry(loc).or_default().push(id);
        }
    }

    // Write-after-write
    for ws in writers.values() {
        for pair in ws.windows(2) {
            edges += usize::from(link(p, pair[0], pair[1])?);
        }
    }

    // Read-after-write and write-after-read
    for &id in &ids {
        if p.ops[id.index()].is_control() {
            continue;
        }
        let reads: Vec<Location> = p.ops[id.index()].reads().collect();
        for loc in reads {
            let Some(ws) = writers.get(&loc) else {
                continue;
            };
            for &w in ws {
                edges += usize::from(check_implicit(p, w, id)?);
            }
        }
    }

    for (i, &id) in ids.iter().enumerate() {
        if p.ops[id.index()].flags.contains(OpFlags::CONSUMES_ZF) {
            edges += check_flags(p, span, span.first + i)?;
        }
    }

    if !opts.relaxed_memory {
        let mut prev = None;
        for &id in &ids {
            if p.ops[id.index()].touches_outside() {
                if let Some(prev) = prev {
                    edges += usize::from(link(p, prev, id)?);
                }
                prev = Some(id);
            }
        }
    }

    // The terminating control operator follows everything else
    if let Some((&last, rest)) = ids.split_last() {
        debug_assert!(p.ops[last.index()].is_control());
        for &id in rest {
            edges += usize::from(link(p, id, last)?);
        }
    }
    Ok(edges)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::program::{Constant, Gpr, MemRef, Opcode};

    fn deps(p: &Program, id: OpId) -> Vec<OpId> {
        let mut out: Vec<_> = p.dependents(id).collect();
        out.sort();
        out
    }

    #[test]
    fn test_data_dependencies() {
        let mut p = Program::new();
        let a = p.load_const(Constant::splat(1.0)).unwrap();
        let b = p.load_const(Constant::splat(2.0)).unwrap();
        let c = p.binary(Opcode::AddPs, a, b).unwrap();
        let _ = p.binary(Opcode::MulPs, c, c).unwrap();
        p.finish().unwrap();
        analyze(&mut p, &Options::default()).unwrap();

        let ids = p.sequence().to_vec();
        assert_eq!(deps(&p, ids[0]), vec![ids[2], ids[4]]);
        assert_eq!(deps(&p, ids[1]), vec![ids[2], ids[4]]);
        assert_eq!(deps(&p, ids[2]), vec![ids[3], ids[4]]);
        assert_eq!(deps(&p, ids[3]), vec![ids[4]]);
        assert_eq!(p.op(ids[0]).blockers, 0);
        assert_eq!(p.op(ids[2]).blockers, 2);
        assert_eq!(p.op(ids[4]).blockers, 4);
    }

    #[test]
    fn test_write_after_read() {
        let mut p = Program::new();
        let a = p.load_const(Constant::splat(1.0)).unwrap();
        let b = p.unary(Opcode::SqrtPs, a).unwrap();
        // Overwrites `a` after it has been read
        p.binary_into(Opcode::AddPs, a, b, b).unwrap();
        p.finish().unwrap();
        analyze(&mut p, &Options::default()).unwrap();

        let ids = p.sequence().to_vec();
        assert!(p.dependents(ids[0]).any(|d| d == ids[1]));
        assert!(p.dependents(ids[0]).any(|d| d == ids[2])); // WAW
        assert!(p.dependents(ids[1]).any(|d| d == ids[2])); // WAR + RAW
    }

    #[test]
    fn test_flags() {
        let mut p = Program::new();
        let l = p.label();
        p.place_label(l).unwrap();
        p.add_gpr_imm(Gpr::R8, 16).unwrap();
        p.dec_gpr(Gpr::Rcx).unwrap();
        let a = p.load_const(Constant::splat(1.0)).unwrap();
        let _ = p.unary(Opcode::SqrtPs, a).unwrap();
        p.jump_if_not_zero(l).unwrap();
        p.finish().unwrap();
        analyze(&mut p, &Options::default()).unwrap();

        let ids = p.sequence().to_vec();
        // add r8 also sets flags, so it must precede the dec
        assert!(p.dependents(ids[1]).any(|d| d == ids[2]));
        assert!(p.dependents(ids[2]).any(|d| d == ids[5]));
    }

    #[test]
    fn test_flags_from_add() {
        let mut p = Program::new();
        let l = p.label();
        p.place_label(l).unwrap();
        p.dec_gpr(Gpr::Rcx).unwrap();
        p.add_gpr_imm(Gpr::R8, -1).unwrap();
        p.jump_if_not_zero(l).unwrap();
        p.finish().unwrap();
        analyze(&mut p, &Options::default()).unwrap();

        // The add is the producer; the earlier dec must come before it
        let ids = p.sequence().to_vec();
        assert!(p.dependents(ids[2]).any(|d| d == ids[3]));
        assert!(p.dependents(ids[1]).any(|d| d == ids[2]));
    }

    #[test]
    #[should_panic(expected = "clobbers the zero flag")]
    fn test_flags_clobbered() {
        let mut p = Program::new();
        let l = p.label();
        p.place_label(l).unwrap();
        p.dec_gpr(Gpr::Rcx).unwrap();
        let a = p.load_const(Constant::splat(1.0)).unwrap();
        let a = p.unary(Opcode::SqrtPs, a).unwrap();
        p.jump_if_not_zero(l).unwrap();
        let id = p.sequence()[3];
        assert_eq!(p.op(id).result, a.into());
        p.op_mut(id).flags |= OpFlags::CHANGES_ZF;
        p.finish().unwrap();
        let _ = analyze(&mut p, &Options::default());
    }

    #[test]
    #[should_panic(expected = "no zero-flag producer")]
    fn test_flags_missing() {
        let mut p = Program::new();
        let l = p.label();
        p.place_label(l).unwrap();
        p.jump_if_zero(l).unwrap();
        p.finish().unwrap();
        let _ = analyze(&mut p, &Options::default());
    }

    #[test]
    fn test_outside_memory() {
        let build = || {
            let mut p = Program::new();
            let a = p.load_const(Constant::splat(1.0)).unwrap();
            p.store_mem(MemRef::base(Gpr::R8, 0), a).unwrap();
            p.store_mem(MemRef::base(Gpr::R9, 0), a).unwrap();
            p.finish().unwrap();
            p
        };

        let mut p = build();
        analyze(&mut p, &Options::default()).unwrap();
        let ids = p.sequence().to_vec();
        assert!(p.dependents(ids[1]).any(|d| d == ids[2]));

        let mut p = build();
        let opts = Options {
            relaxed_memory: true,
            ..Options::default()
        };
        analyze(&mut p, &opts).unwrap();
        let ids = p.sequence().to_vec();
        assert!(!p.dependents(ids[1]).any(|d| d == ids[2]));
    }

    #[test]
    fn test_reset_recycles_hooks() {
        let mut p = Program::new();
        let a = p.load_const(Constant::splat(1.0)).unwrap();
        let _ = p.binary(Opcode::AddPs, a, a).unwrap();
        p.finish().unwrap();

        let edges = analyze(&mut p, &Options::default()).unwrap();
        assert_eq!(edges, 3);
        assert_eq!(p.hooks.live(), 3);
        p.reset_graph();
        assert_eq!(p.hooks.live(), 0);
        assert_eq!(analyze(&mut p, &Options::default()).unwrap(), 3);
        assert_eq!(p.hooks.capacity(), 3);
    }
}
