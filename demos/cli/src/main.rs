use anyhow::Result;
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::info;

use pixjit::{
    abi,
    config::{Options, SchedulePolicy},
    program::{Constant, MemRef, Opcode, Program},
};

/// Compiles and runs a horizontal gradient effect
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Number of pixels in the row
    #[clap(short, long, default_value_t = 8)]
    width: u32,

    /// Scheduling policy
    #[clap(short, long, value_enum, default_value_t = Policy::Fifo)]
    policy: Policy,

    /// Disable hoisting of register moves
    #[clap(long)]
    no_bubble: bool,

    /// Allow reordering of state reads and output writes
    #[clap(long)]
    relaxed_memory: bool,

    /// Maximum number of exchanges performed while hoisting moves
    #[clap(long)]
    max_swaps: Option<usize>,

    /// Print an operator-by-operator disassembly
    #[clap(long)]
    listing: bool,
}

#[derive(ValueEnum, Copy, Clone)]
enum Policy {
    Fifo,
    CriticalPath,
}

impl From<Policy> for SchedulePolicy {
    fn from(p: Policy) -> Self {
        match p {
            Policy::Fifo => SchedulePolicy::Fifo,
            Policy::CriticalPath => SchedulePolicy::CriticalPath,
        }
    }
}

// Byte offsets within the effect state
const STATE_FROM: i32 = 0;
const STATE_TO: i32 = 16;
const STATE_INV_WIDTH: i32 = 32;

/// Builds the effect
///
/// Each pixel is `clamp(from + (to - from) * x / width, 0, 1)`.  The color
/// difference and the pixel position are independent, so they are written
/// as separate flows and left to the scheduler to interleave.
fn gradient() -> Result<Program> {
    let mut p = Program::new();
    let top = p.label();
    p.place_label(top)?;

    p.split_flow();
    let from = p.load_mem(MemRef::base(abi::STATE, STATE_FROM))?;
    let to = p.load_mem(MemRef::base(abi::STATE, STATE_TO))?;
    let delta = p.binary(Opcode::SubPs, to, from)?;

    p.set_flow(1);
    let x = p.splat_gpr(abi::X)?;
    let inv_width = p.load_mem(MemRef::base(abi::STATE, STATE_INV_WIDTH))?;
    let t = p.binary(Opcode::MulPs, x, inv_width)?;
    p.merge_flow()?;

    let v = p.binary(Opcode::MulPs, delta, t)?;
    let v = p.binary(Opcode::AddPs, from, v)?;
    let one = p.load_const(Constant::splat(1.0))?;
    let zero = p.load_const(Constant::splat(0.0))?;
    let v = p.binary(Opcode::MinPs, v, one)?;
    let v = p.binary(Opcode::MaxPs, v, zero)?;
    p.store_mem(MemRef::base(abi::OUT, 0), v)?;

    p.add_gpr_imm(abi::OUT, 16)?;
    p.add_gpr_imm(abi::X, 1)?;
    p.dec_gpr(abi::COUNT)?;
    p.jump_if_not_zero(top)?;
    Ok(p)
}

#[cfg(feature = "jit")]
fn run(args: &Args, opts: &Options) -> Result<()> {
    use std::time::Instant;

    if !std::arch::is_x86_feature_detected!("avx") {
        anyhow::bail!("this host does not support AVX");
    }
    anyhow::ensure!(args.width > 0, "width must be at least 1");

    let start = Instant::now();
    let f = pixjit::jit::compile(gradient()?, opts)?;
    info!("Compiled in {:?}", start.elapsed());
    let stats = f.stats();
    info!(
        "{} spans, {} dependency edges, {} loads, {} stores, {} moves hoisted",
        stats.spans,
        stats.passes.edges,
        stats.passes.placement.loads,
        stats.passes.placement.stores,
        stats.passes.bubble.hoisted,
    );
    info!(
        "{} bytes of code, {} bytes of literals, {} byte frame",
        stats.code_len, stats.pool_len, stats.frame_size
    );
    if args.listing {
        println!("{}", f.listing());
    }

    let inv_width = 1.0 / args.width as f32;
    let state: [f32; 12] = [
        0.1, 0.2, 0.9, 1.0, // from
        1.0, 0.6, 0.0, 1.0, // to
        inv_width, inv_width, inv_width, inv_width,
    ];
    let mut out = vec![[0f32; 4]; args.width as usize];
    let start = Instant::now();
    // SAFETY: the effect reads 48 bytes of state and writes one 16-byte
    // pixel per step, for `width` steps
    unsafe {
        f.call(
            state.as_ptr() as *const u8,
            0,
            0,
            args.width,
            out.as_mut_ptr() as *mut u8,
        );
    }
    info!("Ran in {:?}", start.elapsed());
    for (i, [r, g, b, a]) in out.iter().enumerate() {
        println!("{i:>4}: {r:.3} {g:.3} {b:.3} {a:.3}");
    }
    Ok(())
}

#[cfg(not(feature = "jit"))]
fn run(_args: &Args, opts: &Options) -> Result<()> {
    let mut p = gradient()?;
    let stats = pixjit::passes::run(&mut p, opts)?;
    info!("{stats:?}");
    for (i, span) in p.spans().iter().enumerate() {
        println!(
            "span {i}: {} operators, longest chain {}, variety {}",
            span.len(),
            span.longest_chain_size,
            span.variety
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();
    let args = Args::parse();
    let opts = Options {
        relaxed_memory: args.relaxed_memory,
        policy: args.policy.into(),
        bubble: !args.no_bubble,
        max_bubble_swaps: args.max_swaps,
        ..Options::default()
    };
    info!("Compiling with {} scheduling", opts.policy);
    run(&args, &opts)
}
