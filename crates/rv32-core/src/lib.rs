//! RV32 process-level emulation engine built around dynamic binary
//! translation: guest code is formed into basic blocks, compiled through a
//! copy-and-patch template tier into recycled code pages, and — with the
//! `dynarec` feature — promoted to real machine code for hot loops.

pub mod block_map;
pub mod cache;
pub mod cfg;
pub mod code_page;
pub mod cpu;
pub mod decode;
pub mod io;
pub mod ir;
#[cfg(feature = "dynarec")]
mod jit;
pub mod riscv;
pub mod stats;
pub mod template;

#[cfg(feature = "dynarec")]
pub use rv32_dynarec;

pub use cpu::{Cpu, Exception};
pub use io::SystemIo;
pub use riscv::{BlockCachePolicy, EngineConfig, RiscV, StopReason};
pub use stats::Stats;

pub(crate) fn parse_env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

pub(crate) fn parse_env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
