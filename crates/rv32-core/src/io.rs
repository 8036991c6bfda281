//! The engine's view of the outside world: guest memory and the
//! side-effect callbacks for environment calls and breakpoints.

use crate::cpu::{Cpu, Exception};

/// Guest memory and side-effect interface supplied by the embedder.
///
/// All addresses are guest physical. Alignment is checked by the engine
/// before these are called, so implementations may assume naturally
/// aligned halfword/word accesses.
pub trait SystemIo {
    /// Fetch the instruction word at `addr`. For compressed instructions
    /// only the low 16 bits are used.
    fn mem_ifetch(&mut self, addr: u32) -> u32;

    fn mem_read_b(&mut self, addr: u32) -> u8;
    fn mem_read_s(&mut self, addr: u32) -> u16;
    fn mem_read_w(&mut self, addr: u32) -> u32;

    fn mem_write_b(&mut self, addr: u32, data: u8);
    fn mem_write_s(&mut self, addr: u32, data: u16);
    fn mem_write_w(&mut self, addr: u32, data: u32);

    /// Environment call. Runs with `cpu.pc` still at the ECALL instruction;
    /// whatever PC the handler leaves behind is where execution resumes.
    fn on_ecall(&mut self, cpu: &mut Cpu) {
        cpu.trap(Exception::EnvCall, 0);
    }

    /// Breakpoint (EBREAK).
    fn on_ebreak(&mut self, cpu: &mut Cpu) {
        let pc = cpu.pc;
        cpu.trap(Exception::Breakpoint, pc);
    }

    /// Optional bulk-fill accelerator. Return false to decline.
    fn on_memset(&mut self, _addr: u32, _value: u8, _len: u32) -> bool {
        false
    }

    /// Optional bulk-copy accelerator. Return false to decline.
    fn on_memcpy(&mut self, _dst: u32, _src: u32, _len: u32) -> bool {
        false
    }
}
