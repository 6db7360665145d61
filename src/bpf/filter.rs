//! Classic BPF program generation from [`FilterCriteria`].
//!
//! The generated program is installed with `BIOCSETF` on BPF devices or
//! `SO_ATTACH_FILTER` on Linux packet sockets, so the kernel drops frames the
//! software filter would reject anyway. The software filter still runs on every
//! delivered frame.
//!
//! Layout of a generated program (blocks for empty sets are omitted):
//! ```text
//!   ldh  [12]                 ; EtherType
//!   jeq  #0x0800, +0, drop    ; IPv4 only
//!   ldb  [23]                 ; protocol     -- one jeq per value
//!   ld   [26]                 ; source IP    -- one jeq per value
//!   ld   [30]                 ; dest IP      -- one jeq per value
//!   ldb  [23]                 ; TCP or UDP? else accept
//!   ldx  4*([14]&0xf)         ; X = IPv4 header length
//!   ldh  [x+14]               ; source port  -- one jeq per value
//!   ldh  [x+16]               ; dest port    -- one jeq per value
//!   ret  #65535               ; accept
//!   ret  #0                   ; drop
//! ```

use crate::filter::FilterCriteria;
use crate::packet::{ETH_HLEN, ETHERTYPE_IPV4, PROTO_TCP, PROTO_UDP};

// ---------------------------------------------------------------------------
// FFI type: BPF instruction
// ---------------------------------------------------------------------------

/// A single classic BPF instruction, matching the kernel `struct bpf_insn`
/// (and Linux `struct sock_filter`, which has the same layout).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub struct bpf_insn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const _: () = assert!(std::mem::size_of::<bpf_insn>() == 8);

// ---------------------------------------------------------------------------
// BPF instruction constants
// ---------------------------------------------------------------------------

const BPF_LD: u16 = 0x00;
const BPF_LDX: u16 = 0x01;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

const BPF_W: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;

const BPF_ABS: u16 = 0x20;
const BPF_IND: u16 = 0x40;
const BPF_MSH: u16 = 0xa0;

const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

/// Largest program the kernel accepts (`BPF_MAXINSNS`).
pub const MAX_INSNS: usize = 4096;

/// Snap length returned for accepted frames.
pub const ACCEPT_SNAPLEN: u32 = 65535;

// Absolute offsets within an Ethernet frame.
const OFF_ETHERTYPE: u32 = 12;
const OFF_IP_PROTO: u32 = ETH_HLEN as u32 + 9;
const OFF_IP_SRC: u32 = ETH_HLEN as u32 + 12;
const OFF_IP_DST: u32 = ETH_HLEN as u32 + 16;
// Relative to X (IPv4 header length).
const OFF_SRC_PORT: u32 = ETH_HLEN as u32;
const OFF_DST_PORT: u32 = ETH_HLEN as u32 + 2;

fn insn(code: u16, jt: u8, jf: u8, k: u32) -> bpf_insn {
    bpf_insn { code, jt, jf, k }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgramError {
    #[error("branch at instruction {at} needs a {distance}-instruction jump (max 255)")]
    JumpOutOfRange { at: usize, distance: usize },
    #[error("program has {0} instructions, above the kernel limit of 4096")]
    TooLong(usize),
}

// ---------------------------------------------------------------------------
// Assembler with forward labels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Target {
    Next,
    Label(usize),
}

enum Op {
    Plain(bpf_insn),
    Jeq { k: u32, jt: Target, jf: Target },
}

#[derive(Default)]
struct Assembler {
    ops: Vec<Op>,
    labels: Vec<usize>,
}

impl Assembler {
    fn label(&mut self) -> usize {
        self.labels.push(usize::MAX);
        self.labels.len() - 1
    }

    fn bind(&mut self, label: usize) {
        self.labels[label] = self.ops.len();
    }

    fn emit(&mut self, code: u16, k: u32) {
        self.ops.push(Op::Plain(insn(code, 0, 0, k)));
    }

    fn jeq(&mut self, k: u32, jt: Target, jf: Target) {
        self.ops.push(Op::Jeq { k, jt, jf });
    }

    /// Load `load` into A, then branch to `pass` on any of `values`, else to `fail`.
    fn any_of(&mut self, load: bpf_insn, values: &[u32], pass: usize, fail: usize) {
        self.ops.push(Op::Plain(load));
        for (i, &v) in values.iter().enumerate() {
            let jf = if i + 1 == values.len() {
                Target::Label(fail)
            } else {
                Target::Next
            };
            self.jeq(v, Target::Label(pass), jf);
        }
    }

    fn resolve(&self, at: usize, target: Target) -> Result<u8, ProgramError> {
        let dest = match target {
            Target::Next => at + 1,
            Target::Label(l) => self.labels[l],
        };
        let distance = dest - (at + 1);
        u8::try_from(distance).map_err(|_| ProgramError::JumpOutOfRange { at, distance })
    }

    fn finish(self) -> Result<Vec<bpf_insn>, ProgramError> {
        if self.ops.len() > MAX_INSNS {
            return Err(ProgramError::TooLong(self.ops.len()));
        }
        let mut program = Vec::with_capacity(self.ops.len());
        for (at, op) in self.ops.iter().enumerate() {
            let ins = match *op {
                Op::Plain(ins) => ins,
                Op::Jeq { k, jt, jf } => insn(
                    BPF_JMP | BPF_JEQ | BPF_K,
                    self.resolve(at, jt)?,
                    self.resolve(at, jf)?,
                    k,
                ),
            };
            program.push(ins);
        }
        Ok(program)
    }
}

fn sorted<T: Copy + Ord>(set: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut v: Vec<T> = set.into_iter().collect();
    v.sort_unstable();
    v
}

// ---------------------------------------------------------------------------
// Public compiler
// ---------------------------------------------------------------------------

/// Compile `criteria` into a classic BPF program.
///
/// Returns `Ok(None)` for open criteria: nothing needs to be installed.
pub fn compile(criteria: &FilterCriteria) -> Result<Option<Vec<bpf_insn>>, ProgramError> {
    if criteria.is_open() {
        return Ok(None);
    }

    let mut asm = Assembler::default();
    let accept = asm.label();
    let reject = asm.label();

    asm.emit(BPF_LD | BPF_H | BPF_ABS, OFF_ETHERTYPE);
    asm.jeq(ETHERTYPE_IPV4 as u32, Target::Next, Target::Label(reject));

    let protocols = sorted(criteria.protocols.iter().map(|&p| p as u32));
    if !protocols.is_empty() {
        let next = asm.label();
        asm.any_of(insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, OFF_IP_PROTO), &protocols, next, reject);
        asm.bind(next);
    }

    let src_ips = sorted(criteria.src_ips.iter().map(|ip| u32::from(*ip)));
    if !src_ips.is_empty() {
        let next = asm.label();
        asm.any_of(insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, OFF_IP_SRC), &src_ips, next, reject);
        asm.bind(next);
    }

    let dst_ips = sorted(criteria.dst_ips.iter().map(|ip| u32::from(*ip)));
    if !dst_ips.is_empty() {
        let next = asm.label();
        asm.any_of(insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, OFF_IP_DST), &dst_ips, next, reject);
        asm.bind(next);
    }

    let src_ports = sorted(criteria.src_ports.iter().map(|&p| p as u32));
    let dst_ports = sorted(criteria.dst_ports.iter().map(|&p| p as u32));
    if !src_ports.is_empty() || !dst_ports.is_empty() {
        // Port constraints only apply to TCP and UDP.
        let ports = asm.label();
        asm.emit(BPF_LD | BPF_B | BPF_ABS, OFF_IP_PROTO);
        asm.jeq(PROTO_TCP as u32, Target::Label(ports), Target::Next);
        asm.jeq(PROTO_UDP as u32, Target::Label(ports), Target::Label(accept));
        asm.bind(ports);
        asm.emit(BPF_LDX | BPF_B | BPF_MSH, ETH_HLEN as u32);

        if !src_ports.is_empty() {
            let next = asm.label();
            asm.any_of(insn(BPF_LD | BPF_H | BPF_IND, 0, 0, OFF_SRC_PORT), &src_ports, next, reject);
            asm.bind(next);
        }
        if !dst_ports.is_empty() {
            let next = asm.label();
            asm.any_of(insn(BPF_LD | BPF_H | BPF_IND, 0, 0, OFF_DST_PORT), &dst_ports, next, reject);
            asm.bind(next);
        }
    }

    asm.bind(accept);
    asm.emit(BPF_RET | BPF_K, ACCEPT_SNAPLEN);
    asm.bind(reject);
    asm.emit(BPF_RET | BPF_K, 0);

    asm.finish().map(Some)
}

// ===========================================================================
// Tests
// ===========================================================================
