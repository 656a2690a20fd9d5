//! Canonical x86-64 register names and the name → index table.
//!
//! This is deliberately thin: the core only needs to turn a register name
//! into the `(class, index 0..31)` pair the encoder's builders consume, and
//! to render that pair back for diagnostics. Full operand-syntax rendering
//! (AT&T/Intel disassembly) belongs to the disassembler wrappers, which are
//! out of scope.

use std::fmt;

/// The register file a name belongs to. Each file has its own `0..31` index
/// space (most use far fewer; `Xmm`/`Ymm`/`Zmm` use the full range).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RegisterClass {
    Gpr8,
    Gpr16,
    Gpr32,
    Gpr64,
    Segment,
    Control,
    Debug,
    X87Stack,
    Xmm,
    Ymm,
    Zmm,
}

/// A resolved register: which file it belongs to, and its index within that
/// file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Register {
    pub class: RegisterClass,
    pub index: u8,
}

impl Register {
    pub const fn new(class: RegisterClass, index: u8) -> Self {
        Register { class, index }
    }
}

const GPR64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];
const GPR32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];
const GPR16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];
const GPR8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];
const GPR8_LEGACY_HIGH: [&str; 4] = ["ah", "ch", "dh", "bh"];
const SEGMENT: [&str; 6] = ["es", "cs", "ss", "ds", "fs", "gs"];

/// CR1 and CR5..CR7 are architecturally reserved (accessing them faults);
/// CR9..CR15 are reserved alongside them, leaving CR0, CR2..CR4, and CR8 as
/// the only addressable control registers.
const fn is_valid_control_register_index(index: u8) -> bool {
    matches!(index, 0 | 2 | 3 | 4 | 8)
}

/// Looks up a canonical x86-64 register name, returning its file and index.
/// Returns `None` for anything not recognized, including legacy 8-bit high
/// registers when a REX prefix would make them ambiguous with the
/// `spl`/`bpl`/`sil`/`dil` bank (callers resolve that ambiguity before
/// calling in).
pub fn resolve(name: &str) -> Option<Register> {
    let lower = name.to_ascii_lowercase();
    let name = lower.as_str();

    if let Some(index) = GPR64.iter().position(|&n| n == name) {
        return Some(Register::new(RegisterClass::Gpr64, index as u8));
    }
    if let Some(index) = GPR32.iter().position(|&n| n == name) {
        return Some(Register::new(RegisterClass::Gpr32, index as u8));
    }
    if let Some(index) = GPR16.iter().position(|&n| n == name) {
        return Some(Register::new(RegisterClass::Gpr16, index as u8));
    }
    if let Some(index) = GPR8.iter().position(|&n| n == name) {
        return Some(Register::new(RegisterClass::Gpr8, index as u8));
    }
    if let Some(index) = GPR8_LEGACY_HIGH.iter().position(|&n| n == name) {
        // AH/CH/DH/BH occupy indices 4..7 of the same 8-bit file as
        // SPL/BPL/SIL/DIL; a REX prefix picks between the two banks.
        return Some(Register::new(RegisterClass::Gpr8, 4 + index as u8));
    }
    if let Some(index) = SEGMENT.iter().position(|&n| n == name) {
        return Some(Register::new(RegisterClass::Segment, index as u8));
    }
    if let Some(index) = name.strip_prefix("cr").and_then(|s| s.parse::<u8>().ok()) {
        if is_valid_control_register_index(index) {
            return Some(Register::new(RegisterClass::Control, index));
        }
    }
    if let Some(index) = name.strip_prefix("dr").and_then(|s| s.parse::<u8>().ok()) {
        if index <= 7 {
            return Some(Register::new(RegisterClass::Debug, index));
        }
    }
    if let Some(index) = name.strip_prefix("st").and_then(|s| s.parse::<u8>().ok()) {
        if index <= 7 {
            return Some(Register::new(RegisterClass::X87Stack, index));
        }
    }
    if let Some(index) = name.strip_prefix("xmm").and_then(|s| s.parse::<u8>().ok()) {
        if index <= 31 {
            return Some(Register::new(RegisterClass::Xmm, index));
        }
    }
    if let Some(index) = name.strip_prefix("ymm").and_then(|s| s.parse::<u8>().ok()) {
        if index <= 31 {
            return Some(Register::new(RegisterClass::Ymm, index));
        }
    }
    if let Some(index) = name.strip_prefix("zmm").and_then(|s| s.parse::<u8>().ok()) {
        if index <= 31 {
            return Some(Register::new(RegisterClass::Zmm, index));
        }
    }
    None
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.index as usize;
        match self.class {
            RegisterClass::Gpr64 => write!(f, "{}", GPR64[index]),
            RegisterClass::Gpr32 => write!(f, "{}", GPR32[index]),
            RegisterClass::Gpr16 => write!(f, "{}", GPR16[index]),
            RegisterClass::Gpr8 if index < 4 => write!(f, "{}", GPR8[index]),
            RegisterClass::Gpr8 if index < 8 => write!(f, "{}", GPR8_LEGACY_HIGH[index - 4]),
            RegisterClass::Gpr8 => write!(f, "{}", GPR8[index]),
            RegisterClass::Segment => write!(f, "{}", SEGMENT[index]),
            RegisterClass::Control => write!(f, "cr{index}"),
            RegisterClass::Debug => write!(f, "dr{index}"),
            RegisterClass::X87Stack => write!(f, "st{index}"),
            RegisterClass::Xmm => write!(f, "xmm{index}"),
            RegisterClass::Ymm => write!(f, "ymm{index}"),
            RegisterClass::Zmm => write!(f, "zmm{index}"),
        }
    }
}
