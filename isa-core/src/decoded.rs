//! The decoded-instruction model and the operand-setting builder
//! helpers that construct one in place.

use crate::error::{Error, Result};
use crate::instruction::{
    InstructionSpecification, LockOrRepPrefix, MandatoryPrefix, ModrmUsage, OpcodeMap,
    OperandInOpcode, PrefixEncoding, VexOperandUsage,
};
use crate::opcode::Opcode;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SegmentOverride {
    None,
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
}

impl SegmentOverride {
    pub const fn byte(self) -> Option<u8> {
        match self {
            SegmentOverride::None => None,
            SegmentOverride::Es => Some(0x26),
            SegmentOverride::Cs => Some(0x2e),
            SegmentOverride::Ss => Some(0x36),
            SegmentOverride::Ds => Some(0x3e),
            SegmentOverride::Fs => Some(0x64),
            SegmentOverride::Gs => Some(0x65),
        }
    }
}

/// The 2-bit ModR/M addressing mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressingMode {
    Indirect,
    IndirectDisp8,
    IndirectDisp32,
    Direct,
}

impl AddressingMode {
    pub const fn bits(self) -> u32 {
        match self {
            AddressingMode::Indirect => 0b00,
            AddressingMode::IndirectDisp8 => 0b01,
            AddressingMode::IndirectDisp32 => 0b10,
            AddressingMode::Direct => 0b11,
        }
    }

    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => AddressingMode::Indirect,
            0b01 => AddressingMode::IndirectDisp8,
            0b10 => AddressingMode::IndirectDisp32,
            _ => AddressingMode::Direct,
        }
    }
}

/// The ModR/M byte plus the signed displacement it may carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ModRm {
    pub mode: AddressingMode,
    pub reg: u8,
    pub rm: u8,
    pub displacement: i32,
}

impl ModRm {
    pub const fn byte(self) -> u8 {
        ((self.mode.bits() as u8) << 6) | ((self.reg & 0b111) << 3) | (self.rm & 0b111)
    }

    /// `true` iff this ModR/M demands a following SIB byte.
    pub const fn requires_sib(self) -> bool {
        !matches!(self.mode, AddressingMode::Direct) && (self.rm & 0b111) == 0b100
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Sib {
    pub scale: u8,
    pub index: u8,
    pub base: u8,
}

impl Sib {
    pub const fn byte(self) -> u8 {
        ((self.scale & 0b11) << 6) | ((self.index & 0b111) << 3) | (self.base & 0b111)
    }
}

/// Decoded REX + mandatory-legacy-prefix state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct LegacyPrefixBlock {
    pub rex_w: bool,
    pub rex_r: bool,
    pub rex_x: bool,
    pub rex_b: bool,
    pub operand_size_override: bool,
    pub lock_or_rep: Option<LockOrRepPrefix>,
}

/// Decoded VEX prefix state. All register-operand bits
/// are stored *inverted*, matching the wire encoding; a fresh instance has
/// them set to the canonical "all ones" / no-operand value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VexPrefixBlock {
    pub not_r: bool,
    pub not_x: bool,
    pub not_b: bool,
    /// 4-bit inverted VEX.vvvv register operand.
    pub inverted_register_operand: u8,
    pub w: bool,
    pub use_256_bit_vector_length: bool,
    pub mandatory_prefix: MandatoryPrefix,
    pub map: OpcodeMap,
    pub suffix: Option<u8>,
}

/// Decoded EVEX prefix state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EvexPrefixBlock {
    /// Two inverted high bits of ModR/M.reg extension: `not_r[0]` is EVEX
    /// byte 1 bit 7, `not_r[1]` is byte 1 bit 4.
    pub not_r: [bool; 2],
    pub not_x: bool,
    pub not_b: bool,
    /// 5-bit inverted register operand (EVEX.vvvv plus EVEX.v').
    pub inverted_register_operand: u8,
    pub w: bool,
    /// 2-bit vector-length-or-rounding field (EVEX.L'L).
    pub vector_length_or_rounding: u8,
    pub broadcast_or_control: bool,
    pub zeroing: bool,
    /// 3-bit opmask register.
    pub opmask_register: u8,
    pub map: OpcodeMap,
    pub mandatory_prefix: MandatoryPrefix,
}

/// Exactly one of the three prefix families, tagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixBlock {
    Legacy(LegacyPrefixBlock),
    Vex(VexPrefixBlock),
    Evex(EvexPrefixBlock),
}

/// A concrete, fully value-typed instance of an x86-64 instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub segment_override: SegmentOverride,
    pub address_size_override: bool,
    pub prefix: PrefixBlock,
    pub opcode: Opcode,
    pub modrm: Option<ModRm>,
    pub sib: Option<Sib>,
    /// Ordered immediate-value byte strings, little-endian, matching the
    /// specification's `immediate_value_bytes` sizes in order.
    pub immediates: Vec<Vec<u8>>,
    pub code_offset: Option<Vec<u8>>,
}

impl DecodedInstruction {
    /// Derives the base decoded instruction for `spec`: inverted register
    /// bits start set (all-ones/no-operand), mandatory legacy prefixes
    /// materialize, and the ModR/M opcode-extension field (if any) is
    /// pre-filled.
    pub fn from_specification(spec: &InstructionSpecification) -> Self {
        let modrm = match spec.modrm_usage {
            ModrmUsage::None => None,
            ModrmUsage::Full => Some(ModRm { mode: AddressingMode::Direct, reg: 0, rm: 0, displacement: 0 }),
            ModrmUsage::OpcodeExtension(extension) => {
                Some(ModRm { mode: AddressingMode::Direct, reg: extension, rm: 0, displacement: 0 })
            }
        };
        let prefix = match &spec.prefix_encoding {
            PrefixEncoding::Legacy(legacy) => PrefixBlock::Legacy(LegacyPrefixBlock {
                rex_w: false,
                rex_r: false,
                rex_x: false,
                rex_b: false,
                operand_size_override: false,
                lock_or_rep: legacy.mandatory_lock_or_rep,
            }),
            PrefixEncoding::VexEvex(vex_evex) => match vex_evex.kind {
                crate::instruction::PrefixKind::Vex => PrefixBlock::Vex(VexPrefixBlock {
                    not_r: true,
                    not_x: true,
                    not_b: true,
                    inverted_register_operand: 0b1111,
                    w: false,
                    use_256_bit_vector_length: false,
                    mandatory_prefix: vex_evex.mandatory_prefix,
                    map: vex_evex.map,
                    suffix: if vex_evex.has_vex_immediate_suffix { Some(0) } else { None },
                }),
                crate::instruction::PrefixKind::Evex => PrefixBlock::Evex(EvexPrefixBlock {
                    not_r: [true, true],
                    not_x: true,
                    not_b: true,
                    inverted_register_operand: 0b11111,
                    w: false,
                    vector_length_or_rounding: 0,
                    broadcast_or_control: false,
                    zeroing: false,
                    opmask_register: 0,
                    map: vex_evex.map,
                    mandatory_prefix: vex_evex.mandatory_prefix,
                }),
            },
        };
        DecodedInstruction {
            segment_override: SegmentOverride::None,
            address_size_override: false,
            prefix,
            opcode: spec.opcode,
            modrm,
            sib: None,
            immediates: Vec::new(),
            code_offset: None,
        }
    }

    fn modrm_mut(&mut self) -> Result<&mut ModRm> {
        self.modrm
            .as_mut()
            .ok_or_else(|| Error::invalid_argument("instruction has no ModR/M byte to set an operand into"))
    }

    /// Sets a register operand by its `0..31` index, choosing among
    /// ModR/M.reg, ModR/M.rm, VEX.v, the VEX suffix, or "in opcode" based on
    /// `spec`'s operand-encoding attributes. `is_destination_slot`
    /// selects ModR/M.reg (`true`) vs ModR/M.rm (`false`) when the operand is
    /// register-direct and the specification uses plain ModR/M (not VEX.v).
    pub fn set_register_operand(
        &mut self,
        spec: &InstructionSpecification,
        index: u8,
        is_destination_slot: bool,
    ) -> Result<()> {
        if index > 31 {
            return Err(Error::invalid_argument(format!("register index {index} is out of range 0..31")));
        }
        if let PrefixEncoding::VexEvex(vex_evex) = &spec.prefix_encoding {
            if vex_evex.operand_usage != VexOperandUsage::None && !is_destination_slot {
                return self.set_vex_register_operand(index);
            }
        }
        if spec.operand_in_opcode != OperandInOpcode::None {
            if index > 15 {
                return Err(Error::invalid_argument("opcode-embedded register index must fit in 0..15"));
            }
            self.opcode = Opcode::new((self.opcode.value() & !0b111) | (index as u32 & 0b111));
            self.set_extension_bit_b(index >= 8);
            return Ok(());
        }
        let is_evex = matches!(&spec.prefix_encoding, PrefixEncoding::VexEvex(v) if v.kind == crate::instruction::PrefixKind::Evex);
        if index > 15 && !is_evex {
            return Err(Error::invalid_argument(format!(
                "register index {index} needs EVEX's 5-bit extension, unavailable on this encoding"
            )));
        }
        let modrm = self.modrm_mut()?;
        if is_destination_slot {
            modrm.reg = index & 0b111;
            self.set_extension_bit_r(index);
        } else {
            modrm.mode = AddressingMode::Direct;
            modrm.rm = index & 0b111;
            self.set_extension_bit_b(index >= 8);
            if is_evex {
                // EVEX reuses the X bit as rm's B' extension when ModR/M.mod
                // is direct, giving register-direct operands the same 5-bit
                // range as ModR/M.reg.
                self.set_extension_bit_x(index >= 16);
            }
        }
        Ok(())
    }

    fn set_vex_register_operand(&mut self, index: u8) -> Result<()> {
        match &mut self.prefix {
            PrefixBlock::Vex(vex) => {
                if index > 15 {
                    return Err(Error::invalid_argument("VEX.v register index must fit in 0..15"));
                }
                vex.inverted_register_operand = !index & 0b1111;
                Ok(())
            }
            PrefixBlock::Evex(evex) => {
                evex.inverted_register_operand = !index & 0b11111;
                Ok(())
            }
            PrefixBlock::Legacy(_) => Err(Error::invalid_argument("no VEX/EVEX register operand on a legacy instruction")),
        }
    }

    /// Sets the ModR/M.reg extension bit(s) for `index`. Legacy and VEX carry
    /// a single extension bit (REX.R / VEX.~R) and only ever see `index <
    /// 16`; EVEX carries two (`not_r[0]`, `not_r[1]`), giving ModR/M.reg the
    /// full 5-bit range EVEX allows.
    fn set_extension_bit_r(&mut self, index: u8) {
        match &mut self.prefix {
            PrefixBlock::Legacy(legacy) => legacy.rex_r = index >= 8,
            PrefixBlock::Vex(vex) => vex.not_r = index < 8,
            PrefixBlock::Evex(evex) => {
                evex.not_r[0] = index < 8;
                evex.not_r[1] = index < 16;
            }
        }
    }

    fn set_extension_bit_b(&mut self, set: bool) {
        match &mut self.prefix {
            PrefixBlock::Legacy(legacy) => legacy.rex_b = set,
            PrefixBlock::Vex(vex) => vex.not_b = !set,
            PrefixBlock::Evex(evex) => evex.not_b = !set,
        }
    }

    fn set_extension_bit_x(&mut self, set: bool) {
        match &mut self.prefix {
            PrefixBlock::Legacy(legacy) => legacy.rex_x = set,
            PrefixBlock::Vex(vex) => vex.not_x = !set,
            PrefixBlock::Evex(evex) => evex.not_x = !set,
        }
    }

    /// Set operand to memory absolute: ModR/M=INDIRECT, rm=4, SIB
    /// base=5/index=4/scale=0, 32-bit displacement.
    pub fn set_memory_absolute_operand(&mut self, address: i32) -> Result<()> {
        let modrm = self.modrm_mut()?;
        modrm.mode = AddressingMode::Indirect;
        modrm.rm = 0b100;
        modrm.displacement = address;
        self.sib = Some(Sib { scale: 0, index: 0b100, base: 0b101 });
        Ok(())
    }

    /// Set operand to memory `[base]`. `base` excludes 4, 5, 12, 13 (SIB
    /// escape / RIP-relative).
    pub fn set_memory_base_operand(&mut self, base: u8) -> Result<()> {
        let low3 = base & 0b111;
        if base > 15 || [4, 5, 12, 13].contains(&base) {
            return Err(Error::invalid_argument(format!(
                "base register {base} cannot be used without SIB or RIP-relative addressing"
            )));
        }
        let modrm = self.modrm_mut()?;
        modrm.mode = AddressingMode::Indirect;
        modrm.rm = low3;
        self.sib = None;
        self.set_extension_bit_b(base >= 8);
        Ok(())
    }

    /// Set operand to memory `[base]` via SIB. `base` excludes 5, 13; the
    /// ModR/M.rm and SIB.index fields are fixed to 4.
    pub fn set_memory_base_sib_operand(&mut self, base: u8, index: Option<u8>, scale: u8) -> Result<()> {
        if base > 15 || [5, 13].contains(&base) {
            return Err(Error::invalid_argument(format!(
                "base register {base} requires RIP-relative or disp32 SIB-base-5 addressing"
            )));
        }
        if scale > 0b11 {
            return Err(Error::invalid_argument(format!("SIB scale {scale} does not fit in two bits")));
        }
        let (sib_index, has_index) = match index {
            Some(index) if index <= 15 && index != 4 => (index & 0b111, true),
            Some(index) if index == 4 => {
                return Err(Error::invalid_argument("index register 4 (esp/rsp) cannot be used as a SIB index"))
            }
            Some(index) => return Err(Error::invalid_argument(format!("index register {index} is out of range 0..15"))),
            None => (0b100, false),
        };
        let modrm = self.modrm_mut()?;
        modrm.mode = AddressingMode::Indirect;
        modrm.rm = 0b100;
        self.sib = Some(Sib { scale, index: sib_index, base: base & 0b111 });
        self.set_extension_bit_b(base >= 8);
        if has_index {
            self.set_extension_bit_x(index.unwrap() >= 8);
        }
        Ok(())
    }

    /// Set operand to memory `[RIP + disp32]`.
    pub fn set_memory_rip_relative_operand(&mut self, displacement: i32) -> Result<()> {
        let modrm = self.modrm_mut()?;
        modrm.mode = AddressingMode::Indirect;
        modrm.rm = 0b101;
        modrm.displacement = displacement;
        self.sib = None;
        Ok(())
    }

    /// Set operand to memory `[base + disp8|disp32]`. `base` excludes 4, 12;
    /// the displacement width is chosen by whether it fits signed 8 bits,
    /// and is rendered with wrap-around, never clamped.
    pub fn set_memory_base_displacement_operand(&mut self, base: u8, displacement: i32) -> Result<()> {
        if base > 15 || [4, 12].contains(&base) {
            return Err(Error::invalid_argument(format!(
                "base register {base} requires SIB addressing to carry a displacement"
            )));
        }
        let modrm = self.modrm_mut()?;
        modrm.mode = if (-128..=127).contains(&displacement) {
            AddressingMode::IndirectDisp8
        } else {
            AddressingMode::IndirectDisp32
        };
        modrm.rm = base & 0b111;
        modrm.displacement = displacement;
        self.sib = None;
        self.set_extension_bit_b(base >= 8);
        Ok(())
    }
}
