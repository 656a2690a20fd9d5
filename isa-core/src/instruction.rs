//! The instruction specification type: one value per ISA entry, as
//! stored in the [`crate::database::InstructionDatabase`].

use crate::error::{Error, Result};
use crate::opcode::Opcode;

/// Where (if anywhere) a register operand is packed into the low three bits
/// of the opcode byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperandInOpcode {
    None,
    GeneralPurposeRegister,
    FloatingPointStackRegister,
}

/// How the ModR/M byte (if any) is used by this instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ModrmUsage {
    None,
    /// ModR/M.reg selects a second operand.
    Full,
    /// ModR/M.reg is a fixed 3-bit opcode extension, not an operand.
    OpcodeExtension(u8),
}

/// A tri-valued legacy-prefix requirement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriState {
    Required,
    NotPermitted,
    Ignored,
}

/// The one mandatory legacy prefix a lock/rep requirement may be bound to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockOrRepPrefix {
    Lock,
    Rep,
    RepNe,
}

impl LockOrRepPrefix {
    pub const fn byte(self) -> u8 {
        match self {
            LockOrRepPrefix::Lock => 0xF0,
            LockOrRepPrefix::RepNe => 0xF2,
            LockOrRepPrefix::Rep => 0xF3,
        }
    }
}

/// The legacy-prefix half of [`PrefixEncoding`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LegacyPrefixEncoding {
    pub rex_w: TriState,
    pub operand_size_override: TriState,
    pub address_size_override: TriState,
    pub lock_or_rep: TriState,
    /// Present iff `lock_or_rep == Required`: which of the three mandatory
    /// legacy prefixes is required.
    pub mandatory_lock_or_rep: Option<LockOrRepPrefix>,
}

impl Default for LegacyPrefixEncoding {
    fn default() -> Self {
        LegacyPrefixEncoding {
            rex_w: TriState::Ignored,
            operand_size_override: TriState::Ignored,
            address_size_override: TriState::Ignored,
            lock_or_rep: TriState::NotPermitted,
            mandatory_lock_or_rep: None,
        }
    }
}

/// VEX or EVEX.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PrefixKind {
    Vex,
    Evex,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VectorLength {
    Bits128,
    Bits256,
    Bits512,
    /// The vector-length bit must be zero (VEX.L = 0, scalar or 128-bit).
    BitIsZero,
    Ignored,
}

/// The VEX.pp / EVEX.pp mandatory-prefix field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MandatoryPrefix {
    None,
    OperandSizeOverride66,
    RepF3,
    RepNeF2,
}

impl MandatoryPrefix {
    pub const fn pp_bits(self) -> u32 {
        match self {
            MandatoryPrefix::None => 0b00,
            MandatoryPrefix::OperandSizeOverride66 => 0b01,
            MandatoryPrefix::RepF3 => 0b10,
            MandatoryPrefix::RepNeF2 => 0b11,
        }
    }

    pub const fn from_pp_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => MandatoryPrefix::None,
            0b01 => MandatoryPrefix::OperandSizeOverride66,
            0b10 => MandatoryPrefix::RepF3,
            _ => MandatoryPrefix::RepNeF2,
        }
    }
}

/// The W-bit requirement a VEX/EVEX specification places on an instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WSpec {
    Zero,
    One,
    Ignored,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpcodeMap {
    Map0F,
    Map0F38,
    Map0F3A,
}

impl OpcodeMap {
    pub const fn map_select_bits(self) -> u32 {
        match self {
            OpcodeMap::Map0F => 1,
            OpcodeMap::Map0F38 => 2,
            OpcodeMap::Map0F3A => 3,
        }
    }

    /// The synthetic high byte OR-ed into the opcode value the parser and
    /// encoder treat VEX/EVEX opcodes as carrying.
    pub const fn synthetic_prefix(self) -> u32 {
        match self {
            OpcodeMap::Map0F => 0x0f00,
            OpcodeMap::Map0F38 => 0x0f3800,
            OpcodeMap::Map0F3A => 0x0f3a00,
        }
    }
}

/// Which VEX operand role (if any) this instruction binds to VEX.vvvv.
/// A role label ("operand encoded in VEX.v"), not a source ordering.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VexOperandUsage {
    None,
    Destination,
    FirstSource,
    SecondSource,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EvexBInterpretation {
    Broadcast32,
    Broadcast64,
    StaticRounding,
    SuppressAllExceptions,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpmaskUsage {
    None,
    Optional,
    Required,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MaskingOperation {
    MergingOnly,
    MergingAndZeroing,
}

/// The VEX/EVEX half of [`PrefixEncoding`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VexEvexEncoding {
    pub kind: PrefixKind,
    pub vector_length: VectorLength,
    pub mandatory_prefix: MandatoryPrefix,
    pub map: OpcodeMap,
    pub w: WSpec,
    pub operand_usage: VexOperandUsage,
    pub has_vex_immediate_suffix: bool,
    /// Ordered list of interpretations this specification permits for
    /// EVEX.b. Empty for plain VEX.
    pub evex_b_interpretations: Vec<EvexBInterpretation>,
    pub opmask_usage: OpmaskUsage,
    pub masking_operation: MaskingOperation,
}

/// Exactly one of the two prefix families a specification may declare
///.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixEncoding {
    Legacy(LegacyPrefixEncoding),
    VexEvex(VexEvexEncoding),
}

/// One entry of the instruction database: everything needed to validate and
/// encode/decode a concrete instance of this instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionSpecification {
    pub opcode: Opcode,
    pub operand_in_opcode: OperandInOpcode,
    pub modrm_usage: ModrmUsage,
    pub prefix_encoding: PrefixEncoding,
    /// Ordered immediate sizes in bytes, each 1, 2, 4 or 8.
    pub immediate_value_bytes: Vec<u8>,
    pub code_offset_bytes: u8,
    /// The disassembler mnemonic this specification is indexed under in
    /// [`crate::database::InstructionDatabase::by_mnemonic`].
    pub llvm_mnemonic: String,
    /// The raw textual encoding specification (e.g. `"VEX.DDS.LIG.66.0F38.W0 9F /r"`)
    /// this specification is indexed under in
    /// [`crate::database::InstructionDatabase::by_raw_spec`].
    pub raw_encoding_specification: String,
}

impl InstructionSpecification {
    /// Checks the structural invariants a valid specification must satisfy.
    /// Called by the database when an entry is inserted; also usable
    /// standalone by tests building specifications by hand.
    pub fn validate(&self) -> Result<()> {
        if self.operand_in_opcode != OperandInOpcode::None && (self.opcode.value() & 0b111) != 0 {
            return Err(Error::invalid_argument(
                "operand_in_opcode is set but the opcode's low three bits are nonzero",
            ));
        }
        if let ModrmUsage::OpcodeExtension(extension) = self.modrm_usage {
            if extension > 7 {
                return Err(Error::invalid_argument(format!(
                    "opcode-extension-in-modrm extension {extension} is out of range 0..7"
                )));
            }
        }
        for &size in &self.immediate_value_bytes {
            if ![1, 2, 4, 8].contains(&size) {
                return Err(Error::invalid_argument(format!(
                    "immediate size {size} is not one of 1, 2, 4, 8"
                )));
            }
        }
        if ![0, 1, 2, 4].contains(&self.code_offset_bytes) {
            return Err(Error::invalid_argument(format!(
                "code_offset_bytes {} is not one of 0, 1, 2, 4",
                self.code_offset_bytes
            )));
        }
        Ok(())
    }
}
