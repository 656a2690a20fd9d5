//! The encoding direction of C4: validates a [`DecodedInstruction`]
//! against its [`InstructionSpecification`], then emits bytes.

use crate::decoded::{AddressingMode, DecodedInstruction, ModRm, PrefixBlock, Sib};
use crate::error::{Error, Result};
use crate::instruction::{
    EvexBInterpretation, InstructionSpecification, LockOrRepPrefix, MaskingOperation, ModrmUsage,
    OpmaskUsage, OperandInOpcode, PrefixEncoding, PrefixKind, TriState, VectorLength,
    VexOperandUsage, WSpec,
};

/// Given a specification and a decoded instruction, produces the byte
/// stream, or the first validation failure.
pub fn encode(spec: &InstructionSpecification, decoded: &DecodedInstruction) -> Result<Vec<u8>> {
    validate(spec, decoded)?;
    Ok(emit(decoded))
}

fn validate(spec: &InstructionSpecification, decoded: &DecodedInstruction) -> Result<()> {
    match (&spec.prefix_encoding, &decoded.prefix) {
        (PrefixEncoding::Legacy(legacy_spec), PrefixBlock::Legacy(legacy)) => {
            validate_tri_state(legacy_spec.rex_w, legacy.rex_w, "REX.W")?;
            validate_tri_state(legacy_spec.operand_size_override, legacy.operand_size_override, "operand-size override")?;
            validate_tri_state(legacy_spec.address_size_override, decoded.address_size_override, "address-size override")?;
            validate_lock_or_rep(legacy_spec.lock_or_rep, legacy_spec.mandatory_lock_or_rep, legacy.lock_or_rep)?;
        }
        (PrefixEncoding::VexEvex(vex_evex), PrefixBlock::Vex(vex)) if vex_evex.kind == PrefixKind::Vex => {
            validate_vector_length(vex_evex.vector_length, vex.use_256_bit_vector_length, false)?;
            validate_w(vex_evex.w, vex.w)?;
            if vex.mandatory_prefix != vex_evex.mandatory_prefix {
                return Err(Error::invalid_argument("mandatory prefix does not match specification"));
            }
            if vex.map != vex_evex.map {
                return Err(Error::invalid_argument("opcode map does not match specification"));
            }
            if vex_evex.operand_usage == VexOperandUsage::None && vex.inverted_register_operand != 0b1111 {
                return Err(Error::invalid_argument(
                    "specification uses no VEX register operand but inverted_register_operand is not all-ones",
                ));
            }
            if vex.suffix.is_some() != vex_evex.has_vex_immediate_suffix {
                return Err(Error::invalid_argument("VEX suffix presence does not match specification"));
            }
        }
        (PrefixEncoding::VexEvex(vex_evex), PrefixBlock::Evex(evex)) if vex_evex.kind == PrefixKind::Evex => {
            validate_vector_length(vex_evex.vector_length, evex.vector_length_or_rounding == 0b01, true)?;
            validate_w(vex_evex.w, evex.w)?;
            if evex.mandatory_prefix != vex_evex.mandatory_prefix {
                return Err(Error::invalid_argument("mandatory prefix does not match specification"));
            }
            if evex.map != vex_evex.map {
                return Err(Error::invalid_argument("opcode map does not match specification"));
            }
            if vex_evex.operand_usage == VexOperandUsage::None && evex.inverted_register_operand != 0b11111 {
                return Err(Error::invalid_argument(
                    "specification uses no VEX register operand but inverted_register_operand is not all-ones",
                ));
            }
            let is_direct = decoded.modrm.map(|m| m.mode == AddressingMode::Direct).unwrap_or(true);
            validate_evex_b(&vex_evex.evex_b_interpretations, evex.broadcast_or_control, is_direct)?;
            validate_evex_opmask(
                vex_evex.opmask_usage,
                vex_evex.masking_operation,
                evex.opmask_register,
                evex.zeroing,
            )?;
        }
        _ => return Err(Error::invalid_argument("prefix kind does not match specification")),
    }

    validate_opcode(spec, decoded)?;

    let has_modrm = decoded.modrm.is_some();
    if has_modrm != (spec.modrm_usage != ModrmUsage::None) {
        return Err(Error::invalid_argument("ModR/M presence does not match specification"));
    }
    if let (ModrmUsage::OpcodeExtension(extension), Some(modrm)) = (spec.modrm_usage, decoded.modrm) {
        if modrm.reg != extension {
            return Err(Error::invalid_argument("ModR/M.reg does not match the specification's opcode extension"));
        }
    }
    if let Some(modrm) = decoded.modrm {
        if decoded.sib.is_some() != modrm.requires_sib() {
            return Err(Error::invalid_argument("SIB presence does not match (mode, rm)"));
        }
    } else if decoded.sib.is_some() {
        return Err(Error::invalid_argument("SIB present without a ModR/M byte"));
    }

    if decoded.immediates.len() != spec.immediate_value_bytes.len() {
        return Err(Error::invalid_argument("immediate count does not match specification"));
    }
    for (immediate, &expected_size) in decoded.immediates.iter().zip(&spec.immediate_value_bytes) {
        if immediate.len() != expected_size as usize {
            return Err(Error::invalid_argument(format!(
                "immediate has {} bytes, specification requires {expected_size}",
                immediate.len()
            )));
        }
    }

    let code_offset_len = decoded.code_offset.as_ref().map(Vec::len).unwrap_or(0);
    if code_offset_len != spec.code_offset_bytes as usize {
        return Err(Error::invalid_argument(format!(
            "code offset has {code_offset_len} bytes, specification requires {}",
            spec.code_offset_bytes
        )));
    }

    Ok(())
}

fn validate_tri_state(requirement: TriState, present: bool, name: &str) -> Result<()> {
    match requirement {
        TriState::Required if !present => Err(Error::invalid_argument(format!("{name} is required but absent"))),
        TriState::NotPermitted if present => Err(Error::invalid_argument(format!("{name} is present but not permitted"))),
        _ => Ok(()),
    }
}

fn validate_lock_or_rep(
    requirement: TriState,
    mandatory: Option<LockOrRepPrefix>,
    present: Option<LockOrRepPrefix>,
) -> Result<()> {
    match requirement {
        TriState::Required => {
            if present != mandatory {
                Err(Error::invalid_argument("required mandatory lock/rep prefix is absent or wrong"))
            } else {
                Ok(())
            }
        }
        TriState::NotPermitted if present.is_some() => {
            Err(Error::invalid_argument("lock/rep prefix present but not permitted"))
        }
        _ => Ok(()),
    }
}

fn validate_vector_length(requirement: VectorLength, is_256_or_wider: bool, is_evex: bool) -> Result<()> {
    match requirement {
        VectorLength::Bits128 | VectorLength::BitIsZero => {
            if is_256_or_wider {
                Err(Error::invalid_argument("vector length must be 128-bit (L=0) per specification"))
            } else {
                Ok(())
            }
        }
        VectorLength::Bits256 => {
            if is_256_or_wider {
                Ok(())
            } else {
                Err(Error::invalid_argument("vector length must be 256-bit per specification"))
            }
        }
        VectorLength::Bits512 => {
            if !is_evex {
                Err(Error::invalid_argument("512-bit vector length requires EVEX"))
            } else {
                Ok(())
            }
        }
        VectorLength::Ignored => Ok(()),
    }
}

fn validate_w(requirement: WSpec, w: bool) -> Result<()> {
    match requirement {
        WSpec::Zero if w => Err(Error::invalid_argument("W must be 0 per specification")),
        WSpec::One if !w => Err(Error::invalid_argument("W must be 1 per specification")),
        _ => Ok(()),
    }
}

fn validate_evex_b(permitted: &[EvexBInterpretation], decoded_b: bool, is_direct: bool) -> Result<()> {
    if !decoded_b {
        return Ok(());
    }
    if permitted.is_empty() {
        return Err(Error::invalid_argument("EVEX.b is set but the specification permits no interpretation"));
    }
    let wants_broadcast = permitted
        .iter()
        .any(|i| matches!(i, EvexBInterpretation::Broadcast32 | EvexBInterpretation::Broadcast64));
    let wants_rounding = permitted
        .iter()
        .any(|i| matches!(i, EvexBInterpretation::StaticRounding | EvexBInterpretation::SuppressAllExceptions));
    if wants_broadcast && is_direct {
        return Err(Error::invalid_argument("EVEX.b broadcast requires a memory operand, not direct addressing"));
    }
    if wants_rounding && !is_direct {
        return Err(Error::invalid_argument(
            "EVEX.b static-rounding/suppress-all-exceptions requires direct addressing",
        ));
    }
    Ok(())
}

fn validate_evex_opmask(
    usage: OpmaskUsage,
    masking: MaskingOperation,
    opmask_register: u8,
    zeroing: bool,
) -> Result<()> {
    match usage {
        OpmaskUsage::None if opmask_register != 0 => {
            return Err(Error::invalid_argument("opmask register set but specification permits no opmask"))
        }
        OpmaskUsage::Required if opmask_register == 0 => {
            return Err(Error::invalid_argument("specification requires a nonzero opmask register"))
        }
        _ => {}
    }
    if zeroing && opmask_register == 0 {
        return Err(Error::invalid_argument("zeroing bit set without a nonzero opmask register"));
    }
    if zeroing && masking == MaskingOperation::MergingOnly {
        return Err(Error::invalid_argument("zeroing requested but specification only permits merging"));
    }
    Ok(())
}

fn validate_opcode(spec: &InstructionSpecification, decoded: &DecodedInstruction) -> Result<()> {
    if spec.operand_in_opcode != OperandInOpcode::None {
        if (spec.opcode.value() & !0b111) != (decoded.opcode.value() & !0b111) {
            return Err(Error::invalid_argument("opcode (ignoring the embedded register) does not match specification"));
        }
    } else if spec.opcode != decoded.opcode {
        return Err(Error::invalid_argument("opcode does not match specification"));
    }
    Ok(())
}

fn emit(decoded: &DecodedInstruction) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(17);

    if let Some(segment_byte) = decoded.segment_override.byte() {
        bytes.push(segment_byte);
    }
    if decoded.address_size_override {
        bytes.push(0x67);
    }

    emit_prefix(&decoded.prefix, &mut bytes);
    emit_opcode(&decoded.prefix, decoded.opcode.value(), &mut bytes);
    emit_modrm_sib_displacement(decoded.modrm, decoded.sib, &mut bytes);

    for immediate in &decoded.immediates {
        bytes.extend_from_slice(immediate);
    }
    if let Some(code_offset) = &decoded.code_offset {
        bytes.extend_from_slice(code_offset);
    }
    if let PrefixBlock::Vex(vex) = &decoded.prefix {
        if let Some(suffix) = vex.suffix {
            bytes.push(suffix);
        }
    }
    bytes
}

fn emit_prefix(prefix: &PrefixBlock, bytes: &mut Vec<u8>) {
    match prefix {
        PrefixBlock::Legacy(legacy) => {
            if let Some(lock_or_rep) = legacy.lock_or_rep {
                bytes.push(lock_or_rep.byte());
            }
            if legacy.operand_size_override {
                bytes.push(0x66);
            }
            if legacy.rex_w || legacy.rex_r || legacy.rex_x || legacy.rex_b {
                let byte = 0x40
                    | ((legacy.rex_w as u8) << 3)
                    | ((legacy.rex_r as u8) << 2)
                    | ((legacy.rex_x as u8) << 1)
                    | (legacy.rex_b as u8);
                bytes.push(byte);
            }
        }
        PrefixBlock::Vex(vex) => {
            let can_use_two_byte_form =
                vex.not_x && vex.not_b && !vex.w && vex.map == crate::instruction::OpcodeMap::Map0F;
            if can_use_two_byte_form {
                bytes.push(0xc5);
                let byte = ((vex.not_r as u8) << 7)
                    | ((vex.inverted_register_operand & 0b1111) << 3)
                    | ((vex.use_256_bit_vector_length as u8) << 2)
                    | (vex.mandatory_prefix.pp_bits() as u8);
                bytes.push(byte);
            } else {
                bytes.push(0xc4);
                let byte1 = ((vex.not_r as u8) << 7)
                    | ((vex.not_x as u8) << 6)
                    | ((vex.not_b as u8) << 5)
                    | (vex.map.map_select_bits() as u8);
                bytes.push(byte1);
                let byte2 = ((vex.w as u8) << 7)
                    | ((vex.inverted_register_operand & 0b1111) << 3)
                    | ((vex.use_256_bit_vector_length as u8) << 2)
                    | (vex.mandatory_prefix.pp_bits() as u8);
                bytes.push(byte2);
            }
        }
        PrefixBlock::Evex(evex) => {
            bytes.push(0x62);
            let byte1 = ((evex.not_r[0] as u8) << 7)
                | ((evex.not_x as u8) << 6)
                | ((evex.not_b as u8) << 5)
                | ((evex.not_r[1] as u8) << 4)
                | (evex.map.map_select_bits() as u8 & 0b11);
            bytes.push(byte1);
            let byte2 = ((evex.w as u8) << 7)
                | ((evex.inverted_register_operand & 0b1111) << 3)
                | (1 << 2)
                | (evex.mandatory_prefix.pp_bits() as u8);
            bytes.push(byte2);
            let byte3 = ((evex.zeroing as u8) << 7)
                | ((evex.vector_length_or_rounding & 0b11) << 5)
                | ((evex.broadcast_or_control as u8) << 4)
                | (((evex.inverted_register_operand >> 4) & 1) << 3)
                | (evex.opmask_register & 0b111);
            bytes.push(byte3);
        }
    }
}

fn emit_opcode(prefix: &PrefixBlock, opcode: u32, bytes: &mut Vec<u8>) {
    match prefix {
        PrefixBlock::Legacy(_) => {
            let be = opcode.to_be_bytes();
            let first_nonzero = be.iter().position(|&b| b != 0).unwrap_or(3);
            bytes.extend_from_slice(&be[first_nonzero..]);
        }
        PrefixBlock::Vex(_) | PrefixBlock::Evex(_) => {
            bytes.push((opcode & 0xff) as u8);
        }
    }
}

/// Computes the displacement width in bytes: 0 for DIRECT and
/// plain INDIRECT, except the rm=5 (RIP-relative) and SIB.base=5 corner
/// cases which force 4 bytes; 1 for INDIRECT+disp8; 4 for INDIRECT+disp32.
fn displacement_width(modrm: ModRm, sib: Option<Sib>) -> usize {
    match modrm.mode {
        AddressingMode::Direct => 0,
        AddressingMode::Indirect => {
            if modrm.rm == 0b101 {
                4
            } else if sib.map(|s| s.base == 0b101).unwrap_or(false) {
                4
            } else {
                0
            }
        }
        AddressingMode::IndirectDisp8 => 1,
        AddressingMode::IndirectDisp32 => 4,
    }
}

fn emit_modrm_sib_displacement(modrm: Option<ModRm>, sib: Option<Sib>, bytes: &mut Vec<u8>) {
    let Some(modrm) = modrm else { return };
    bytes.push(modrm.byte());
    if let Some(sib) = sib {
        bytes.push(sib.byte());
    }
    let width = displacement_width(modrm, sib);
    if width > 0 {
        let little_endian = modrm.displacement.to_le_bytes();
        bytes.extend_from_slice(&little_endian[..width]);
    }
}
