//! The decoding direction of C4: turns a byte stream into a
//! [`DecodedInstruction`] plus the database index it matched, consuming
//! prefixes, opcode, ModR/M, SIB, immediates, code offset and VEX suffix in
//! that order.

use crate::bits::nth_bit_set;
use crate::database::InstructionDatabase;
use crate::decoded::{
    AddressingMode, DecodedInstruction, EvexPrefixBlock, ModRm, PrefixBlock, SegmentOverride, Sib,
    VexPrefixBlock,
};
use crate::error::{Error, Result};
use crate::index::InstructionIndex;
use crate::instruction::{
    InstructionSpecification, LockOrRepPrefix, MandatoryPrefix, ModrmUsage, OpcodeMap,
    OperandInOpcode, PrefixEncoding, PrefixKind, TriState, VectorLength, WSpec,
};
use crate::opcode::Opcode;

/// The result of a successful [`parse`] call: which instruction matched,
/// its fully populated decoded form, and how many bytes it consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInstruction {
    pub index: InstructionIndex,
    pub decoded: DecodedInstruction,
    pub length: usize,
}

enum ConsumedPrefix {
    Legacy(crate::decoded::LegacyPrefixBlock),
    Vex(VexPrefixBlock),
    Evex(EvexPrefixBlock),
}

pub fn parse(database: &InstructionDatabase, bytes: &[u8]) -> Result<ParsedInstruction> {
    let mut pos = 0usize;
    let (segment_override, address_size_override, prefix) = consume_prefixes(bytes, &mut pos)?;
    let (opcode, candidates) = consume_opcode(database, bytes, &mut pos, &prefix)?;
    if candidates.is_empty() {
        return Err(Error::not_found(format!(
            "no instruction in the database matches opcode {opcode} under this prefix"
        )));
    }

    // Several specifications may share an opcode (e.g. opcode-extension
    // variants distinguished only by ModR/M.reg); they all drive the same byte
    // shape, so any one of them can pick the decoded instruction's base layout.
    let representative = database.instruction(candidates[0]);

    let mut decoded = DecodedInstruction::from_specification(representative);
    decoded.segment_override = segment_override;
    decoded.address_size_override = address_size_override;
    decoded.opcode = opcode;
    decoded.prefix = match prefix {
        ConsumedPrefix::Legacy(legacy) => PrefixBlock::Legacy(legacy),
        ConsumedPrefix::Vex(vex) => PrefixBlock::Vex(vex),
        ConsumedPrefix::Evex(evex) => PrefixBlock::Evex(evex),
    };

    consume_modrm_and_sib(representative, bytes, &mut pos, &mut decoded)?;

    // Re-select among candidates sharing the opcode now that ModR/M is
    // known (e.g. ModR/M.reg disambiguates opcode-extension variants).
    let index = refine_candidate(database, &candidates, &decoded);
    let spec = database.instruction(index);

    consume_immediates(spec, bytes, &mut pos, &mut decoded)?;
    consume_code_offset(spec, bytes, &mut pos, &mut decoded)?;
    consume_vex_suffix(spec, bytes, &mut pos, &mut decoded)?;

    Ok(ParsedInstruction { index, decoded, length: pos })
}

fn truncated(what: &str, offset: usize) -> Error {
    Error::invalid_argument(format!("truncated instruction stream at byte offset {offset}: expected {what}"))
}

fn next_byte(bytes: &[u8], pos: &mut usize, what: &str) -> Result<u8> {
    let byte = *bytes.get(*pos).ok_or_else(|| truncated(what, *pos))?;
    *pos += 1;
    Ok(byte)
}

/// Consumes segment/operand-size/address-size/lock-or-rep legacy prefixes,
/// then exactly one of: a REX byte, a two- or three-byte VEX escape, a
/// four-byte EVEX escape, or nothing.
fn consume_prefixes(bytes: &[u8], pos: &mut usize) -> Result<(SegmentOverride, bool, ConsumedPrefix)> {
    let mut segment_override = SegmentOverride::None;
    let mut address_size_override = false;
    let mut operand_size_override = false;
    let mut lock_or_rep = None;

    while let Some(&byte) = bytes.get(*pos) {
        let new_lock_or_rep = match byte {
            0x2e => { segment_override = SegmentOverride::Cs; None }
            0x36 => { segment_override = SegmentOverride::Ss; None }
            0x3e => { segment_override = SegmentOverride::Ds; None }
            0x26 => { segment_override = SegmentOverride::Es; None }
            0x64 => { segment_override = SegmentOverride::Fs; None }
            0x65 => { segment_override = SegmentOverride::Gs; None }
            0x66 => { operand_size_override = true; None }
            0x67 => { address_size_override = true; None }
            0xf0 => Some(LockOrRepPrefix::Lock),
            0xf2 => Some(LockOrRepPrefix::RepNe),
            0xf3 => Some(LockOrRepPrefix::Rep),
            _ => break,
        };
        if let Some(new_lock_or_rep) = new_lock_or_rep {
            if lock_or_rep.is_some() {
                return Err(Error::invalid_argument(format!(
                    "duplicate lock/rep prefix byte 0x{byte:02x} at offset {}",
                    *pos
                )));
            }
            lock_or_rep = Some(new_lock_or_rep);
        }
        *pos += 1;
    }

    let plain_legacy = |operand_size_override, lock_or_rep| {
        ConsumedPrefix::Legacy(crate::decoded::LegacyPrefixBlock {
            rex_w: false,
            rex_r: false,
            rex_x: false,
            rex_b: false,
            operand_size_override,
            lock_or_rep,
        })
    };

    let Some(&byte) = bytes.get(*pos) else {
        return Ok((segment_override, address_size_override, plain_legacy(operand_size_override, lock_or_rep)));
    };

    match byte {
        0x40..=0x4f => {
            *pos += 1;
            let rex = byte as u32;
            Ok((
                segment_override,
                address_size_override,
                ConsumedPrefix::Legacy(crate::decoded::LegacyPrefixBlock {
                    rex_w: nth_bit_set(rex, 3),
                    rex_r: nth_bit_set(rex, 2),
                    rex_x: nth_bit_set(rex, 1),
                    rex_b: nth_bit_set(rex, 0),
                    operand_size_override,
                    lock_or_rep,
                }),
            ))
        }
        // Two-byte VEX. In 64-bit mode this byte is unconditionally an escape:
        // there is no 32-bit-mode LDS ambiguity to resolve here.
        0xc5 => {
            *pos += 1;
            let b2 = next_byte(bytes, pos, "second byte of two-byte VEX prefix")?;
            Ok((
                segment_override,
                address_size_override,
                ConsumedPrefix::Vex(VexPrefixBlock {
                    not_r: nth_bit_set(b2 as u32, 7),
                    not_x: true,
                    not_b: true,
                    inverted_register_operand: (b2 >> 3) & 0b1111,
                    w: false,
                    use_256_bit_vector_length: nth_bit_set(b2 as u32, 2),
                    mandatory_prefix: MandatoryPrefix::from_pp_bits((b2 & 0b11) as u32),
                    map: OpcodeMap::Map0F,
                    suffix: None,
                }),
            ))
        }
        0xc4 => {
            *pos += 1;
            let b2 = next_byte(bytes, pos, "second byte of three-byte VEX prefix")?;
            let b3 = next_byte(bytes, pos, "third byte of three-byte VEX prefix")?;
            let map = decode_map(b2 & 0b11111)?;
            Ok((
                segment_override,
                address_size_override,
                ConsumedPrefix::Vex(VexPrefixBlock {
                    not_r: nth_bit_set(b2 as u32, 7),
                    not_x: nth_bit_set(b2 as u32, 6),
                    not_b: nth_bit_set(b2 as u32, 5),
                    inverted_register_operand: (b3 >> 3) & 0b1111,
                    w: nth_bit_set(b3 as u32, 7),
                    use_256_bit_vector_length: nth_bit_set(b3 as u32, 2),
                    mandatory_prefix: MandatoryPrefix::from_pp_bits((b3 & 0b11) as u32),
                    map,
                    suffix: None,
                }),
            ))
        }
        0x62 => {
            *pos += 1;
            let b2 = next_byte(bytes, pos, "second byte of EVEX prefix")?;
            let b3 = next_byte(bytes, pos, "third byte of EVEX prefix")?;
            let b4 = next_byte(bytes, pos, "fourth byte of EVEX prefix")?;
            if b2 & 0b1100 != 0 {
                return Err(Error::invalid_argument("EVEX prefix has non-zero reserved bits in byte 1"));
            }
            if b3 & 0b100 == 0 {
                return Err(Error::invalid_argument("EVEX prefix's reserved bit in byte 2 is not set"));
            }
            let map = decode_map(b2 & 0b11)?;
            let inverted_low4 = (b3 >> 3) & 0b1111;
            let inverted_v_prime = !nth_bit_set(b4 as u32, 3) as u8;
            Ok((
                segment_override,
                address_size_override,
                ConsumedPrefix::Evex(EvexPrefixBlock {
                    not_r: [nth_bit_set(b2 as u32, 7), nth_bit_set(b2 as u32, 4)],
                    not_x: nth_bit_set(b2 as u32, 6),
                    not_b: nth_bit_set(b2 as u32, 5),
                    inverted_register_operand: inverted_low4 | (inverted_v_prime << 4),
                    w: nth_bit_set(b3 as u32, 7),
                    vector_length_or_rounding: (b4 >> 5) & 0b11,
                    broadcast_or_control: nth_bit_set(b4 as u32, 4),
                    zeroing: nth_bit_set(b4 as u32, 7),
                    opmask_register: b4 & 0b111,
                    map,
                    mandatory_prefix: MandatoryPrefix::from_pp_bits((b3 & 0b11) as u32),
                }),
            ))
        }
        _ => Ok((segment_override, address_size_override, plain_legacy(operand_size_override, lock_or_rep))),
    }
}

fn decode_map(bits: u8) -> Result<OpcodeMap> {
    match bits {
        1 => Ok(OpcodeMap::Map0F),
        2 => Ok(OpcodeMap::Map0F38),
        3 => Ok(OpcodeMap::Map0F3A),
        other => Err(Error::invalid_argument(format!("reserved opcode map selector {other}"))),
    }
}

/// Consumes the opcode bytes. Legacy opcodes may be 1-3 bytes long: the
/// database's set of proper byte-shifted prefixes decides when to keep
/// reading. VEX/EVEX opcodes are always a single byte; the
/// escape's own map field already disambiguates the 0F/0F38/0F3A space.
fn consume_opcode(
    database: &InstructionDatabase,
    bytes: &[u8],
    pos: &mut usize,
    prefix: &ConsumedPrefix,
) -> Result<(Opcode, Vec<InstructionIndex>)> {
    match prefix {
        ConsumedPrefix::Legacy(_) => {
            let mut value = 0u32;
            loop {
                let byte = next_byte(bytes, pos, "opcode byte")?;
                value = (value << 8) | byte as u32;
                if !database.is_legacy_opcode_prefix(Opcode::new(value)) {
                    break;
                }
            }
            let opcode = Opcode::new(value);
            let exact = matching_candidates(database, opcode, prefix);
            if !exact.is_empty() {
                return Ok((opcode, exact));
            }
            // Retry with the low three bits cleared, accepting only
            // specifications that declare an operand packed into the opcode.
            let cleared = Opcode::new(value & !0b111);
            let fallback = database
                .by_opcode(cleared)
                .iter()
                .copied()
                .filter(|&index| {
                    let spec = database.instruction(index);
                    spec.operand_in_opcode != OperandInOpcode::None && prefix_matches(spec, prefix)
                })
                .collect();
            Ok((opcode, fallback))
        }
        ConsumedPrefix::Vex(_) | ConsumedPrefix::Evex(_) => {
            let byte = next_byte(bytes, pos, "VEX/EVEX opcode byte")?;
            let opcode = Opcode::new(byte as u32);
            Ok((opcode, matching_candidates(database, opcode, prefix)))
        }
    }
}

fn matching_candidates(database: &InstructionDatabase, opcode: Opcode, prefix: &ConsumedPrefix) -> Vec<InstructionIndex> {
    database
        .by_opcode(opcode)
        .iter()
        .copied()
        .filter(|&index| prefix_matches(database.instruction(index), prefix))
        .collect()
}

/// The prefix-and-opcode matching predicate (opcode identity is
/// already guaranteed by the caller having looked the candidate up by exact
/// opcode value): prefix kinds agree, every legacy tri-valued flag is
/// satisfied by what was actually consumed, and VEX/EVEX vector length, W,
/// mandatory prefix and map select all agree.
fn prefix_matches(spec: &InstructionSpecification, prefix: &ConsumedPrefix) -> bool {
    match (&spec.prefix_encoding, prefix) {
        (PrefixEncoding::Legacy(legacy_spec), ConsumedPrefix::Legacy(legacy)) => {
            tri_state_matches(legacy_spec.rex_w, legacy.rex_w)
                && tri_state_matches(legacy_spec.operand_size_override, legacy.operand_size_override)
                && lock_or_rep_matches(legacy_spec.lock_or_rep, legacy_spec.mandatory_lock_or_rep, legacy.lock_or_rep)
        }
        (PrefixEncoding::VexEvex(vex_evex), ConsumedPrefix::Vex(vex)) if vex_evex.kind == PrefixKind::Vex => {
            vex_evex.map == vex.map
                && vex_evex.mandatory_prefix == vex.mandatory_prefix
                && vector_length_matches(vex_evex.vector_length, vex.use_256_bit_vector_length, false)
                && w_matches(vex_evex.w, vex.w)
        }
        (PrefixEncoding::VexEvex(vex_evex), ConsumedPrefix::Evex(evex)) if vex_evex.kind == PrefixKind::Evex => {
            vex_evex.map == evex.map
                && vex_evex.mandatory_prefix == evex.mandatory_prefix
                && vector_length_matches(vex_evex.vector_length, evex.vector_length_or_rounding == 0b01, true)
                && w_matches(vex_evex.w, evex.w)
        }
        _ => false,
    }
}

fn tri_state_matches(requirement: TriState, present: bool) -> bool {
    match requirement {
        TriState::Required => present,
        TriState::NotPermitted => !present,
        TriState::Ignored => true,
    }
}

fn lock_or_rep_matches(requirement: TriState, mandatory: Option<LockOrRepPrefix>, present: Option<LockOrRepPrefix>) -> bool {
    match requirement {
        TriState::Required => present == mandatory,
        TriState::NotPermitted => present.is_none(),
        TriState::Ignored => true,
    }
}

fn vector_length_matches(requirement: VectorLength, is_256_or_wider: bool, is_evex: bool) -> bool {
    match requirement {
        VectorLength::Bits128 | VectorLength::BitIsZero => !is_256_or_wider,
        VectorLength::Bits256 => is_256_or_wider,
        VectorLength::Bits512 => is_evex,
        VectorLength::Ignored => true,
    }
}

fn w_matches(requirement: WSpec, w: bool) -> bool {
    match requirement {
        WSpec::Zero => !w,
        WSpec::One => w,
        WSpec::Ignored => true,
    }
}

/// Narrows `candidates` using the now-known ModR/M byte: a candidate whose
/// `modrm_usage` is an opcode extension must have its extension value equal
/// to the decoded ModR/M.reg. Candidates that don't use ModR/M as an
/// extension are left in regardless, since they have nothing to disambiguate
/// on; falls back to the first original candidate if nothing narrows.
fn refine_candidate(database: &InstructionDatabase, candidates: &[InstructionIndex], decoded: &DecodedInstruction) -> InstructionIndex {
    if candidates.len() == 1 {
        return candidates[0];
    }
    if let Some(modrm) = decoded.modrm {
        let narrowed: Vec<InstructionIndex> = candidates
            .iter()
            .copied()
            .filter(|&index| match database.instruction(index).modrm_usage {
                ModrmUsage::OpcodeExtension(extension) => modrm.reg == extension,
                _ => true,
            })
            .collect();
        if let Some(&first) = narrowed.first() {
            return first;
        }
    }
    candidates[0]
}

fn consume_modrm_and_sib(
    spec: &InstructionSpecification,
    bytes: &[u8],
    pos: &mut usize,
    decoded: &mut DecodedInstruction,
) -> Result<()> {
    if spec.modrm_usage == ModrmUsage::None {
        return Ok(());
    }
    let byte = next_byte(bytes, pos, "ModR/M byte")?;
    let mode = AddressingMode::from_bits((byte >> 6) as u32);
    let reg = (byte >> 3) & 0b111;
    let rm = byte & 0b111;
    let mut modrm = ModRm { mode, reg, rm, displacement: 0 };

    let sib = if modrm.requires_sib() {
        let sib_byte = next_byte(bytes, pos, "SIB byte")?;
        Some(Sib { scale: (sib_byte >> 6) & 0b11, index: (sib_byte >> 3) & 0b111, base: sib_byte & 0b111 })
    } else {
        None
    };

    let displacement_width = match mode {
        AddressingMode::Direct => 0,
        AddressingMode::Indirect => {
            if rm == 0b101 || sib.map(|s| s.base == 0b101).unwrap_or(false) {
                4
            } else {
                0
            }
        }
        AddressingMode::IndirectDisp8 => 1,
        AddressingMode::IndirectDisp32 => 4,
    };
    if displacement_width > 0 {
        let slice = bytes
            .get(*pos..*pos + displacement_width)
            .ok_or_else(|| truncated("displacement bytes", *pos))?;
        modrm.displacement = if displacement_width == 1 {
            (slice[0] as i8) as i32
        } else {
            let mut buf = [0u8; 4];
            buf[..displacement_width].copy_from_slice(slice);
            i32::from_le_bytes(buf)
        };
        *pos += displacement_width;
    }

    decoded.modrm = Some(modrm);
    decoded.sib = sib;
    Ok(())
}

fn consume_immediates(
    spec: &InstructionSpecification,
    bytes: &[u8],
    pos: &mut usize,
    decoded: &mut DecodedInstruction,
) -> Result<()> {
    for &size in &spec.immediate_value_bytes {
        let slice = bytes.get(*pos..*pos + size as usize).ok_or_else(|| truncated("immediate bytes", *pos))?;
        decoded.immediates.push(slice.to_vec());
        *pos += size as usize;
    }
    Ok(())
}

fn consume_code_offset(
    spec: &InstructionSpecification,
    bytes: &[u8],
    pos: &mut usize,
    decoded: &mut DecodedInstruction,
) -> Result<()> {
    if spec.code_offset_bytes == 0 {
        return Ok(());
    }
    let size = spec.code_offset_bytes as usize;
    let slice = bytes.get(*pos..*pos + size).ok_or_else(|| truncated("code offset bytes", *pos))?;
    decoded.code_offset = Some(slice.to_vec());
    *pos += size;
    Ok(())
}

fn consume_vex_suffix(
    spec: &InstructionSpecification,
    bytes: &[u8],
    pos: &mut usize,
    decoded: &mut DecodedInstruction,
) -> Result<()> {
    let PrefixEncoding::VexEvex(vex_evex) = &spec.prefix_encoding else { return Ok(()) };
    if !vex_evex.has_vex_immediate_suffix {
        return Ok(());
    }
    let byte = next_byte(bytes, pos, "VEX immediate suffix")?;
    if let PrefixBlock::Vex(vex) = &mut decoded.prefix {
        vex.suffix = Some(byte);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{
        LegacyPrefixEncoding, MaskingOperation, ModrmUsage, OpmaskUsage, OperandInOpcode, PrefixEncoding,
        VectorLength, VexEvexEncoding, VexOperandUsage, WSpec,
    };

    fn nop_spec() -> InstructionSpecification {
        InstructionSpecification {
            opcode: Opcode::new(0x90),
            operand_in_opcode: OperandInOpcode::None,
            modrm_usage: ModrmUsage::None,
            prefix_encoding: PrefixEncoding::Legacy(LegacyPrefixEncoding::default()),
            immediate_value_bytes: vec![],
            code_offset_bytes: 0,
            llvm_mnemonic: "NOP".to_string(),
            raw_encoding_specification: "NP 90".to_string(),
        }
    }

    #[test]
    fn parses_single_byte_nop() {
        let database = InstructionDatabase::build(vec![nop_spec()]);
        let parsed = parse(&database, &[0x90]).unwrap();
        assert_eq!(parsed.length, 1);
        assert_eq!(database.instruction(parsed.index).llvm_mnemonic, "NOP");
    }

    #[test]
    fn parses_two_byte_clts() {
        let clts = InstructionSpecification { opcode: Opcode::new(0x0f06), llvm_mnemonic: "CLTS".to_string(), raw_encoding_specification: "0F 06".to_string(), ..nop_spec() };
        let database = InstructionDatabase::build(vec![clts]);
        let parsed = parse(&database, &[0x0f, 0x06]).unwrap();
        assert_eq!(parsed.length, 2);
    }

    fn xchg_spec() -> InstructionSpecification {
        InstructionSpecification {
            opcode: Opcode::new(0x87),
            modrm_usage: ModrmUsage::Full,
            llvm_mnemonic: "XCHG".to_string(),
            raw_encoding_specification: "87 /r".to_string(),
            ..nop_spec()
        }
    }

    #[test]
    fn parses_sib_disp8_scenario() {
        let database = InstructionDatabase::build(vec![xchg_spec()]);
        let parsed = parse(&database, &[0x87, 0x54, 0x8e, 0x40]).unwrap();
        assert_eq!(parsed.length, 4);
        let modrm = parsed.decoded.modrm.unwrap();
        assert_eq!(modrm.mode, AddressingMode::IndirectDisp8);
        assert_eq!(modrm.displacement, 0x40);
        let sib = parsed.decoded.sib.unwrap();
        assert_eq!(sib.scale, 2);
        assert_eq!(sib.index, 1);
        assert_eq!(sib.base, 6);
    }

    #[test]
    fn parses_rip_relative_scenario() {
        let database = InstructionDatabase::build(vec![xchg_spec()]);
        let parsed = parse(&database, &[0x87, 0x15, 0xb2, 0xff, 0xff, 0xff]).unwrap();
        assert_eq!(parsed.length, 6);
        let modrm = parsed.decoded.modrm.unwrap();
        assert_eq!(modrm.mode, AddressingMode::Indirect);
        assert_eq!(modrm.rm, 0b101);
        assert_eq!(modrm.displacement, -78);
    }

    #[test]
    fn parses_three_byte_vex_scenario() {
        let spec = InstructionSpecification {
            opcode: Opcode::new(0x9f),
            modrm_usage: ModrmUsage::Full,
            prefix_encoding: PrefixEncoding::VexEvex(VexEvexEncoding {
                kind: PrefixKind::Vex,
                vector_length: VectorLength::Ignored,
                mandatory_prefix: MandatoryPrefix::OperandSizeOverride66,
                map: OpcodeMap::Map0F38,
                w: WSpec::Zero,
                operand_usage: VexOperandUsage::SecondSource,
                has_vex_immediate_suffix: false,
                evex_b_interpretations: vec![],
                opmask_usage: OpmaskUsage::None,
                masking_operation: MaskingOperation::MergingOnly,
            }),
            llvm_mnemonic: "VFNMSUB132SS".to_string(),
            raw_encoding_specification: "VEX.DDS.LIG.66.0F38.W0 9F /r".to_string(),
            ..nop_spec()
        };
        let database = InstructionDatabase::build(vec![spec]);
        let parsed = parse(&database, &[0xc4, 0xe2, 0x41, 0x9f, 0xdc]).unwrap();
        assert_eq!(parsed.length, 5);
        match parsed.decoded.prefix {
            PrefixBlock::Vex(vex) => {
                assert_eq!(vex.inverted_register_operand, 0b1000);
                assert_eq!(vex.map, OpcodeMap::Map0F38);
            }
            _ => panic!("expected a decoded VEX prefix"),
        }
    }

    #[test]
    fn parses_evex_scenario() {
        let spec = InstructionSpecification {
            opcode: Opcode::new(0xe6),
            modrm_usage: ModrmUsage::Full,
            prefix_encoding: PrefixEncoding::VexEvex(VexEvexEncoding {
                kind: PrefixKind::Evex,
                vector_length: VectorLength::Bits128,
                mandatory_prefix: MandatoryPrefix::RepF3,
                map: OpcodeMap::Map0F,
                w: WSpec::Zero,
                operand_usage: VexOperandUsage::None,
                has_vex_immediate_suffix: false,
                evex_b_interpretations: vec![],
                opmask_usage: OpmaskUsage::Optional,
                masking_operation: MaskingOperation::MergingAndZeroing,
            }),
            llvm_mnemonic: "VCVTDQ2PD".to_string(),
            raw_encoding_specification: "EVEX.128.F3.0F.W0 E6 /r".to_string(),
            ..nop_spec()
        };
        let database = InstructionDatabase::build(vec![spec]);
        let parsed = parse(&database, &[0x62, 0xf1, 0x7e, 0x89, 0xe6, 0xca]).unwrap();
        assert_eq!(parsed.length, 6);
        match parsed.decoded.prefix {
            PrefixBlock::Evex(evex) => {
                assert!(evex.zeroing);
                assert_eq!(evex.opmask_register, 1);
            }
            _ => panic!("expected a decoded EVEX prefix"),
        }
        let modrm = parsed.decoded.modrm.unwrap();
        assert_eq!(modrm.reg, 1);
        assert_eq!(modrm.rm, 2);
    }

    #[test]
    fn evex_prefix_with_cleared_reserved_bit_is_an_error() {
        let spec = InstructionSpecification {
            opcode: Opcode::new(0xe6),
            modrm_usage: ModrmUsage::Full,
            prefix_encoding: PrefixEncoding::VexEvex(VexEvexEncoding {
                kind: PrefixKind::Evex,
                vector_length: VectorLength::Bits128,
                mandatory_prefix: MandatoryPrefix::RepF3,
                map: OpcodeMap::Map0F,
                w: WSpec::Zero,
                operand_usage: VexOperandUsage::None,
                has_vex_immediate_suffix: false,
                evex_b_interpretations: vec![],
                opmask_usage: OpmaskUsage::Optional,
                masking_operation: MaskingOperation::MergingAndZeroing,
            }),
            llvm_mnemonic: "VCVTDQ2PD".to_string(),
            raw_encoding_specification: "EVEX.128.F3.0F.W0 E6 /r".to_string(),
            ..nop_spec()
        };
        let database = InstructionDatabase::build(vec![spec]);
        // Byte 2 (0x7e -> 0x7a) clears the reserved bit that must always be 1.
        assert!(parse(&database, &[0x62, 0xf1, 0x7a, 0x89, 0xe6, 0xca]).is_err());
    }

    #[test]
    fn evex_prefix_with_set_reserved_bits_is_an_error() {
        let spec = InstructionSpecification {
            opcode: Opcode::new(0xe6),
            modrm_usage: ModrmUsage::Full,
            prefix_encoding: PrefixEncoding::VexEvex(VexEvexEncoding {
                kind: PrefixKind::Evex,
                vector_length: VectorLength::Bits128,
                mandatory_prefix: MandatoryPrefix::RepF3,
                map: OpcodeMap::Map0F,
                w: WSpec::Zero,
                operand_usage: VexOperandUsage::None,
                has_vex_immediate_suffix: false,
                evex_b_interpretations: vec![],
                opmask_usage: OpmaskUsage::Optional,
                masking_operation: MaskingOperation::MergingAndZeroing,
            }),
            llvm_mnemonic: "VCVTDQ2PD".to_string(),
            raw_encoding_specification: "EVEX.128.F3.0F.W0 E6 /r".to_string(),
            ..nop_spec()
        };
        let database = InstructionDatabase::build(vec![spec]);
        // Byte 1 (0xf1 -> 0xf5) sets one of the reserved bits that must stay 0.
        assert!(parse(&database, &[0x62, 0xf5, 0x7e, 0x89, 0xe6, 0xca]).is_err());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let database = InstructionDatabase::build(vec![xchg_spec()]);
        assert!(parse(&database, &[0x87]).is_err());
    }

    #[test]
    fn duplicate_lock_or_rep_prefix_is_an_error() {
        let database = InstructionDatabase::build(vec![xchg_spec()]);
        // Two bytes from the lock/rep group (0xF0/0xF2/0xF3) before the same
        // opcode is a structural conflict, not a last-one-wins override.
        assert!(matches!(parse(&database, &[0xf0, 0xf3, 0x87]), Err(Error::InvalidArgument(_))));
    }

    fn push_r64_spec() -> InstructionSpecification {
        InstructionSpecification {
            opcode: Opcode::new(0x50),
            operand_in_opcode: OperandInOpcode::GeneralPurposeRegister,
            llvm_mnemonic: "PUSH64r".to_string(),
            raw_encoding_specification: "50+rd".to_string(),
            ..nop_spec()
        }
    }

    #[test]
    fn register_in_opcode_falls_back_to_the_cleared_opcode_lookup() {
        let database = InstructionDatabase::build(vec![push_r64_spec()]);
        // 0x53 = PUSH RBX: not itself a key in by_opcode (the database stores
        // 0x50 with the low three bits zeroed), so the parser must retry with
        // those bits cleared before it finds the specification.
        let parsed = parse(&database, &[0x53]).unwrap();
        assert_eq!(parsed.length, 1);
        assert_eq!(database.instruction(parsed.index).llvm_mnemonic, "PUSH64r");
        assert_eq!(parsed.decoded.opcode, Opcode::new(0x53));
    }

    fn plain_opcode_spec() -> InstructionSpecification {
        InstructionSpecification {
            opcode: Opcode::new(0x80),
            llvm_mnemonic: "GRP1B".to_string(),
            raw_encoding_specification: "80 /0 ib".to_string(),
            ..nop_spec()
        }
    }

    #[test]
    fn plain_opcode_without_operand_in_opcode_does_not_match_the_fallback() {
        let database = InstructionDatabase::build(vec![plain_opcode_spec()]);
        assert!(parse(&database, &[0x80]).is_ok());
        // 0x83 clears to the same base opcode 0x80, but the specification
        // declares no operand packed in the opcode, so the fallback must not
        // fire: 0x83 should fail to match anything.
        assert!(parse(&database, &[0x83]).is_err());
    }

    fn grp_extension_spec(extension: u8, mnemonic: &str) -> InstructionSpecification {
        InstructionSpecification {
            opcode: Opcode::new(0xf7),
            modrm_usage: ModrmUsage::OpcodeExtension(extension),
            llvm_mnemonic: mnemonic.to_string(),
            raw_encoding_specification: format!("F7 /{extension}"),
            ..nop_spec()
        }
    }

    #[test]
    fn opcode_extension_candidates_are_disambiguated_by_modrm_reg() {
        let database = InstructionDatabase::build(vec![
            grp_extension_spec(0, "TEST"),
            grp_extension_spec(3, "NEG"),
            grp_extension_spec(7, "IDIV"),
        ]);
        // ModR/M = 11 111 000 -> mode=DIRECT, reg=7 (IDIV), rm=0.
        let parsed = parse(&database, &[0xf7, 0b1111_1000]).unwrap();
        assert_eq!(database.instruction(parsed.index).llvm_mnemonic, "IDIV");

        // ModR/M = 11 011 001 -> mode=DIRECT, reg=3 (NEG), rm=1.
        let parsed = parse(&database, &[0xf7, 0b1101_1001]).unwrap();
        assert_eq!(database.instruction(parsed.index).llvm_mnemonic, "NEG");
    }
}
