//! The instruction database: an immutable table of
//! [`InstructionSpecification`] values with opcode/mnemonic/raw-spec lookup.

use std::collections::HashMap;
use std::collections::HashSet;

use crate::index::InstructionIndex;
use crate::instruction::InstructionSpecification;
use crate::opcode::Opcode;

/// An immutable, indexed table of instruction specifications, built once
/// from an architecture description and shared freely across readers
///.
#[derive(Debug)]
pub struct InstructionDatabase {
    instructions: Vec<InstructionSpecification>,
    by_raw_spec: HashMap<String, Vec<InstructionIndex>>,
    by_mnemonic: HashMap<String, Vec<InstructionIndex>>,
    by_opcode: HashMap<Opcode, Vec<InstructionIndex>>,
    legacy_prefix_opcodes: HashSet<Opcode>,
}

impl InstructionDatabase {
    /// Builds the database and its indices from a flat list of
    /// specifications. Construction never fails on duplicate keys: the
    /// encoding-specification string is not necessarily unique (a single
    /// textual encoding may admit direct- and indirect-addressing variants
    /// with different itineraries), so every index maps to a *list* of
    /// instructions.
    pub fn build(instructions: Vec<InstructionSpecification>) -> Self {
        let mut by_raw_spec: HashMap<String, Vec<InstructionIndex>> = HashMap::new();
        let mut by_mnemonic: HashMap<String, Vec<InstructionIndex>> = HashMap::new();
        let mut by_opcode: HashMap<Opcode, Vec<InstructionIndex>> = HashMap::new();

        for (position, spec) in instructions.iter().enumerate() {
            let index = InstructionIndex::new(position);
            by_raw_spec.entry(spec.raw_encoding_specification.clone()).or_default().push(index);
            by_mnemonic.entry(spec.llvm_mnemonic.clone()).or_default().push(index);
            by_opcode.entry(spec.opcode).or_default().push(index);
        }

        let legacy_prefix_opcodes = Self::compute_legacy_prefix_opcodes(&instructions);

        InstructionDatabase { instructions, by_raw_spec, by_mnemonic, by_opcode, legacy_prefix_opcodes }
    }

    /// The set of opcodes that are a proper byte-shifted prefix of any
    /// legacy (non-VEX/EVEX) opcode in the table; used by the parser to
    /// decide how many opcode bytes to keep consuming.
    fn compute_legacy_prefix_opcodes(instructions: &[InstructionSpecification]) -> HashSet<Opcode> {
        use crate::instruction::PrefixEncoding;
        let mut prefixes = HashSet::new();
        for spec in instructions {
            if matches!(spec.prefix_encoding, PrefixEncoding::VexEvex(_)) {
                continue;
            }
            for prefix in spec.opcode.proper_prefixes() {
                prefixes.insert(prefix);
            }
        }
        prefixes
    }

    pub fn num_instructions(&self) -> usize {
        self.instructions.len()
    }

    pub fn instruction(&self, index: InstructionIndex) -> &InstructionSpecification {
        &self.instructions[index.value()]
    }

    pub fn instructions(&self) -> impl Iterator<Item = (InstructionIndex, &InstructionSpecification)> {
        self.instructions.iter().enumerate().map(|(i, spec)| (InstructionIndex::new(i), spec))
    }

    /// Returns the indices of instructions with this raw encoding
    /// specification string, or an empty slice if none match.
    pub fn by_raw_spec(&self, raw_encoding_specification: &str) -> &[InstructionIndex] {
        self.by_raw_spec.get(raw_encoding_specification).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns the indices of instructions with this mnemonic, or an empty
    /// slice if none match.
    pub fn by_mnemonic(&self, mnemonic: &str) -> &[InstructionIndex] {
        self.by_mnemonic.get(mnemonic).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns the indices of instructions with this opcode, or an empty
    /// slice if none match.
    pub fn by_opcode(&self, opcode: Opcode) -> &[InstructionIndex] {
        self.by_opcode.get(&opcode).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `true` iff `opcode` is a proper byte-shifted prefix of some legacy
    /// opcode in the table.
    pub fn is_legacy_opcode_prefix(&self, opcode: Opcode) -> bool {
        self.legacy_prefix_opcodes.contains(&opcode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{LegacyPrefixEncoding, ModrmUsage, OperandInOpcode, PrefixEncoding};

    fn spec(opcode: u32, mnemonic: &str, raw: &str) -> InstructionSpecification {
        InstructionSpecification {
            opcode: Opcode::new(opcode),
            operand_in_opcode: OperandInOpcode::None,
            modrm_usage: ModrmUsage::None,
            prefix_encoding: PrefixEncoding::Legacy(LegacyPrefixEncoding::default()),
            immediate_value_bytes: vec![],
            code_offset_bytes: 0,
            llvm_mnemonic: mnemonic.to_string(),
            raw_encoding_specification: raw.to_string(),
        }
    }

    #[test]
    fn lookups_miss_return_empty_not_error() {
        let db = InstructionDatabase::build(vec![spec(0x90, "NOP", "NP 90")]);
        assert!(db.by_mnemonic("NOTAREALMNEMONIC").is_empty());
        assert!(db.by_opcode(Opcode::new(0xff)).is_empty());
        assert!(db.by_raw_spec("nonexistent").is_empty());
    }

    #[test]
    fn by_opcode_finds_inserted_instruction() {
        let db = InstructionDatabase::build(vec![spec(0x0f06, "CLTS", "0F 06")]);
        let found = db.by_opcode(Opcode::new(0x0f06));
        assert_eq!(found.len(), 1);
        assert_eq!(db.instruction(found[0]).llvm_mnemonic, "CLTS");
    }

    #[test]
    fn legacy_prefix_opcodes_tracks_byte_shifted_prefixes() {
        let db = InstructionDatabase::build(vec![spec(0x0f06, "CLTS", "0F 06")]);
        assert!(db.is_legacy_opcode_prefix(Opcode::new(0x0f)));
        assert!(!db.is_legacy_opcode_prefix(Opcode::new(0x0f06)));
    }

    #[test]
    fn num_instructions_and_iteration_cover_the_whole_table() {
        let db = InstructionDatabase::build(vec![spec(0x90, "NOP", "NP 90"), spec(0x0f06, "CLTS", "0F 06")]);
        assert_eq!(db.num_instructions(), 2);
        assert_eq!(db.instructions().count(), 2);
    }
}
