//! The microarchitecture description and the registry that tracks
//! the set of known microarchitectures as an explicit, owned context
//! object rather than a process-wide static map.

use std::collections::HashMap;

use crate::index::{MicroArchitectureIndex, PortMaskIndex};
use crate::port_mask::PortMask;

/// A named execution port and the mask table it indexes into.
#[derive(Debug, Clone)]
pub struct Microarchitecture {
    pub id: String,
    pub port_names: Vec<String>,
    pub port_masks: Vec<PortMask>,
    pub load_store_address_generation: PortMaskIndex,
    pub store_address_generation: PortMaskIndex,
    pub store_data: PortMaskIndex,
}

impl Microarchitecture {
    pub fn port_mask(&self, index: PortMaskIndex) -> PortMask {
        self.port_masks[index.value()]
    }

    /// The index of `mask` in this microarchitecture's mask table, if the
    /// mask is one of the ones the solver is allowed to use.
    pub fn index_of_mask(&self, mask: PortMask) -> Option<PortMaskIndex> {
        self.port_masks.iter().position(|&m| m == mask).map(PortMaskIndex::new)
    }

    /// Classifies a numeric protection level (CPL) as protected (rings 0-2)
    /// or not (ring 3, user mode).
    pub fn is_protected_mode(protection_level: u32) -> bool {
        protection_level < 3
    }
}

/// The set of microarchitectures known at startup, keyed by id string.
/// Immutable after construction; safe to share across threads.
#[derive(Debug, Default)]
pub struct ArchitectureRegistry {
    microarchitectures: Vec<Microarchitecture>,
    by_id: HashMap<String, MicroArchitectureIndex>,
}

impl ArchitectureRegistry {
    pub fn new() -> Self {
        ArchitectureRegistry::default()
    }

    /// Registers `microarchitecture`, returning its index.
    pub fn register(&mut self, microarchitecture: Microarchitecture) -> MicroArchitectureIndex {
        let index = MicroArchitectureIndex::new(self.microarchitectures.len());
        self.by_id.insert(microarchitecture.id.clone(), index);
        self.microarchitectures.push(microarchitecture);
        index
    }

    /// Registers `alias_id` as pointing at the same entry as `target_id`.
    /// Used for microarchitectures that share a mask table under more
    /// than one id (e.g. Ivy Bridge under "snb"); never silent, always
    /// logged as a diagnostic naming both ids.
    pub fn register_alias(&mut self, alias_id: &str, target_id: &str) -> Option<MicroArchitectureIndex> {
        let target = *self.by_id.get(target_id)?;
        tracing::warn!(
            alias_id,
            target_id,
            "microarchitecture id is being registered as an alias of another id; \
             verify this is intentional, not a copy-paste artifact of the source data"
        );
        self.by_id.insert(alias_id.to_string(), target);
        Some(target)
    }

    pub fn index_of(&self, id: &str) -> Option<MicroArchitectureIndex> {
        self.by_id.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&Microarchitecture> {
        self.index_of(id).map(|index| &self.microarchitectures[index.value()])
    }

    pub fn by_index(&self, index: MicroArchitectureIndex) -> &Microarchitecture {
        &self.microarchitectures[index.value()]
    }

    pub fn num_microarchitectures(&self) -> usize {
        self.microarchitectures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn haswell() -> Microarchitecture {
        let port_masks = vec![
            PortMask::parse("P0"),
            PortMask::parse("P1"),
            PortMask::parse("P23"),
            PortMask::parse("P237"),
            PortMask::parse("P4"),
            PortMask::parse("P0156"),
        ];
        Microarchitecture {
            id: "hsw".to_string(),
            port_names: (0..8).map(|p| format!("port_{p}")).collect(),
            port_masks,
            load_store_address_generation: PortMaskIndex::new(2),
            store_address_generation: PortMaskIndex::new(3),
            store_data: PortMaskIndex::new(4),
        }
    }

    #[test]
    fn lookup_by_id_finds_registered_microarchitecture() {
        let mut registry = ArchitectureRegistry::new();
        registry.register(haswell());
        assert!(registry.get("hsw").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn alias_resolves_to_the_same_entry() {
        let mut registry = ArchitectureRegistry::new();
        registry.register(haswell());
        let aliased = registry.register_alias("ivb", "hsw").unwrap();
        assert_eq!(registry.index_of("hsw"), Some(aliased));
    }

    #[test]
    fn protected_mode_predicate_excludes_ring_three() {
        assert!(Microarchitecture::is_protected_mode(0));
        assert!(!Microarchitecture::is_protected_mode(3));
    }
}
