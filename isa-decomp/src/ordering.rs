//! Turns a port-mask histogram into the canonical µop sequence.

use std::collections::HashMap;

use isa_core::{Microarchitecture, PortMask};

/// Orders `histogram` (a count of inferred µops per port mask) into the
/// canonical sequence: paired (address-generation, memory-buffer-write)
/// µops are identified first, then emitted in canonical order (unpaired
/// load-address, unpaired store-address, non-memory in mask order, then
/// paired address/write pairs, then any remaining unpaired writes).
/// Returns the sequence and whether it is the only order
/// consistent with the histogram (`is_order_unique`, true iff at most one
/// distinct non-memory mask appears).
pub fn order_micro_operations(
    architecture: &Microarchitecture,
    histogram: &HashMap<PortMask, usize>,
) -> (Vec<PortMask>, bool) {
    let store_data_mask = architecture.port_mask(architecture.store_data);
    let store_address_mask = architecture.port_mask(architecture.store_address_generation);
    let load_store_address_mask = architecture.port_mask(architecture.load_store_address_generation);

    let mut counts = histogram.clone();
    let mut take = |counts: &mut HashMap<PortMask, usize>, mask: PortMask| -> bool {
        match counts.get_mut(&mask) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    };

    let writes = counts.remove(&store_data_mask).unwrap_or(0);
    let mut pairs = Vec::new();
    for _ in 0..writes {
        if take(&mut counts, store_address_mask) {
            pairs.push((store_address_mask, store_data_mask));
        } else if take(&mut counts, load_store_address_mask) {
            pairs.push((load_store_address_mask, store_data_mask));
        } else {
            // No address-generation µop left to pair with; the write stays
            // unpaired and is emitted at the end with the others.
            *counts.entry(store_data_mask).or_insert(0) += 1;
        }
    }

    let mut sequence = Vec::new();

    let unpaired_load_address = counts.remove(&load_store_address_mask).unwrap_or(0);
    sequence.extend(std::iter::repeat(load_store_address_mask).take(unpaired_load_address));

    let unpaired_store_address = counts.remove(&store_address_mask).unwrap_or(0);
    sequence.extend(std::iter::repeat(store_address_mask).take(unpaired_store_address));

    let unpaired_writes = counts.remove(&store_data_mask).unwrap_or(0);

    let mut non_memory: Vec<(PortMask, usize)> = counts.into_iter().filter(|(_, n)| *n > 0).collect();
    // Declaration order in `architecture.port_masks`, not a numeric sort of
    // the mask's bit pattern (the two only coincide by chance).
    non_memory.sort_by_key(|(mask, _)| {
        architecture.port_masks.iter().position(|candidate| candidate == mask).unwrap_or(usize::MAX)
    });
    let distinct_non_memory_masks = non_memory.len();
    for (mask, count) in &non_memory {
        sequence.extend(std::iter::repeat(*mask).take(*count));
    }

    for (address_mask, write_mask) in &pairs {
        sequence.push(*address_mask);
        sequence.push(*write_mask);
    }

    sequence.extend(std::iter::repeat(store_data_mask).take(unpaired_writes));

    let is_order_unique = distinct_non_memory_masks <= 1;
    (sequence, is_order_unique)
}

#[cfg(test)]
mod tests {
    use super::*;
    use isa_core::index::PortMaskIndex;

    fn haswell() -> Microarchitecture {
        Microarchitecture {
            id: "hsw".to_string(),
            port_names: (0..8).map(|p| format!("port_{p}")).collect(),
            port_masks: vec![
                PortMask::parse("P0"),
                PortMask::parse("P1"),
                PortMask::parse("P23"),
                PortMask::parse("P237"),
                PortMask::parse("P4"),
                PortMask::parse("P0156"),
            ],
            load_store_address_generation: PortMaskIndex::new(2),
            store_address_generation: PortMaskIndex::new(3),
            store_data: PortMaskIndex::new(4),
        }
    }

    #[test]
    fn negate_scenario_reproduces_the_documented_sequence() {
        let architecture = haswell();
        let mut histogram = HashMap::new();
        histogram.insert(PortMask::parse("P23"), 1);
        histogram.insert(PortMask::parse("P0156"), 2);
        histogram.insert(PortMask::parse("P237"), 1);
        histogram.insert(PortMask::parse("P4"), 1);

        let (sequence, is_order_unique) = order_micro_operations(&architecture, &histogram);

        let expected: Vec<PortMask> =
            ["P23", "P0156", "P0156", "P237", "P4"].iter().map(|s| PortMask::parse(s)).collect();
        assert_eq!(sequence, expected);
        assert!(is_order_unique);
    }

    #[test]
    fn unpaired_write_without_available_address_generation_is_emitted_last() {
        let architecture = haswell();
        let mut histogram = HashMap::new();
        histogram.insert(PortMask::parse("P4"), 1);

        let (sequence, _) = order_micro_operations(&architecture, &histogram);
        assert_eq!(sequence, vec![PortMask::parse("P4")]);
    }

    #[test]
    fn two_distinct_non_memory_masks_make_the_order_non_unique() {
        let architecture = haswell();
        let mut histogram = HashMap::new();
        histogram.insert(PortMask::parse("P0"), 1);
        histogram.insert(PortMask::parse("P1"), 1);

        let (_, is_order_unique) = order_micro_operations(&architecture, &histogram);
        assert!(!is_order_unique);
    }

    #[test]
    fn non_memory_masks_follow_the_architecture_s_declared_order_not_bit_pattern_order() {
        // P5's raw bit pattern sorts after P1's, but it's registered first.
        let architecture = Microarchitecture {
            id: "hsw".to_string(),
            port_names: (0..8).map(|p| format!("port_{p}")).collect(),
            port_masks: vec![
                PortMask::parse("P5"),
                PortMask::parse("P1"),
                PortMask::parse("P23"),
                PortMask::parse("P237"),
                PortMask::parse("P4"),
                PortMask::parse("P0156"),
            ],
            load_store_address_generation: PortMaskIndex::new(2),
            store_address_generation: PortMaskIndex::new(3),
            store_data: PortMaskIndex::new(4),
        };
        let mut histogram = HashMap::new();
        histogram.insert(PortMask::parse("P1"), 1);
        histogram.insert(PortMask::parse("P5"), 1);

        let (sequence, _) = order_micro_operations(&architecture, &histogram);
        assert_eq!(sequence, vec![PortMask::parse("P5"), PortMask::parse("P1")]);
    }
}
