//! Input/output value types for the port-decomposition solver.

use isa_core::PortMask;

use crate::error::{Error, Result};

/// A measured run: average µops dispatched per port, plus the retired µop
/// count, as read off performance counters named `uops_executed_port:port_<N>`
/// and `uops_retired:all`.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Indexed the same way as the microarchitecture's port list.
    pub per_port: Vec<f64>,
    pub retired: f64,
}

impl Measurement {
    pub fn new(per_port: Vec<f64>, retired: f64) -> Self {
        Measurement { per_port, retired }
    }

    /// Parses the external measurement format: a keyed list of
    /// `(event-name, value)` pairs, with per-port counters named
    /// `uops_executed_port:port_<N>` and the retired count named
    /// `uops_retired:all`. `num_ports` fixes the length of the returned
    /// `per_port` vector; a counter naming a port `>= num_ports` is rejected.
    pub fn from_named_counters(counters: &[(&str, f64)], num_ports: usize) -> Result<Self> {
        let mut per_port = vec![0.0; num_ports];
        let mut retired = None;
        for &(name, value) in counters {
            if name == "uops_retired:all" {
                retired = Some(value);
                continue;
            }
            let Some(port_str) = name.strip_prefix("uops_executed_port:port_") else {
                return Err(Error::invalid_argument(format!("unrecognized measurement counter name {name:?}")));
            };
            let port: usize = port_str
                .parse()
                .map_err(|_| Error::invalid_argument(format!("measurement counter {name:?} has a non-numeric port number")))?;
            if port >= num_ports {
                return Err(Error::invalid_argument(format!(
                    "measurement counter {name:?} names port {port}, but the microarchitecture only has {num_ports} ports"
                )));
            }
            per_port[port] = value;
        }
        let retired = retired
            .ok_or_else(|| Error::invalid_argument("measurement is missing the uops_retired:all counter"))?;
        Ok(Measurement { per_port, retired })
    }
}

/// One inferred micro-op: the port mask it executes on and a latency
/// derived from its reconstructed per-port load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicroOp {
    pub port_mask: PortMask,
    pub latency: u32,
}

/// The solver's full result: the ordered µop sequence, whether that order
/// is the only one consistent with the histogram, per-port residual error,
/// and the objective value attained.
#[derive(Debug, Clone, PartialEq)]
pub struct PortDecomposition {
    pub micro_ops: Vec<MicroOp>,
    pub is_order_unique: bool,
    pub per_port_error: Vec<f64>,
    pub objective_value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_counters_into_an_indexed_vector() {
        let measurement = Measurement::from_named_counters(
            &[
                ("uops_executed_port:port_2", 0.8410),
                ("uops_executed_port:port_0", 0.4328),
                ("uops_retired:all", 5.1162),
            ],
            8,
        )
        .unwrap();
        assert_eq!(measurement.retired, 5.1162);
        assert_eq!(measurement.per_port[0], 0.4328);
        assert_eq!(measurement.per_port[2], 0.8410);
        assert_eq!(measurement.per_port[1], 0.0);
    }

    #[test]
    fn missing_retired_counter_is_an_error() {
        let result = Measurement::from_named_counters(&[("uops_executed_port:port_0", 1.0)], 8);
        assert!(result.is_err());
    }

    #[test]
    fn unrecognized_counter_name_is_an_error() {
        let result = Measurement::from_named_counters(&[("mystery_counter", 1.0), ("uops_retired:all", 1.0)], 8);
        assert!(result.is_err());
    }

    #[test]
    fn port_number_beyond_the_architecture_is_an_error() {
        let result =
            Measurement::from_named_counters(&[("uops_executed_port:port_9", 1.0), ("uops_retired:all", 1.0)], 8);
        assert!(result.is_err());
    }
}
