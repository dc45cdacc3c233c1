use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Everything the engine needs to know about one finalized second.
///
/// Per-address maps are ordered so that rule evaluation (and therefore the
/// order of reasons in an event) is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSnapshot {
    pub second:              u64,
    pub packets:             f64,
    pub bytes:               f64,
    pub avg_packet_size:     f64,
    pub unique_connections:  usize,
    /// Connections absent from the trailing history window.
    pub new_connections:     usize,
    /// Shannon entropy (bits) of the protocol histogram.
    pub protocol_entropy:    f64,
    pub protocol_count:      usize,
    /// Protocols absent from the trailing history window.
    pub new_protocols:       Vec<String>,
    pub protocol_counts:     BTreeMap<String, u64>,
    pub source_packets:      BTreeMap<String, u64>,
    pub destination_packets: BTreeMap<String, u64>,
    /// Distinct sources seen sending to each destination.
    pub destination_fan_in:  BTreeMap<String, usize>,
    /// Distinct destinations each source sent to.
    pub source_fan_out:      BTreeMap<String, usize>,
    pub rows_by_source:      BTreeMap<String, Vec<usize>>,
    pub rows_by_destination: BTreeMap<String, Vec<usize>>,
    pub packet_rows:         Vec<usize>,
}

/// A scored anomaly for one second. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyEvent {
    pub second:      u64,
    /// Largest contribution among the triggered reasons.
    pub score:       f64,
    pub summary:     String,
    pub reasons:     Vec<String>,
    pub tags:        Vec<String>,
    pub details:     BTreeMap<String, Value>,
    /// Implicated packet rows, deduplicated, in first-seen order.
    pub packet_rows: Vec<usize>,
}

impl AnomalyEvent {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
