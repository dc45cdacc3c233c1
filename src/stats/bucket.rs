use crate::anomaly::FeatureSnapshot;
use crate::stats::history::RecentHistoryWindow;
use std::collections::{BTreeMap, BTreeSet};

/// A (source, destination) pair seen within one second.
pub type Connection = (String, String);

/// Everything recorded for one second of traffic.
///
/// A bucket is mutable only while it is the aggregator's open bucket; once
/// finalized it is kept read-only for persistence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerSecondBucket {
    pub second:              u64,
    pub protocol_counts:     BTreeMap<String, u64>,
    pub connections:         BTreeSet<Connection>,
    pub packets:             u64,
    pub bytes:               u64,
    pub source_packets:      BTreeMap<String, u64>,
    pub destination_packets: BTreeMap<String, u64>,
    pub fan_out:             BTreeMap<String, BTreeSet<String>>,
    pub fan_in:              BTreeMap<String, BTreeSet<String>>,
    pub rows:                Vec<usize>,
    pub rows_by_source:      BTreeMap<String, Vec<usize>>,
    pub rows_by_destination: BTreeMap<String, Vec<usize>>,
}

impl PerSecondBucket {
    pub fn new(second: u64) -> Self {
        Self {
            second,
            ..Default::default()
        }
    }

    pub fn record(&mut self, protocol: &str, src: &str, dst: &str, size: u64, row: Option<usize>) {
        *self.protocol_counts.entry(protocol.to_string()).or_insert(0) += 1;
        self.connections.insert((src.to_string(), dst.to_string()));
        self.packets = self.packets.saturating_add(1);
        self.bytes = self.bytes.saturating_add(size);
        *self.source_packets.entry(src.to_string()).or_insert(0) += 1;
        *self.destination_packets.entry(dst.to_string()).or_insert(0) += 1;
        self.fan_out
            .entry(src.to_string())
            .or_default()
            .insert(dst.to_string());
        self.fan_in
            .entry(dst.to_string())
            .or_default()
            .insert(src.to_string());

        if let Some(row) = row {
            self.rows.push(row);
            self.rows_by_source.entry(src.to_string()).or_default().push(row);
            self.rows_by_destination.entry(dst.to_string()).or_default().push(row);
        }
    }

    pub fn avg_packet_size(&self) -> f64 {
        if self.packets == 0 {
            return 0.0;
        }
        self.bytes as f64 / self.packets as f64
    }

    /// Shannon entropy in bits of the protocol histogram.
    pub fn protocol_entropy(&self) -> f64 {
        if self.packets == 0 {
            return 0.0;
        }
        let total = self.packets as f64;
        self.protocol_counts
            .values()
            .map(|&count| count as f64 / total)
            .filter(|&p| p > 0.0)
            .map(|p| -p * p.log2())
            .sum()
    }

    /// Features for the anomaly engine. "New" connections and protocols are
    /// judged against `history`, which must not yet contain this bucket.
    pub fn snapshot(&self, history: &RecentHistoryWindow) -> FeatureSnapshot {
        let new_connections = self
            .connections
            .iter()
            .filter(|c| history.is_new_connection(c))
            .count();
        let new_protocols = self
            .protocol_counts
            .keys()
            .filter(|p| history.is_new_protocol(p))
            .cloned()
            .collect();

        FeatureSnapshot {
            second:              self.second,
            packets:             self.packets as f64,
            bytes:               self.bytes as f64,
            avg_packet_size:     self.avg_packet_size(),
            unique_connections:  self.connections.len(),
            new_connections,
            protocol_entropy:    self.protocol_entropy(),
            protocol_count:      self.protocol_counts.len(),
            new_protocols,
            protocol_counts:     self.protocol_counts.clone(),
            source_packets:      self.source_packets.clone(),
            destination_packets: self.destination_packets.clone(),
            destination_fan_in:  self.fan_in.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
            source_fan_out:      self.fan_out.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
            rows_by_source:      self.rows_by_source.clone(),
            rows_by_destination: self.rows_by_destination.clone(),
            packet_rows:         self.rows.clone(),
        }
    }
}
