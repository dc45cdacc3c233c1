//! Adaptive anomaly scoring over finalized seconds.
//!
//! [`AnomalyEngine::observe`] takes one [`FeatureSnapshot`] at a time. Six
//! adaptive metrics score the second against its own recent history, then the
//! heuristic rules in [`rules`] look for structural patterns (floods, scans,
//! protocol shifts). Any triggered reason produces exactly one
//! [`AnomalyEvent`]; a quiet second produces nothing.
//!
//! The engine keeps mutable state and is meant to be driven from a single
//! thread (the one finalizing buckets).

pub mod event;
pub mod metric;
pub mod rules;

pub use event::{AnomalyEvent, FeatureSnapshot};
pub use metric::AdaptiveMetric;

use crate::monitor::types::{DetectorConfig, Heuristics};
use rules::Findings;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// The signals tracked by an adaptive metric, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Packets,
    Bytes,
    Connections,
    NewConnections,
    Entropy,
    AvgSize,
}

impl Signal {
    const ALL: [Signal; 6] = [
        Signal::Packets,
        Signal::Bytes,
        Signal::Connections,
        Signal::NewConnections,
        Signal::Entropy,
        Signal::AvgSize,
    ];

    fn label(self) -> &'static str {
        match self {
            Signal::Packets        => "Packet rate spike",
            Signal::Bytes          => "Byte throughput surge",
            Signal::Connections    => "Connection fan-out",
            Signal::NewConnections => "Burst of new connections",
            Signal::Entropy        => "Protocol mix shift",
            Signal::AvgSize        => "Packet size swing",
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Signal::Packets        => "packet-rate",
            Signal::Bytes          => "byte-throughput",
            Signal::Connections    => "connection-fanout",
            Signal::NewConnections => "new-connections",
            Signal::Entropy        => "protocol-entropy",
            Signal::AvgSize        => "packet-size",
        }
    }

    fn alpha(self, config: &DetectorConfig) -> f64 {
        match self {
            Signal::Packets        => config.alpha_packets,
            Signal::Bytes          => config.alpha_bytes,
            Signal::Connections    => config.alpha_connections,
            Signal::NewConnections => config.alpha_new_connections,
            Signal::Entropy        => config.alpha_entropy,
            Signal::AvgSize        => config.alpha_avg_size,
        }
    }

    fn value(self, snapshot: &FeatureSnapshot) -> f64 {
        match self {
            Signal::Packets        => snapshot.packets,
            Signal::Bytes          => snapshot.bytes,
            Signal::Connections    => snapshot.unique_connections as f64,
            Signal::NewConnections => snapshot.new_connections as f64,
            Signal::Entropy        => snapshot.protocol_entropy,
            Signal::AvgSize        => snapshot.avg_packet_size,
        }
    }
}

pub struct AnomalyEngine {
    config:     DetectorConfig,
    heuristics: Heuristics,
    metrics:    [(Signal, AdaptiveMetric); 6],
}

impl AnomalyEngine {
    pub fn new(config: DetectorConfig, heuristics: Heuristics) -> Self {
        let metrics = Signal::ALL.map(|s| (s, AdaptiveMetric::new(s.alpha(&config))));
        Self {
            config,
            heuristics,
            metrics,
        }
    }

    /// Forget all adaptive history, e.g. when a new session starts.
    pub fn reset(&mut self) {
        for (_, metric) in self.metrics.iter_mut() {
            metric.reset();
        }
    }

    /// Scores one finalized second. Every metric absorbs the snapshot whether
    /// or not an event is returned.
    pub fn observe(&mut self, snapshot: &FeatureSnapshot) -> Option<AnomalyEvent> {
        let threshold = self.config.threshold;
        let mut details = base_details(snapshot);
        let mut findings = Findings::default();

        for (signal, metric) in self.metrics.iter_mut() {
            let score = metric
                .update_and_score(signal.value(snapshot), self.config.warmup)
                .abs();
            if score > threshold {
                findings.add(
                    format!("{} ({:.2}σ)", signal.label(), score),
                    score,
                    signal.tag(),
                    &snapshot.packet_rows,
                );
            }
        }

        rules::new_protocols(snapshot, threshold, &mut findings);
        rules::protocol_dominance(snapshot, &self.heuristics, threshold, &mut findings);
        if let Some(churn) =
            rules::connection_churn(snapshot, &self.heuristics, threshold, &mut findings)
        {
            details.insert("connectionChurn".into(), json!(churn));
        }
        let targets = rules::ddos_targets(snapshot, &self.heuristics, threshold, &mut findings);
        let sources =
            rules::aggressive_sources(snapshot, &self.heuristics, threshold, &mut findings);
        rules::dominant_source(snapshot, &self.heuristics, threshold, &mut findings);

        if !targets.is_empty() {
            details.insert("ddosTargets".into(), Value::Array(targets));
        }
        if !sources.is_empty() {
            details.insert("aggressiveSources".into(), Value::Array(sources));
        }

        if findings.is_empty() {
            return None;
        }

        let score = findings.score();
        if !findings.tags.is_empty() {
            details.insert("tags".into(), json!(findings.tags));
        }

        Some(AnomalyEvent {
            second: snapshot.second,
            score,
            summary: format!(
                "Anomaly at {}s: {}",
                snapshot.second,
                findings.reasons.join("; ")
            ),
            reasons: findings.reasons,
            tags: findings.tags,
            details,
            packet_rows: findings.rows,
        })
    }
}

impl Default for AnomalyEngine {
    fn default() -> Self {
        Self::new(DetectorConfig::default(), Heuristics::default())
    }
}

fn base_details(snapshot: &FeatureSnapshot) -> BTreeMap<String, Value> {
    let mut details = BTreeMap::new();
    details.insert("packetsPerSecond".into(), json!(snapshot.packets));
    details.insert("bytesPerSecond".into(), json!(snapshot.bytes));
    details.insert("avgPacketSize".into(), json!(snapshot.avg_packet_size));
    details.insert("uniqueConnections".into(), json!(snapshot.unique_connections));
    details.insert("newConnections".into(), json!(snapshot.new_connections));
    details.insert("protocolEntropy".into(), json!(snapshot.protocol_entropy));
    details.insert("protocolCount".into(), json!(snapshot.protocol_count));
    if !snapshot.new_protocols.is_empty() {
        details.insert("newProtocols".into(), json!(snapshot.new_protocols));
    }
    if !snapshot.protocol_counts.is_empty() {
        details.insert("protocolCounts".into(), json!(snapshot.protocol_counts));
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A second split evenly between TCP and UDP over one connection, one
    /// row per packet. Nothing structural is anomalous.
    fn quiet(second: u64, packets: u64) -> FeatureSnapshot {
        let mut snap = FeatureSnapshot {
            second,
            packets: packets as f64,
            bytes: packets as f64 * 100.0,
            avg_packet_size: 100.0,
            unique_connections: 1,
            protocol_count: 2,
            protocol_entropy: 1.0,
            ..Default::default()
        };
        snap.protocol_counts.insert("TCP".into(), packets / 2);
        snap.protocol_counts.insert("UDP".into(), packets - packets / 2);
        snap.packet_rows = (0..packets as usize).collect();
        snap
    }

    #[test]
    fn first_observation_emits_nothing_for_quiet_traffic() {
        let mut engine = AnomalyEngine::default();
        assert!(engine.observe(&quiet(0, 2)).is_none());
    }

    #[test]
    fn packet_rate_spike_after_warmup() {
        let mut engine = AnomalyEngine::default();
        for s in 0..6 {
            assert!(engine.observe(&quiet(s, 2)).is_none());
        }

        let mut spike = quiet(6, 200);
        spike.bytes = 200.0 * 100.0;
        let event = engine.observe(&spike).expect("spike should be flagged");

        assert!(event.has_tag("packet-rate"));
        assert!(event.reasons[0].starts_with("Packet rate spike ("));
        assert!(event.score > 2.8);
        assert!(event.summary.starts_with("Anomaly at 6s: Packet rate spike"));
        assert_eq!(event.details["packetsPerSecond"], json!(200.0));
    }

    #[test]
    fn ddos_target_names_the_destination() {
        let mut engine = AnomalyEngine::default();
        let mut snap = FeatureSnapshot {
            second: 3,
            packets: 125.0,
            ..Default::default()
        };
        snap.destination_fan_in.insert("10.0.0.1".into(), 10);
        snap.destination_packets.insert("10.0.0.1".into(), 50);
        snap.rows_by_destination.insert("10.0.0.1".into(), vec![4, 5, 6]);

        let event = engine.observe(&snap).expect("ddos should be flagged");
        assert!(event.has_tag("ddos-target"));
        assert!(event
            .reasons
            .contains(&"Potential DDoS against 10.0.0.1 (10 sources, 50 packets)".to_string()));
        assert_eq!(event.packet_rows, vec![4, 5, 6]);
        assert_eq!(event.details["ddosTargets"][0]["destination"], "10.0.0.1");
        assert!((event.score - (2.8 + 0.4 * 2.5)).abs() < 1e-9);
    }

    #[test]
    fn score_is_max_and_rows_are_deduplicated() {
        let mut engine = AnomalyEngine::default();
        let mut snap = FeatureSnapshot {
            second: 0,
            packets: 100.0,
            ..Default::default()
        };
        // Flood source (share 0.8) and DDoS target (share 0.5) share rows.
        snap.source_fan_out.insert("a".into(), 20);
        snap.source_packets.insert("a".into(), 80);
        snap.rows_by_source.insert("a".into(), vec![1, 2, 3]);
        snap.destination_fan_in.insert("z".into(), 9);
        snap.destination_packets.insert("z".into(), 50);
        snap.rows_by_destination.insert("z".into(), vec![3, 4]);

        let event = engine.observe(&snap).unwrap();
        assert_eq!(event.tags, vec!["ddos-target", "ddos-source", "top-source"]);
        // flood 2.8 + 0.8 * 2.0 outranks top-source 2.8 + 0.8 * 1.5
        assert!((event.score - (2.8 + 0.8 * 2.0)).abs() < 1e-9);
        assert_eq!(event.packet_rows, vec![3, 4, 1, 2]);
        assert_eq!(event.details["tags"], json!(event.tags));
    }

    #[test]
    fn new_protocol_and_dominance_reasons() {
        let mut engine = AnomalyEngine::default();
        let mut snap = quiet(0, 10);
        snap.protocol_counts.clear();
        snap.protocol_counts.insert("ICMP".into(), 10);
        snap.new_protocols = vec!["ICMP".into()];

        let event = engine.observe(&snap).unwrap();
        assert_eq!(
            event.reasons,
            vec!["New protocol(s): ICMP", "Traffic dominated by ICMP 100.0%"]
        );
        assert_eq!(event.details["newProtocols"], json!(["ICMP"]));
        assert_eq!(event.packet_rows.len(), 10);
    }

    #[test]
    fn low_churn_is_not_flagged() {
        let mut engine = AnomalyEngine::default();
        let mut snap = quiet(0, 4);
        snap.unique_connections = 2;
        snap.new_connections = 1;
        assert!(engine.observe(&snap).is_none());
    }

    #[test]
    fn reset_restarts_warmup() {
        let mut engine = AnomalyEngine::default();
        for s in 0..8 {
            engine.observe(&quiet(s, 2));
        }
        engine.reset();
        assert!(engine.observe(&quiet(8, 400)).is_none());
    }
}
