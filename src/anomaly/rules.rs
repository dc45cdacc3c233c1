//! Layered heuristic rules.
//!
//! Each rule looks at one [`FeatureSnapshot`] on its own and, when it fires,
//! adds a reason, a contribution score, a tag and the packet rows it
//! implicates to a shared [`Findings`] accumulator. Rules never depend on each
//! other's outcome.

use crate::anomaly::event::FeatureSnapshot;
use crate::monitor::types::Heuristics;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

/// Reasons collected while evaluating one second.
#[derive(Debug, Default)]
pub struct Findings {
    pub reasons:       Vec<String>,
    pub contributions: Vec<f64>,
    pub tags:          Vec<String>,
    pub rows:          Vec<usize>,
    seen_rows:         HashSet<usize>,
}

impl Findings {
    pub fn add(&mut self, reason: String, contribution: f64, tag: &str, rows: &[usize]) {
        self.reasons.push(reason);
        self.contributions.push(contribution);
        if !tag.is_empty() && !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
        for &row in rows {
            if self.seen_rows.insert(row) {
                self.rows.push(row);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }

    /// The event score: the largest single contribution.
    pub fn score(&self) -> f64 {
        self.contributions.iter().copied().fold(0.0, f64::max)
    }
}

fn share(part: u64, total: f64) -> f64 {
    part as f64 / total.max(1.0)
}

fn rows_for<'a>(map: &'a BTreeMap<String, Vec<usize>>, key: &str) -> &'a [usize] {
    map.get(key).map(Vec::as_slice).unwrap_or(&[])
}

/// Protocols never seen in the trailing history window.
pub fn new_protocols(snapshot: &FeatureSnapshot, threshold: f64, findings: &mut Findings) {
    if snapshot.new_protocols.is_empty() {
        return;
    }
    findings.add(
        format!("New protocol(s): {}", snapshot.new_protocols.join(", ")),
        threshold + 0.4 * snapshot.new_protocols.len() as f64,
        "new-protocol",
        &snapshot.packet_rows,
    );
}

/// Protocols whose own share of the second reaches the dominance level,
/// described as `"<name> <pct>%"`, largest first.
pub fn dominant_protocols(
    protocol_counts: &BTreeMap<String, u64>,
    total_packets:   f64,
    min_share:       f64,
) -> Vec<String> {
    if protocol_counts.is_empty() || total_packets <= 0.0 {
        return Vec::new();
    }

    let mut shares: Vec<(&str, f64)> = protocol_counts
        .iter()
        .map(|(name, count)| (name.as_str(), *count as f64 / total_packets))
        .collect();
    // Stable sort keeps name order among equal shares.
    shares.sort_by(|a, b| b.1.total_cmp(&a.1));

    shares
        .into_iter()
        .take_while(|(_, s)| *s >= min_share)
        .map(|(name, s)| format!("{} {:.1}%", name, s * 100.0))
        .collect()
}

pub fn protocol_dominance(
    snapshot:   &FeatureSnapshot,
    heuristics: &Heuristics,
    threshold:  f64,
    findings:   &mut Findings,
) {
    let dominant = dominant_protocols(
        &snapshot.protocol_counts,
        snapshot.packets,
        heuristics.dominance_share,
    );
    if dominant.is_empty() {
        return;
    }
    findings.add(
        format!("Traffic dominated by {}", dominant.join(", ")),
        threshold + 0.2 * dominant.len() as f64,
        "protocol-dominance",
        &snapshot.packet_rows,
    );
}

/// Returns the churn ratio (new / unique connections) when there were any
/// connections at all, so the caller can report it.
pub fn connection_churn(
    snapshot:   &FeatureSnapshot,
    heuristics: &Heuristics,
    threshold:  f64,
    findings:   &mut Findings,
) -> Option<f64> {
    if snapshot.unique_connections == 0 {
        return None;
    }
    let churn = snapshot.new_connections as f64 / snapshot.unique_connections as f64;
    if snapshot.new_connections > heuristics.churn_min_new && churn > heuristics.churn_ratio {
        findings.add(
            format!(
                "High connection churn ({} new/{} total)",
                snapshot.new_connections, snapshot.unique_connections
            ),
            threshold + churn,
            "connection-churn",
            &snapshot.packet_rows,
        );
    }
    Some(churn)
}

/// Destinations receiving from many sources with a large share of the
/// second's packets. Returns one detail record per flagged destination.
pub fn ddos_targets(
    snapshot:   &FeatureSnapshot,
    heuristics: &Heuristics,
    threshold:  f64,
    findings:   &mut Findings,
) -> Vec<Value> {
    let mut records = Vec::new();
    if snapshot.packets <= 0.0 {
        return records;
    }

    for (destination, &sources) in &snapshot.destination_fan_in {
        let packets = snapshot.destination_packets.get(destination).copied().unwrap_or(0);
        if packets == 0 {
            continue;
        }
        let share = share(packets, snapshot.packets);
        if sources >= heuristics.ddos_min_sources
            && packets >= heuristics.ddos_min_packets
            && share >= heuristics.ddos_min_share
        {
            findings.add(
                format!(
                    "Potential DDoS against {} ({} sources, {} packets)",
                    destination, sources, packets
                ),
                threshold + share * 2.5,
                "ddos-target",
                rows_for(&snapshot.rows_by_destination, destination),
            );
            records.push(json!({
                "destination":   destination,
                "uniqueSources": sources,
                "packets":       packets,
                "share":         share,
            }));
        }
    }
    records
}

/// Sources fanning out to many destinations: a flood when the source also
/// carries a large share, a scan otherwise. Returns one record per source.
pub fn aggressive_sources(
    snapshot:   &FeatureSnapshot,
    heuristics: &Heuristics,
    threshold:  f64,
    findings:   &mut Findings,
) -> Vec<Value> {
    let mut records = Vec::new();
    if snapshot.packets <= 0.0 {
        return records;
    }

    for (source, &destinations) in &snapshot.source_fan_out {
        let packets = snapshot.source_packets.get(source).copied().unwrap_or(0);
        if packets == 0 {
            continue;
        }
        let share = share(packets, snapshot.packets);
        let rows = rows_for(&snapshot.rows_by_source, source);

        if destinations >= heuristics.flood_min_destinations
            && packets >= heuristics.flood_min_packets
            && share >= heuristics.flood_min_share
        {
            findings.add(
                format!(
                    "Single-source flood from {} ({} destinations, {} packets)",
                    source, destinations, packets
                ),
                threshold + share * 2.0,
                "ddos-source",
                rows,
            );
        } else if destinations >= heuristics.scan_min_destinations
            && packets >= heuristics.scan_min_packets
        {
            findings.add(
                format!("Possible scan from {} ({} destinations)", source, destinations),
                threshold + destinations as f64 / 10.0,
                "scan",
                rows,
            );
        } else {
            continue;
        }

        records.push(json!({
            "source":             source,
            "uniqueDestinations": destinations,
            "packets":            packets,
            "share":              share,
        }));
    }
    records
}

/// The single busiest source, if it carries most of the second.
pub fn dominant_source(
    snapshot:   &FeatureSnapshot,
    heuristics: &Heuristics,
    threshold:  f64,
    findings:   &mut Findings,
) {
    if snapshot.packets <= 0.0 {
        return;
    }

    // First maximum in address order wins ties.
    let mut heavy: Option<(&str, u64)> = None;
    for (source, &packets) in &snapshot.source_packets {
        if packets > heavy.map_or(0, |(_, p)| p) {
            heavy = Some((source, packets));
        }
    }

    let Some((source, packets)) = heavy else {
        return;
    };
    let share = share(packets, snapshot.packets);
    if share >= heuristics.top_source_share && packets >= heuristics.top_source_min_packets {
        findings.add(
            format!("Dominant source {} ({:.1}% of packets)", source, share * 100.0),
            threshold + share * 1.5,
            "top-source",
            rows_for(&snapshot.rows_by_source, source),
        );
    }
}
