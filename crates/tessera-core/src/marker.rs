//! Positional marker construction from an approved assignment set, and the
//! canonical serializations derived from it: the opaque base document and
//! the per-set payload streams.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::sha512_hex;
use crate::error::{Result, TesseraError};
use crate::model::{ApprovedAssignment, PositionalMarker};

/// One line of a content set's payload stream. Content assigned to multiple
/// sets is written into each set's stream and resolves back to the same
/// marker on reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadEntry {
    pub marker_id: Uuid,
    pub block_id: String,
    pub start_offset: Option<u32>,
    pub end_offset: Option<u32>,
    pub content: String,
    pub page_number: u32,
}

/// Output of the builder: document-ordered markers plus one newline-delimited
/// payload per content set, keyed by identifier in ascending order.
#[derive(Debug, Clone)]
pub struct MarkerBuild {
    pub markers: Vec<PositionalMarker>,
    pub payloads: BTreeMap<String, String>,
}

/// The only marker fields the base document may carry. Membership, content
/// and content hashes never enter this record.
#[derive(Debug, Serialize, Deserialize)]
struct BaseMarkerEntry {
    marker_id: Uuid,
    block_id: String,
    start_offset: Option<u32>,
    end_offset: Option<u32>,
    sequence_position: u32,
}

/// Build markers and per-set payloads from the approved assignment set.
///
/// Assignments at the same `(block_id, start_offset, end_offset)` collapse
/// into one merged marker whose membership is the deduplicated union of
/// their sets.
pub fn build(assignments: &[ApprovedAssignment]) -> Result<MarkerBuild> {
    if assignments.is_empty() {
        return Err(TesseraError::EmptyAssignmentSet);
    }

    let mut sorted: Vec<&ApprovedAssignment> = assignments.iter().collect();
    // Option's ordering puts None first, which is the nulls-first rule.
    sorted.sort_by(|a, b| {
        (&a.block_id, a.start_offset, a.end_offset, &a.content_set_identifier).cmp(&(
            &b.block_id,
            b.start_offset,
            b.end_offset,
            &b.content_set_identifier,
        ))
    });

    let mut markers: Vec<PositionalMarker> = Vec::new();
    let mut by_position: HashMap<(String, Option<u32>, Option<u32>), usize> = HashMap::new();
    let mut payload_lines: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for assignment in sorted {
        let key = (
            assignment.block_id.clone(),
            assignment.start_offset,
            assignment.end_offset,
        );
        let marker_index = match by_position.get(&key) {
            Some(&index) => {
                let marker = &mut markers[index];
                if !marker
                    .content_set_membership
                    .contains(&assignment.content_set_identifier)
                {
                    marker
                        .content_set_membership
                        .push(assignment.content_set_identifier.clone());
                }
                marker.is_merged = marker.content_set_membership.len() >= 2;
                index
            }
            None => {
                let text = assignment.selected_text.as_deref().unwrap_or("");
                markers.push(PositionalMarker {
                    marker_id: Uuid::new_v4(),
                    content_set_membership: vec![assignment.content_set_identifier.clone()],
                    block_id: assignment.block_id.clone(),
                    start_offset: assignment.start_offset,
                    end_offset: assignment.end_offset,
                    content_hash: sha512_hex(text.as_bytes()),
                    sequence_position: markers.len() as u32 + 1,
                    is_merged: false,
                });
                let index = markers.len() - 1;
                by_position.insert(key, index);
                index
            }
        };

        let entry = PayloadEntry {
            marker_id: markers[marker_index].marker_id,
            block_id: assignment.block_id.clone(),
            start_offset: assignment.start_offset,
            end_offset: assignment.end_offset,
            content: assignment.selected_text.clone().unwrap_or_default(),
            page_number: assignment.page_number,
        };
        let line = serde_json::to_string(&entry)
            .map_err(|e| TesseraError::PayloadParse(e.to_string()))?;
        payload_lines
            .entry(assignment.content_set_identifier.clone())
            .or_default()
            .push(line);
    }

    let payloads = payload_lines
        .into_iter()
        .map(|(set, lines)| (set, lines.join("\n")))
        .collect();

    Ok(MarkerBuild { markers, payloads })
}

/// Canonical base-document serialization: a JSON array of position records
/// in sequence order, nothing else.
pub fn serialize_base(markers: &[PositionalMarker]) -> Result<String> {
    let entries: Vec<BaseMarkerEntry> = markers
        .iter()
        .map(|m| BaseMarkerEntry {
            marker_id: m.marker_id,
            block_id: m.block_id.clone(),
            start_offset: m.start_offset,
            end_offset: m.end_offset,
            sequence_position: m.sequence_position,
        })
        .collect();
    serde_json::to_string(&entries).map_err(|e| TesseraError::PayloadParse(e.to_string()))
}

/// Parse one decrypted payload stream into a marker-indexed map.
pub fn parse_payload(payload: &str) -> Result<HashMap<Uuid, PayloadEntry>> {
    let mut entries = HashMap::new();
    for line in payload.lines().filter(|l| !l.is_empty()) {
        let entry: PayloadEntry = serde_json::from_str(line)
            .map_err(|e| TesseraError::PayloadParse(e.to_string()))?;
        entries.insert(entry.marker_id, entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(set: &str, block: &str, range: Option<(u32, u32)>, text: &str) -> ApprovedAssignment {
        ApprovedAssignment {
            content_set_identifier: set.to_string(),
            block_id: block.to_string(),
            start_offset: range.map(|(s, _)| s),
            end_offset: range.map(|(_, e)| e),
            selected_text: Some(text.to_string()),
            page_number: 1,
        }
    }

    #[test]
    fn empty_set_rejected() {
        assert!(matches!(build(&[]).unwrap_err(), TesseraError::EmptyAssignmentSet));
    }

    #[test]
    fn one_marker_per_position() {
        let build = build(&[
            assignment("CS-PUBLIC", "b1", Some((0, 17)), "Public statement."),
            assignment("CS-CONFIDENTIAL", "b2", Some((0, 13)), "Budget $4.2M."),
        ])
        .unwrap();
        assert_eq!(build.markers.len(), 2);
        assert_eq!(build.markers[0].sequence_position, 1);
        assert_eq!(build.markers[1].sequence_position, 2);
        assert!(!build.markers[0].is_merged);
    }

    #[test]
    fn coincident_assignments_merge() {
        let build = build(&[
            assignment("CS-CONFIDENTIAL", "b2", Some((0, 13)), "Budget $4.2M."),
            assignment("CS-SECRET", "b2", Some((0, 13)), "Budget $4.2M."),
        ])
        .unwrap();
        assert_eq!(build.markers.len(), 1);
        let marker = &build.markers[0];
        assert!(marker.is_merged);
        assert_eq!(
            marker.content_set_membership,
            vec!["CS-CONFIDENTIAL".to_string(), "CS-SECRET".to_string()]
        );
        // both payloads carry the content, under the same marker id
        let confidential = parse_payload(&build.payloads["CS-CONFIDENTIAL"]).unwrap();
        let secret = parse_payload(&build.payloads["CS-SECRET"]).unwrap();
        assert!(confidential.contains_key(&marker.marker_id));
        assert!(secret.contains_key(&marker.marker_id));
    }

    #[test]
    fn membership_deduplicated() {
        let build = build(&[
            assignment("CS-A", "b1", None, "text"),
            assignment("CS-A", "b1", None, "text"),
        ])
        .unwrap();
        assert_eq!(build.markers.len(), 1);
        assert_eq!(build.markers[0].content_set_membership, vec!["CS-A".to_string()]);
        assert!(!build.markers[0].is_merged);
    }

    #[test]
    fn whole_block_sorts_before_ranges() {
        let build = build(&[
            assignment("CS-A", "b1", Some((5, 9)), "range"),
            assignment("CS-A", "b1", None, "whole block"),
        ])
        .unwrap();
        assert_eq!(build.markers[0].start_offset, None);
        assert_eq!(build.markers[1].start_offset, Some(5));
    }

    #[test]
    fn content_hash_is_of_exact_text() {
        let build = build(&[assignment("CS-A", "b1", None, "Agent Smith.")]).unwrap();
        assert_eq!(
            build.markers[0].content_hash,
            sha512_hex(b"Agent Smith.")
        );
    }

    #[test]
    fn missing_text_hashes_empty_string() {
        let mut a = assignment("CS-A", "b1", None, "");
        a.selected_text = None;
        let build = build(&[a]).unwrap();
        assert_eq!(build.markers[0].content_hash, sha512_hex(b""));
    }

    #[test]
    fn base_serialization_is_opaque() {
        let build = build(&[
            assignment("CS-SECRET", "b1", Some((0, 4)), "Name"),
            assignment("CS-PUBLIC", "b2", None, "Hello world"),
        ])
        .unwrap();
        let base = serialize_base(&build.markers).unwrap();
        assert!(!base.contains("CS-SECRET"));
        assert!(!base.contains("CS-PUBLIC"));
        assert!(!base.contains("membership"));
        assert!(!base.contains("content_hash"));
        assert!(!base.contains("Name"));
        assert!(!base.contains("Hello"));
        // positions and ids are present
        assert!(base.contains("sequence_position"));
        assert!(base.contains(&build.markers[0].marker_id.to_string()));
    }

    #[test]
    fn payload_round_trip() {
        let build = build(&[assignment("CS-A", "b7", Some((2, 6)), "body")]).unwrap();
        let parsed = parse_payload(&build.payloads["CS-A"]).unwrap();
        let entry = parsed.get(&build.markers[0].marker_id).unwrap();
        assert_eq!(entry.content, "body");
        assert_eq!(entry.block_id, "b7");
        assert_eq!(entry.page_number, 1);
    }
}
