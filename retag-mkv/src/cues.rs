//! Cues (index) updating.
//!
//! The Cues element maps playback times to cluster positions. Rewriting a
//! file moves clusters, so every `CueClusterPosition` (and, when cluster
//! contents shift, every `CueRelativePosition`) must be relocated. The
//! updater keeps the offsets read from the original file as immutable keys
//! and reports whether a relocation changed the serialized size, which
//! forces the planner to restart its fixed point.

use std::io::{Read, Seek, Write};

use retag_core::{NotificationList, Result};

use crate::ebml;
use crate::element::{ElemRef, ElementTree};
use crate::elements;

/// One CueTrackPositions element.
#[derive(Debug, Clone)]
struct TrackPositions {
    track: Option<u64>,
    /// Cluster position to be written, relative to the segment data offset.
    cluster_position: u64,
    /// Cluster position read from the original file; relocation key.
    original_cluster_position: u64,
    relative_position: Option<u64>,
    original_relative_position: Option<u64>,
    duration: Option<u64>,
    block_number: Option<u64>,
}

/// One CuePoint element.
#[derive(Debug, Clone)]
struct CuePoint {
    time: u64,
    positions: Vec<TrackPositions>,
}

/// Parsed, relocatable view of a Cues element.
#[derive(Debug, Default)]
pub struct CuePositionUpdater {
    cue_points: Vec<CuePoint>,
}

impl CuePositionUpdater {
    /// Create an empty updater.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any cue points were parsed.
    pub fn is_empty(&self) -> bool {
        self.cue_points.is_empty()
    }

    /// Parse a Cues element into the in-memory model.
    ///
    /// Unknown children inside cue structures are dropped with a warning;
    /// carrying unparseable bytes would break the exact size accounting the
    /// planner depends on.
    pub fn parse<R: Read + Seek>(
        &mut self,
        tree: &mut ElementTree,
        cues: ElemRef,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<()> {
        const CONTEXT: &str = "parsing Cues element";

        self.cue_points.clear();
        let mut child = tree.first_child(cues, io)?;
        while let Some(cue_point) = child {
            tree.parse(cue_point, io)?;
            match tree.id(cue_point) {
                elements::CUE_POINT => {
                    let mut point = CuePoint {
                        time: 0,
                        positions: Vec::new(),
                    };
                    let mut have_time = false;
                    let mut element = tree.first_child(cue_point, io)?;
                    while let Some(current) = element {
                        tree.parse(current, io)?;
                        match tree.id(current) {
                            elements::CUE_TIME => {
                                point.time = tree.read_uint(current, io)?;
                                have_time = true;
                            }
                            elements::CUE_TRACK_POSITIONS => {
                                point.positions.push(Self::parse_track_positions(
                                    tree,
                                    current,
                                    io,
                                    notifications,
                                )?);
                            }
                            elements::CRC32 | elements::VOID => {}
                            _ => notifications.warning(
                                CONTEXT,
                                format!(
                                    "\"CuePoint\" element contains unknown child {}; it will be dropped",
                                    tree.id_string(current)
                                ),
                            ),
                        }
                        element = tree.next_sibling(current, io)?;
                    }
                    if !have_time {
                        notifications.warning(
                            CONTEXT,
                            "\"CuePoint\" element lacks the mandatory \"CueTime\" child",
                        );
                    }
                    self.cue_points.push(point);
                }
                elements::CRC32 | elements::VOID => {}
                _ => notifications.warning(
                    CONTEXT,
                    format!(
                        "\"Cues\" element contains unknown child {}; it will be dropped",
                        tree.id_string(cue_point)
                    ),
                ),
            }
            child = tree.next_sibling(cue_point, io)?;
        }
        Ok(())
    }

    fn parse_track_positions<R: Read + Seek>(
        tree: &mut ElementTree,
        positions: ElemRef,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<TrackPositions> {
        const CONTEXT: &str = "parsing Cues element";

        let mut parsed = TrackPositions {
            track: None,
            cluster_position: 0,
            original_cluster_position: 0,
            relative_position: None,
            original_relative_position: None,
            duration: None,
            block_number: None,
        };
        let mut element = tree.first_child(positions, io)?;
        while let Some(current) = element {
            tree.parse(current, io)?;
            match tree.id(current) {
                elements::CUE_TRACK => parsed.track = Some(tree.read_uint(current, io)?),
                elements::CUE_CLUSTER_POSITION => {
                    let value = tree.read_uint(current, io)?;
                    parsed.cluster_position = value;
                    parsed.original_cluster_position = value;
                }
                elements::CUE_RELATIVE_POSITION => {
                    let value = tree.read_uint(current, io)?;
                    parsed.relative_position = Some(value);
                    parsed.original_relative_position = Some(value);
                }
                elements::CUE_DURATION => parsed.duration = Some(tree.read_uint(current, io)?),
                elements::CUE_BLOCK_NUMBER => {
                    parsed.block_number = Some(tree.read_uint(current, io)?)
                }
                elements::CRC32 | elements::VOID => {}
                _ => notifications.warning(
                    CONTEXT,
                    format!(
                        "\"CueTrackPositions\" element contains unknown child {}; it will be dropped",
                        tree.id_string(current)
                    ),
                ),
            }
            element = tree.next_sibling(current, io)?;
        }
        if parsed.track.is_none() {
            notifications.warning(
                CONTEXT,
                "\"CueTrackPositions\" element lacks the mandatory \"CueTrack\" child",
            );
        }
        Ok(parsed)
    }

    /// Relocate every CueClusterPosition that referred to the cluster at
    /// `original_offset` (relative to the segment data offset in the original
    /// file) to `new_offset`. Returns whether the serialized size changed.
    pub fn update_offsets(&mut self, original_offset: u64, new_offset: u64) -> bool {
        let size_before = self.total_size();
        for point in &mut self.cue_points {
            for position in &mut point.positions {
                if position.original_cluster_position == original_offset {
                    position.cluster_position = new_offset;
                }
            }
        }
        self.total_size() != size_before
    }

    /// Adjust the CueRelativePositions of blocks inside the cluster that was
    /// read at `cluster_offset`: entries whose original relative offset is
    /// `original_relative` now point at `new_relative`. Returns whether the
    /// serialized size changed.
    pub fn update_relative_offsets(
        &mut self,
        cluster_offset: u64,
        original_relative: u64,
        new_relative: u64,
    ) -> bool {
        let size_before = self.total_size();
        for point in &mut self.cue_points {
            for position in &mut point.positions {
                if position.original_cluster_position == cluster_offset
                    && position.original_relative_position == Some(original_relative)
                {
                    position.relative_position = Some(new_relative);
                }
            }
        }
        self.total_size() != size_before
    }

    /// Exact serialized size of the Cues element with the current offsets.
    pub fn total_size(&self) -> u64 {
        let content = self.data_size();
        4 + ebml::calculate_size_denotation_length(content) as u64 + content
    }

    fn data_size(&self) -> u64 {
        self.cue_points.iter().map(Self::cue_point_size).sum()
    }

    fn cue_point_size(point: &CuePoint) -> u64 {
        let content = Self::cue_point_data_size(point);
        1 + ebml::calculate_size_denotation_length(content) as u64 + content
    }

    fn cue_point_data_size(point: &CuePoint) -> u64 {
        let mut content = ebml::uint_element_length(elements::CUE_TIME, point.time);
        for position in &point.positions {
            let inner = Self::track_positions_data_size(position);
            content += 1 + ebml::calculate_size_denotation_length(inner) as u64 + inner;
        }
        content
    }

    fn track_positions_data_size(position: &TrackPositions) -> u64 {
        let mut content = 0;
        if let Some(track) = position.track {
            content += ebml::uint_element_length(elements::CUE_TRACK, track);
        }
        content +=
            ebml::uint_element_length(elements::CUE_CLUSTER_POSITION, position.cluster_position);
        if let Some(relative) = position.relative_position {
            content += ebml::uint_element_length(elements::CUE_RELATIVE_POSITION, relative);
        }
        if let Some(duration) = position.duration {
            content += ebml::uint_element_length(elements::CUE_DURATION, duration);
        }
        if let Some(block_number) = position.block_number {
            content += ebml::uint_element_length(elements::CUE_BLOCK_NUMBER, block_number);
        }
        content
    }

    /// Write the Cues element with the current offsets.
    pub fn make<W: Write>(&self, out: &mut W) -> Result<()> {
        ebml::write_id(out, elements::CUES)?;
        ebml::write_size(out, self.data_size())?;
        for point in &self.cue_points {
            ebml::write_id(out, elements::CUE_POINT)?;
            ebml::write_size(out, Self::cue_point_data_size(point))?;
            ebml::write_uint_element(out, elements::CUE_TIME, point.time)?;
            for position in &point.positions {
                ebml::write_id(out, elements::CUE_TRACK_POSITIONS)?;
                ebml::write_size(out, Self::track_positions_data_size(position))?;
                if let Some(track) = position.track {
                    ebml::write_uint_element(out, elements::CUE_TRACK, track)?;
                }
                ebml::write_uint_element(
                    out,
                    elements::CUE_CLUSTER_POSITION,
                    position.cluster_position,
                )?;
                if let Some(relative) = position.relative_position {
                    ebml::write_uint_element(out, elements::CUE_RELATIVE_POSITION, relative)?;
                }
                if let Some(duration) = position.duration {
                    ebml::write_uint_element(out, elements::CUE_DURATION, duration)?;
                }
                if let Some(block_number) = position.block_number {
                    ebml::write_uint_element(out, elements::CUE_BLOCK_NUMBER, block_number)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Build a Cues element with the given `(time, track, cluster_position,
    /// relative_position)` rows and parse it back.
    fn build_updater(rows: &[(u64, u64, u64, Option<u64>)]) -> CuePositionUpdater {
        let mut cues_content = Vec::new();
        for &(time, track, cluster_position, relative) in rows {
            let mut tp = Vec::new();
            ebml::write_uint_element(&mut tp, elements::CUE_TRACK, track).unwrap();
            ebml::write_uint_element(&mut tp, elements::CUE_CLUSTER_POSITION, cluster_position)
                .unwrap();
            if let Some(relative) = relative {
                ebml::write_uint_element(&mut tp, elements::CUE_RELATIVE_POSITION, relative)
                    .unwrap();
            }
            let mut point = Vec::new();
            ebml::write_uint_element(&mut point, elements::CUE_TIME, time).unwrap();
            ebml::write_binary_element(&mut point, elements::CUE_TRACK_POSITIONS, &tp).unwrap();
            ebml::write_binary_element(&mut cues_content, elements::CUE_POINT, &point).unwrap();
        }
        let mut bytes = Vec::new();
        ebml::write_binary_element(&mut bytes, elements::CUES, &cues_content).unwrap();

        let len = bytes.len() as u64;
        let mut io = Cursor::new(bytes);
        let mut tree = ElementTree::new();
        let root = tree.create(0, len);
        let mut updater = CuePositionUpdater::new();
        let mut notifications = NotificationList::new();
        updater
            .parse(&mut tree, root, &mut io, &mut notifications)
            .unwrap();
        assert!(notifications.is_empty());
        updater
    }

    #[test]
    fn test_parse_and_size_accounting() {
        let updater = build_updater(&[(0, 1, 0x100, Some(0x20)), (5000, 1, 0x40_0000, None)]);
        assert!(!updater.is_empty());
        let mut out = Vec::new();
        updater.make(&mut out).unwrap();
        assert_eq!(out.len() as u64, updater.total_size());
    }

    #[test]
    fn test_update_offsets_keyed_by_original() {
        let mut updater = build_updater(&[(0, 1, 0x100, None), (10, 1, 0x100, None)]);
        // same-width move reports no size change and hits both cue points
        assert!(!updater.update_offsets(0x100, 0x180));
        // the key stays the original offset, so a second relocation still works
        assert!(updater.update_offsets(0x100, 0x1_0000));
        let mut out = Vec::new();
        updater.make(&mut out).unwrap();
        assert_eq!(out.len() as u64, updater.total_size());

        // unrelated offsets stay untouched
        assert!(!updater.update_offsets(0xDEAD, 0x33));
    }

    #[test]
    fn test_update_relative_offsets() {
        let mut updater = build_updater(&[(0, 1, 0x100, Some(0x20))]);
        assert!(!updater.update_relative_offsets(0x100, 0x20, 0x30));
        // growth of the relative position widens the element
        assert!(updater.update_relative_offsets(0x100, 0x20, 0x1_0000));
        let mut out = Vec::new();
        updater.make(&mut out).unwrap();
        assert_eq!(out.len() as u64, updater.total_size());
    }

    #[test]
    fn test_unknown_children_warn() {
        // CuePoint carrying an unknown child element
        let mut point = Vec::new();
        ebml::write_uint_element(&mut point, elements::CUE_TIME, 1).unwrap();
        ebml::write_uint_element(&mut point, 0xEE, 7).unwrap();
        let mut cues_content = Vec::new();
        ebml::write_binary_element(&mut cues_content, elements::CUE_POINT, &point).unwrap();
        let mut bytes = Vec::new();
        ebml::write_binary_element(&mut bytes, elements::CUES, &cues_content).unwrap();

        let len = bytes.len() as u64;
        let mut io = Cursor::new(bytes);
        let mut tree = ElementTree::new();
        let root = tree.create(0, len);
        let mut updater = CuePositionUpdater::new();
        let mut notifications = NotificationList::new();
        updater
            .parse(&mut tree, root, &mut io, &mut notifications)
            .unwrap();
        assert_eq!(notifications.len(), 1);
    }
}
