//! End-to-end tests of the segment planner/writer against synthesized
//! Matroska files written to disk.

use std::cell::Cell;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use retag_core::{validate_structure, NoProgress, NotificationList, ProgressSink, Severity};
use retag_mkv::{
    crc, ebml, elements, ElemRef, ElementPosition, ElementTree, MatroskaContainer, MatroskaTag,
    SeekInfo, TagTarget, TreeStructure, WriteConfig,
};

// =============================================================================
// Fixture building
// =============================================================================

fn uint_el(id: u32, value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    ebml::write_uint_element(&mut out, id, value).unwrap();
    out
}

fn str_el(id: u32, value: &str) -> Vec<u8> {
    let mut out = Vec::new();
    ebml::write_string_element(&mut out, id, value).unwrap();
    out
}

fn bin_el(id: u32, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    ebml::write_binary_element(&mut out, id, content).unwrap();
    out
}

fn void_bytes(total: u64) -> Vec<u8> {
    assert!(total >= 2);
    let mut out = Vec::new();
    if total - 2 <= 0x7E {
        out.push(0xEC);
        out.push(0x80 | (total - 2) as u8);
        out.resize(total as usize, 0);
    } else {
        out.push(0xEC);
        let mut denotation = (total - 9).to_be_bytes();
        denotation[0] = 0x01;
        out.extend_from_slice(&denotation);
        out.resize(total as usize, 0);
    }
    out
}

fn ebml_header_bytes() -> Vec<u8> {
    let mut content = Vec::new();
    content.extend(uint_el(elements::EBML_VERSION, 1));
    content.extend(uint_el(elements::EBML_READ_VERSION, 1));
    content.extend(uint_el(elements::EBML_MAX_ID_LENGTH, 4));
    content.extend(uint_el(elements::EBML_MAX_SIZE_LENGTH, 8));
    content.extend(str_el(elements::DOC_TYPE, "matroska"));
    content.extend(uint_el(elements::DOC_TYPE_VERSION, 4));
    content.extend(uint_el(elements::DOC_TYPE_READ_VERSION, 2));
    bin_el(elements::EBML, &content)
}

/// Serialize tags the same way the engine does so fixture bytes and
/// rewritten bytes stay comparable.
fn tags_element(values: &[(&str, &str)]) -> Vec<u8> {
    let mut content = Vec::new();
    for &(name, value) in values {
        let mut tag = MatroskaTag::new(TagTarget::with_level(50));
        tag.set_value(name, value);
        let maker = tag.prepare_making().unwrap();
        let mut bytes = Vec::new();
        maker.make(&mut bytes).unwrap();
        content.extend(bytes);
    }
    bin_el(elements::TAGS, &content)
}

#[derive(Clone)]
struct FixtureOptions {
    with_crc: bool,
    cues_before: bool,
    padding: u64,
    with_positions: bool,
    cluster_count: usize,
    cluster_payload: usize,
    tag_values: Vec<(&'static str, &'static str)>,
    /// Seek entries `(id, offset)` to plant into an original SeekHead.
    seek_entries: Vec<(u32, u64)>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            with_crc: false,
            cues_before: false,
            padding: 300,
            with_positions: false,
            cluster_count: 2,
            cluster_payload: 600,
            tag_values: vec![
                ("TITLE", "An Original Title"),
                ("ARTIST", "The Original Artist"),
                ("DATE_RELEASED", "2003"),
            ],
            seek_entries: Vec::new(),
        }
    }
}

/// Build one segment. Cluster offsets and cue entries are mutually
/// consistent; when the cues precede the data their size is iterated until
/// it is stable.
fn segment_bytes(opts: &FixtureOptions) -> Vec<u8> {
    let seek_head = if opts.seek_entries.is_empty() {
        Vec::new()
    } else {
        let mut content = Vec::new();
        for &(id, offset) in &opts.seek_entries {
            let id_bytes = id.to_be_bytes();
            let id_length = ebml::id_length(id) as usize;
            let mut seek = Vec::new();
            seek.extend(bin_el(elements::SEEK_ID, &id_bytes[4 - id_length..]));
            seek.extend(uint_el(elements::SEEK_POSITION, offset));
            content.extend(bin_el(elements::SEEK, &seek));
        }
        bin_el(elements::SEEK_HEAD, &content)
    };

    let mut info_content = Vec::new();
    info_content.extend(uint_el(elements::TIMECODE_SCALE, 1_000_000));
    info_content.extend(str_el(elements::MUXING_APP, "fixture"));
    info_content.extend(str_el(elements::WRITING_APP, "fixture"));
    let info = bin_el(elements::INFO, &info_content);

    let tracks = {
        let mut entry = Vec::new();
        entry.extend(uint_el(0xD7, 1)); // TrackNumber
        entry.extend(uint_el(0x83, 1)); // TrackType
        entry.extend(str_el(0x86, "V_TEST")); // CodecID
        bin_el(elements::TRACKS, &bin_el(0xAE, &entry))
    };

    let tags = tags_element(&opts.tag_values);

    let mut cues_len_guess = 0usize;
    loop {
        let mut metadata_len = if opts.with_crc { 6 } else { 0 };
        metadata_len += seek_head.len() + info.len() + tracks.len() + tags.len();
        let clusters_start = metadata_len
            + if opts.cues_before { cues_len_guess } else { 0 }
            + if opts.padding > 0 { opts.padding as usize } else { 0 };

        // build clusters at their now-known offsets
        let mut clusters = Vec::new();
        let mut cluster_offsets = Vec::new();
        let mut prev_total = 0u64;
        for index in 0..opts.cluster_count {
            let offset = (clusters_start + clusters.len()) as u64;
            cluster_offsets.push(offset);
            let mut content = Vec::new();
            content.extend(uint_el(elements::TIMESTAMP, index as u64 * 1000));
            if opts.with_positions {
                content.extend(uint_el(elements::POSITION, offset));
                content.extend(uint_el(elements::PREV_SIZE, prev_total));
            }
            let payload: Vec<u8> = (0..opts.cluster_payload)
                .map(|i| (i % 251) as u8)
                .collect();
            content.extend(bin_el(elements::SIMPLE_BLOCK, &payload));
            let cluster = bin_el(elements::CLUSTER, &content);
            prev_total = cluster.len() as u64;
            clusters.extend(cluster);
        }

        let mut cues_content = Vec::new();
        for (index, &offset) in cluster_offsets.iter().enumerate() {
            let mut positions = Vec::new();
            positions.extend(uint_el(elements::CUE_TRACK, 1));
            positions.extend(uint_el(elements::CUE_CLUSTER_POSITION, offset));
            let mut point = Vec::new();
            point.extend(uint_el(elements::CUE_TIME, index as u64 * 1000));
            point.extend(bin_el(elements::CUE_TRACK_POSITIONS, &positions));
            cues_content.extend(bin_el(elements::CUE_POINT, &point));
        }
        let cues = bin_el(elements::CUES, &cues_content);
        if opts.cues_before && cues.len() != cues_len_guess {
            cues_len_guess = cues.len();
            continue;
        }

        let mut data = Vec::new();
        if opts.with_crc {
            data.extend([0xBF, 0x84, 0, 0, 0, 0]);
        }
        data.extend(&seek_head);
        data.extend(&info);
        data.extend(&tracks);
        data.extend(&tags);
        if opts.cues_before {
            data.extend(&cues);
        }
        if opts.padding > 0 {
            data.extend(void_bytes(opts.padding));
        }
        data.extend(&clusters);
        if !opts.cues_before {
            data.extend(&cues);
        }
        return bin_el(elements::SEGMENT, &data);
    }
}

fn fixture_bytes(opts: &FixtureOptions, segments: usize) -> Vec<u8> {
    let mut bytes = ebml_header_bytes();
    for _ in 0..segments {
        bytes.extend(segment_bytes(opts));
    }
    bytes
}

fn write_fixture(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

// =============================================================================
// Output verification
// =============================================================================

struct ParsedFile {
    tree: ElementTree,
    io: std::fs::File,
    size: u64,
    segments: Vec<ElemRef>,
}

fn parse_file(path: &Path) -> ParsedFile {
    let mut io = std::fs::File::open(path).unwrap();
    let size = io.metadata().unwrap().len();
    let mut tree = ElementTree::new();
    let root = tree.create(0, size);
    let mut segments = Vec::new();
    let mut current = Some(root);
    while let Some(elem) = current {
        tree.parse(elem, &mut io).unwrap();
        if tree.id(elem) == elements::SEGMENT {
            segments.push(elem);
        }
        current = tree.next_sibling(elem, &mut io).unwrap();
    }
    ParsedFile {
        tree,
        io,
        size,
        segments,
    }
}

impl ParsedFile {
    /// P6: every element's sizes line up and children fill their parents.
    fn assert_size_law(&mut self) -> u64 {
        let mut tree = ElementTree::new();
        let root = tree.create(0, self.size);
        let mut notifications = NotificationList::new();
        let padding = {
            let mut structure = TreeStructure::new(&mut tree, &mut self.io, root);
            validate_structure(&mut structure, &mut notifications).unwrap()
        };
        assert!(
            !notifications.has_critical(),
            "structure validation reported: {:?}",
            notifications.entries()
        );
        padding
    }

    /// P5: every SeekHead entry denotes an element of the recorded ID.
    fn assert_seek_head_validity(&mut self) {
        for index in 0..self.segments.len() {
            let segment = self.segments[index];
            let data_offset = self.tree.data_offset(segment);
            let Some(seek_head) = self
                .tree
                .child_by_id(segment, elements::SEEK_HEAD, &mut self.io)
                .unwrap()
            else {
                continue;
            };
            let mut notifications = NotificationList::new();
            let info =
                SeekInfo::parse(&mut self.tree, seek_head, &mut self.io, &mut notifications)
                    .unwrap();
            assert!(!info.is_empty());
            for entry in info.entries() {
                let offset = data_offset + entry.offset;
                assert!(offset < self.size, "seek entry points outside the file");
                let probe = self.tree.create(offset, self.size - offset);
                self.tree.parse(probe, &mut self.io).unwrap();
                assert_eq!(
                    self.tree.id(probe),
                    entry.id,
                    "seek entry for 0x{:X} points to 0x{:X}",
                    entry.id,
                    self.tree.id(probe)
                );
            }
        }
    }

    /// P3: every CueClusterPosition denotes a Cluster.
    fn assert_cue_validity(&mut self) {
        for index in 0..self.segments.len() {
            let segment = self.segments[index];
            let data_offset = self.tree.data_offset(segment);
            let Some(cues) = self
                .tree
                .child_by_id(segment, elements::CUES, &mut self.io)
                .unwrap()
            else {
                continue;
            };
            let mut checked = 0usize;
            let mut cue_point = self.tree.first_child(cues, &mut self.io).unwrap();
            while let Some(point) = cue_point {
                self.tree.parse(point, &mut self.io).unwrap();
                if self.tree.id(point) == elements::CUE_POINT {
                    let mut child = self.tree.first_child(point, &mut self.io).unwrap();
                    while let Some(positions) = child {
                        self.tree.parse(positions, &mut self.io).unwrap();
                        if self.tree.id(positions) == elements::CUE_TRACK_POSITIONS {
                            let position = self
                                .tree
                                .child_by_id(
                                    positions,
                                    elements::CUE_CLUSTER_POSITION,
                                    &mut self.io,
                                )
                                .unwrap()
                                .expect("cue entry lacks a cluster position");
                            let value = self.tree.read_uint(position, &mut self.io).unwrap();
                            let offset = data_offset + value;
                            assert!(offset < self.size, "cue position points outside the file");
                            let probe = self.tree.create(offset, self.size - offset);
                            self.tree.parse(probe, &mut self.io).unwrap();
                            assert_eq!(self.tree.id(probe), elements::CLUSTER);
                            checked += 1;
                        }
                        child = self.tree.next_sibling(positions, &mut self.io).unwrap();
                    }
                }
                cue_point = self.tree.next_sibling(point, &mut self.io).unwrap();
            }
            assert!(checked > 0, "cues of segment {index} hold no positions");
        }
    }

    /// P4: Cluster Position children match the cluster's actual offset.
    fn assert_cluster_positions(&mut self) {
        for index in 0..self.segments.len() {
            let segment = self.segments[index];
            let data_offset = self.tree.data_offset(segment);
            let mut cluster = self
                .tree
                .child_by_id(segment, elements::CLUSTER, &mut self.io)
                .unwrap();
            while let Some(cl) = cluster {
                if let Some(position) = self
                    .tree
                    .child_by_id(cl, elements::POSITION, &mut self.io)
                    .unwrap()
                {
                    let value = self.tree.read_uint(position, &mut self.io).unwrap();
                    assert_eq!(value, self.tree.start_offset(cl) - data_offset);
                }
                cluster = self
                    .tree
                    .sibling_by_id(cl, elements::CLUSTER, &mut self.io)
                    .unwrap();
            }
        }
    }

    /// P9: stored CRC-32 values cover the remaining segment bytes.
    fn assert_crc32(&mut self) {
        for index in 0..self.segments.len() {
            let segment = self.segments[index];
            let first = self
                .tree
                .first_child(segment, &mut self.io)
                .unwrap()
                .expect("segment has no children");
            self.tree.parse(first, &mut self.io).unwrap();
            if self.tree.id(first) != elements::CRC32 {
                continue;
            }
            let crc_data_offset = self.tree.data_offset(first);
            self.io.seek(SeekFrom::Start(crc_data_offset)).unwrap();
            let mut stored = [0u8; 4];
            self.io.read_exact(&mut stored).unwrap();
            let covered_start = self.tree.end_offset(first);
            let covered_len = self.tree.data_offset(segment) + self.tree.data_size(segment)
                - covered_start;
            let computed =
                crc::crc32_of_range(&mut self.io, covered_start, covered_len).unwrap();
            assert_eq!(u32::from_le_bytes(stored), computed);
        }
    }

    fn tracks_bytes(&mut self) -> Vec<Vec<u8>> {
        let mut collected = Vec::new();
        for index in 0..self.segments.len() {
            let segment = self.segments[index];
            let mut tracks = self
                .tree
                .child_by_id(segment, elements::TRACKS, &mut self.io)
                .unwrap();
            while let Some(current) = tracks {
                collected.push(self.tree.buffer_element(current, &mut self.io).unwrap());
                tracks = self
                    .tree
                    .sibling_by_id(current, elements::TRACKS, &mut self.io)
                    .unwrap();
            }
        }
        collected
    }

    fn first_cluster_offset(&mut self) -> u64 {
        let segment = self.segments[0];
        let cluster = self
            .tree
            .child_by_id(segment, elements::CLUSTER, &mut self.io)
            .unwrap()
            .expect("segment has no cluster");
        self.tree.start_offset(cluster)
    }

    /// IDs of the children of the given segment, in file order.
    fn child_ids(&mut self, segment_index: usize) -> Vec<u32> {
        let segment = self.segments[segment_index];
        let mut ids = Vec::new();
        let mut child = self.tree.first_child(segment, &mut self.io).unwrap();
        while let Some(current) = child {
            self.tree.parse(current, &mut self.io).unwrap();
            ids.push(self.tree.id(current));
            child = self.tree.next_sibling(current, &mut self.io).unwrap();
        }
        ids
    }
}

fn tag_values_of(container: &MatroskaContainer) -> Vec<(String, String)> {
    let mut values = Vec::new();
    for tag in container.tags() {
        for simple in tag.simple_tags() {
            if let Some(value) = &simple.value {
                values.push((simple.name.clone(), value.clone()));
            }
        }
    }
    values.sort();
    values
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn in_place_rewrite_keeps_length_and_clusters() {
    let dir = tempfile::tempdir().unwrap();
    let opts = FixtureOptions::default();
    let bytes = fixture_bytes(&opts, 1);
    let path = write_fixture(dir.path(), "inplace.mkv", &bytes);

    let input_cluster_offset = parse_file(&path).first_cluster_offset();

    let mut container = MatroskaContainer::open(&path).unwrap();
    container.parse_header().unwrap();
    container.parse_tags().unwrap();
    assert_eq!(container.tags().len(), 3);

    // set the same three tags again
    let values = tag_values_of(&container);
    for tag in container.tags_mut() {
        let names: Vec<String> = tag.simple_tags().iter().map(|t| t.name.clone()).collect();
        for name in names {
            let value = values
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
                .unwrap();
            tag.set_value(&name, value);
        }
    }
    container.save(&WriteConfig::default(), &NoProgress).unwrap();

    let output_bytes = std::fs::read(&path).unwrap();
    assert_eq!(output_bytes.len(), bytes.len(), "in-place save must not change the length");
    // clusters stayed put
    assert_eq!(
        &output_bytes[input_cluster_offset as usize..input_cluster_offset as usize + 4],
        &[0x1F, 0x43, 0xB6, 0x75]
    );
    // no backup left behind
    assert!(!dir.path().join("inplace.mkv.bak").exists());

    let mut parsed = parse_file(&path);
    parsed.assert_size_law();
    parsed.assert_seek_head_validity();
    parsed.assert_cue_validity();

    let mut reparsed = MatroskaContainer::open(&path).unwrap();
    reparsed.parse_header().unwrap();
    reparsed.parse_tags().unwrap();
    let mut expected = values;
    expected.sort();
    assert_eq!(tag_values_of(&reparsed), expected);
}

#[test]
fn insufficient_padding_flips_tags_behind_data() {
    let dir = tempfile::tempdir().unwrap();
    let opts = FixtureOptions {
        cues_before: true,
        padding: 4,
        tag_values: vec![
            ("TITLE", "A Reasonably Long Original Title For This File"),
            ("ARTIST", "An Artist Name That Occupies A Fair Amount Of Space"),
            ("COMMENT", "Original comment text that pads the metadata region nicely"),
            ("GENRE", "Documentary"),
            ("DATE_RELEASED", "2003"),
        ],
        ..FixtureOptions::default()
    };
    let bytes = fixture_bytes(&opts, 1);
    let path = write_fixture(dir.path(), "flip.mkv", &bytes);

    let input_cluster_offset = parse_file(&path).first_cluster_offset();

    let mut container = MatroskaContainer::open(&path).unwrap();
    container.parse_header().unwrap();
    container.parse_tags().unwrap();
    let attachment = container.create_attachment();
    attachment.name = "cover.jpg".to_string();
    attachment.mime_type = "image/jpeg".to_string();
    attachment.data = Some(retag_mkv::AttachmentData::Buffered(vec![0xAB; 2048]));

    container.save(&WriteConfig::default(), &NoProgress).unwrap();

    let output_bytes = std::fs::read(&path).unwrap();
    // grew by the attachment but was not rewritten: clusters stayed put
    assert!(output_bytes.len() > bytes.len() + 2048);
    assert_eq!(
        &output_bytes[input_cluster_offset as usize..input_cluster_offset as usize + 4],
        &[0x1F, 0x43, 0xB6, 0x75]
    );

    let mut parsed = parse_file(&path);
    parsed.assert_size_law();
    parsed.assert_seek_head_validity();
    parsed.assert_cue_validity();

    // tags and attachments moved behind the clusters, cues stayed in front
    let ids = parsed.child_ids(0);
    let cues_index = ids.iter().position(|&id| id == elements::CUES).unwrap();
    let cluster_index = ids.iter().position(|&id| id == elements::CLUSTER).unwrap();
    let tags_index = ids.iter().position(|&id| id == elements::TAGS).unwrap();
    let attachments_index = ids
        .iter()
        .position(|&id| id == elements::ATTACHMENTS)
        .unwrap();
    assert!(cues_index < cluster_index);
    assert!(tags_index > cluster_index);
    assert!(attachments_index > cluster_index);
}

#[test]
fn forced_rewrite_applies_preferred_padding() {
    let dir = tempfile::tempdir().unwrap();
    let opts = FixtureOptions {
        with_crc: true,
        cues_before: true,
        padding: 0,
        cluster_count: 6,
        cluster_payload: 4000,
        ..FixtureOptions::default()
    };
    let bytes = fixture_bytes(&opts, 1);
    let path = write_fixture(dir.path(), "rewrite.mkv", &bytes);

    let mut container = MatroskaContainer::open(&path).unwrap();
    container.parse_header().unwrap();
    container.parse_tags().unwrap();
    container
        .tags_mut()
        .first_mut()
        .unwrap()
        .set_value("TITLE", "A Rewritten Title");

    let config = WriteConfig {
        force_rewrite: true,
        preferred_padding: 4096,
        ..WriteConfig::default()
    };
    container.save(&config, &NoProgress).unwrap();

    assert!(!dir.path().join("rewrite.mkv.bak").exists());

    let mut parsed = parse_file(&path);
    let padding = parsed.assert_size_law();
    assert_eq!(padding, 4096, "the rewrite must leave exactly the preferred padding");
    parsed.assert_seek_head_validity();
    parsed.assert_cue_validity();
    parsed.assert_crc32();

    let mut reparsed = MatroskaContainer::open(&path).unwrap();
    reparsed.parse_header().unwrap();
    reparsed.parse_tags().unwrap();
    assert!(tag_values_of(&reparsed)
        .iter()
        .any(|(name, value)| name == "TITLE" && value == "A Rewritten Title"));
}

#[test]
fn rewrite_preserves_track_bytes_and_segment_count() {
    let dir = tempfile::tempdir().unwrap();
    let opts = FixtureOptions {
        cues_before: true,
        padding: 0,
        ..FixtureOptions::default()
    };
    let bytes = fixture_bytes(&opts, 1);
    let path = write_fixture(dir.path(), "tracks.mkv", &bytes);

    let input_tracks = parse_file(&path).tracks_bytes();

    let mut container = MatroskaContainer::open(&path).unwrap();
    container.parse_header().unwrap();
    container.parse_tags().unwrap();
    let config = WriteConfig {
        force_rewrite: true,
        ..WriteConfig::default()
    };
    container.save(&config, &NoProgress).unwrap();

    let mut parsed = parse_file(&path);
    assert_eq!(parsed.segments.len(), 1);
    assert_eq!(parsed.tracks_bytes(), input_tracks);
}

#[test]
fn multi_segment_rewrite_updates_both_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let opts = FixtureOptions {
        cues_before: true,
        padding: 64,
        ..FixtureOptions::default()
    };
    let bytes = fixture_bytes(&opts, 2);
    let path = write_fixture(dir.path(), "multi.mkv", &bytes);

    let mut container = MatroskaContainer::open(&path).unwrap();
    container.parse_header().unwrap();
    container.parse_tags().unwrap();
    container
        .tags_mut()
        .first_mut()
        .unwrap()
        .set_value("TITLE", "Multi Segment");

    let config = WriteConfig {
        force_rewrite: true,
        ..WriteConfig::default()
    };
    container.save(&config, &NoProgress).unwrap();

    let mut parsed = parse_file(&path);
    assert_eq!(parsed.segments.len(), 2);
    parsed.assert_size_law();
    parsed.assert_seek_head_validity();
    parsed.assert_cue_validity();

    // tags were written into the first segment only
    let first_ids = parsed.child_ids(0);
    let second_ids = parsed.child_ids(1);
    assert!(first_ids.contains(&elements::TAGS));
    assert!(!second_ids.contains(&elements::TAGS));
}

#[test]
fn corrupt_seek_entry_is_reported_and_rewrite_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let opts = FixtureOptions {
        seek_entries: vec![(elements::TAGS, 0xFFF_FFFF)],
        ..FixtureOptions::default()
    };
    let bytes = fixture_bytes(&opts, 1);
    let path = write_fixture(dir.path(), "badseek.mkv", &bytes);

    let mut container = MatroskaContainer::open(&path).unwrap();
    container.parse_header().unwrap();
    let critical: Vec<String> = container
        .notifications()
        .entries()
        .iter()
        .filter(|n| n.severity == Severity::Critical)
        .map(|n| n.message.clone())
        .collect();
    assert!(
        critical.iter().any(|m| m.contains("SeekHead")),
        "expected a critical notification about the bad seek entry, got: {critical:?}"
    );

    container.parse_tags().unwrap();
    assert_eq!(container.tags().len(), 3);

    let config = WriteConfig {
        force_rewrite: true,
        ..WriteConfig::default()
    };
    container.save(&config, &NoProgress).unwrap();

    let mut parsed = parse_file(&path);
    parsed.assert_size_law();
    // the rewritten SeekHead holds only resolvable entries
    parsed.assert_seek_head_validity();
}

#[test]
fn in_place_updates_cluster_positions() {
    let dir = tempfile::tempdir().unwrap();
    let opts = FixtureOptions {
        with_positions: true,
        ..FixtureOptions::default()
    };
    let bytes = fixture_bytes(&opts, 1);
    let path = write_fixture(dir.path(), "positions.mkv", &bytes);

    let mut container = MatroskaContainer::open(&path).unwrap();
    container.parse_header().unwrap();
    container.parse_tags().unwrap();
    container.save(&WriteConfig::default(), &NoProgress).unwrap();

    let mut parsed = parse_file(&path);
    parsed.assert_size_law();
    parsed.assert_cluster_positions();
}

#[test]
fn rewrite_recomputes_cluster_positions_and_prev_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let opts = FixtureOptions {
        with_positions: true,
        cues_before: true,
        padding: 16,
        ..FixtureOptions::default()
    };
    let bytes = fixture_bytes(&opts, 1);
    let path = write_fixture(dir.path(), "positions_rw.mkv", &bytes);

    let mut container = MatroskaContainer::open(&path).unwrap();
    container.parse_header().unwrap();
    container.parse_tags().unwrap();
    let config = WriteConfig {
        force_rewrite: true,
        preferred_padding: 512,
        ..WriteConfig::default()
    };
    container.save(&config, &NoProgress).unwrap();

    let mut parsed = parse_file(&path);
    parsed.assert_size_law();
    parsed.assert_cluster_positions();
    parsed.assert_cue_validity();

    // reparse cleanly: PrevSize values must be consistent again
    let mut reparsed = MatroskaContainer::open(&path).unwrap();
    reparsed.parse_header().unwrap();
    reparsed.validate_index().unwrap();
    assert!(
        !reparsed.notifications().has_critical(),
        "index validation reported: {:?}",
        reparsed.notifications().entries()
    );
}

#[test]
fn save_as_leaves_original_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let opts = FixtureOptions::default();
    let bytes = fixture_bytes(&opts, 1);
    let path = write_fixture(dir.path(), "original.mkv", &bytes);
    let save_path = dir.path().join("copy.mkv");

    let mut container = MatroskaContainer::open(&path).unwrap();
    container.parse_header().unwrap();
    container.parse_tags().unwrap();
    container
        .tags_mut()
        .first_mut()
        .unwrap()
        .set_value("TITLE", "Saved As");

    let config = WriteConfig {
        save_file_path: Some(save_path.clone()),
        ..WriteConfig::default()
    };
    container.save(&config, &NoProgress).unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), bytes);
    assert_eq!(container.file().path(), save_path);

    let mut parsed = parse_file(&save_path);
    parsed.assert_size_law();
    parsed.assert_seek_head_validity();
    parsed.assert_cue_validity();
}

/// Progress sink that requests cancellation once cluster writing starts.
struct AbortAtClusters(Cell<bool>);

impl ProgressSink for AbortAtClusters {
    fn update_status(&self, status: &str) {
        if status == "writing clusters" {
            self.0.set(true);
        }
    }

    fn is_aborted(&self) -> bool {
        self.0.get()
    }
}

#[test]
fn abort_during_cluster_writing_restores_the_original() {
    let dir = tempfile::tempdir().unwrap();
    let opts = FixtureOptions {
        cluster_count: 4,
        cluster_payload: 2000,
        ..FixtureOptions::default()
    };
    let bytes = fixture_bytes(&opts, 1);
    let path = write_fixture(dir.path(), "abort.mkv", &bytes);

    let mut container = MatroskaContainer::open(&path).unwrap();
    container.parse_header().unwrap();
    container.parse_tags().unwrap();

    let config = WriteConfig {
        force_rewrite: true,
        ..WriteConfig::default()
    };
    let progress = AbortAtClusters(Cell::new(false));
    let error = container.save(&config, &progress).unwrap_err();
    assert!(error.is_aborted());

    // bit-for-bit restoration, no backup or partial output left behind
    assert_eq!(std::fs::read(&path).unwrap(), bytes);
    assert!(!dir.path().join("abort.mkv.bak").exists());
}

#[test]
fn title_can_be_set_and_survives_a_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let opts = FixtureOptions::default();
    let bytes = fixture_bytes(&opts, 1);
    let path = write_fixture(dir.path(), "title.mkv", &bytes);

    let mut container = MatroskaContainer::open(&path).unwrap();
    container.parse_header().unwrap();
    container.parse_tags().unwrap();
    container.set_title("A Segment Title");
    let config = WriteConfig {
        force_rewrite: true,
        ..WriteConfig::default()
    };
    container.save(&config, &NoProgress).unwrap();

    let mut reparsed = MatroskaContainer::open(&path).unwrap();
    reparsed.parse_header().unwrap();
    assert_eq!(reparsed.titles(), &["A Segment Title".to_string()]);
}

#[test]
fn forced_tag_position_forces_a_rewrite_when_padding_is_too_small() {
    let dir = tempfile::tempdir().unwrap();
    let opts = FixtureOptions {
        padding: 4,
        ..FixtureOptions::default()
    };
    let bytes = fixture_bytes(&opts, 1);
    let path = write_fixture(dir.path(), "forcedpos.mkv", &bytes);

    let input_cluster_offset = parse_file(&path).first_cluster_offset();

    let mut container = MatroskaContainer::open(&path).unwrap();
    container.parse_header().unwrap();
    container.parse_tags().unwrap();
    let attachment = container.create_attachment();
    attachment.name = "cover.png".to_string();
    attachment.mime_type = "image/png".to_string();
    attachment.data = Some(retag_mkv::AttachmentData::Buffered(vec![0x42; 1024]));

    // pinning the tags in front rules the flip out, so the file must be
    // rewritten
    let config = WriteConfig {
        tag_position: ElementPosition::BeforeData,
        force_tag_position: true,
        index_position: ElementPosition::Keep,
        force_index_position: true,
        preferred_padding: 128,
        ..WriteConfig::default()
    };
    container.save(&config, &NoProgress).unwrap();

    let mut parsed = parse_file(&path);
    parsed.assert_size_law();
    parsed.assert_seek_head_validity();
    parsed.assert_cue_validity();
    let ids = parsed.child_ids(0);
    let tags_index = ids.iter().position(|&id| id == elements::TAGS).unwrap();
    let cluster_index = ids.iter().position(|&id| id == elements::CLUSTER).unwrap();
    assert!(tags_index < cluster_index);
    // the clusters moved: this was a real rewrite
    assert_ne!(parsed.first_cluster_offset(), input_cluster_offset);
}
