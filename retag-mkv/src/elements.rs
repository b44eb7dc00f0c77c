//! Matroska/EBML element definitions.
//!
//! Element IDs are stored with their VINT width marker included, so the
//! constants below compare directly against parsed identifiers.

// =============================================================================
// EBML Header Elements
// =============================================================================

/// EBML Header element.
pub const EBML: u32 = 0x1A45DFA3;
/// EBML Version.
pub const EBML_VERSION: u32 = 0x4286;
/// EBML Read Version.
pub const EBML_READ_VERSION: u32 = 0x42F7;
/// EBML Max ID Length.
pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
/// EBML Max Size Length.
pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
/// EBML Doc Type.
pub const DOC_TYPE: u32 = 0x4282;
/// EBML Doc Type Version.
pub const DOC_TYPE_VERSION: u32 = 0x4287;
/// EBML Doc Type Read Version.
pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

// =============================================================================
// Segment
// =============================================================================

/// Segment (the root container for all Matroska data).
pub const SEGMENT: u32 = 0x18538067;

// =============================================================================
// Meta Seek Information
// =============================================================================

/// SeekHead (index of top-level elements).
pub const SEEK_HEAD: u32 = 0x114D9B74;
/// Seek entry.
pub const SEEK: u32 = 0x4DBB;
/// Seek ID.
pub const SEEK_ID: u32 = 0x53AB;
/// Seek Position.
pub const SEEK_POSITION: u32 = 0x53AC;

// =============================================================================
// Segment Information
// =============================================================================

/// Segment Info.
pub const INFO: u32 = 0x1549A966;
/// Segment UID.
pub const SEGMENT_UID: u32 = 0x73A4;
/// Segment Filename.
pub const SEGMENT_FILENAME: u32 = 0x7384;
/// Timecode Scale (nanoseconds per timecode unit, default 1000000 = 1ms).
pub const TIMECODE_SCALE: u32 = 0x2AD7B1;
/// Duration (in timecode units).
pub const DURATION: u32 = 0x4489;
/// Date UTC.
pub const DATE_UTC: u32 = 0x4461;
/// Title.
pub const TITLE: u32 = 0x7BA9;
/// Muxing App.
pub const MUXING_APP: u32 = 0x4D80;
/// Writing App.
pub const WRITING_APP: u32 = 0x5741;

// =============================================================================
// Cluster Elements
// =============================================================================

/// Cluster (contains blocks of media data).
pub const CLUSTER: u32 = 0x1F43B675;
/// Cluster Timestamp.
pub const TIMESTAMP: u32 = 0xE7;
/// Silent Tracks.
pub const SILENT_TRACKS: u32 = 0x5854;
/// Position (cluster position in segment).
pub const POSITION: u32 = 0xA7;
/// Previous Size (size of previous cluster).
pub const PREV_SIZE: u32 = 0xAB;
/// SimpleBlock.
pub const SIMPLE_BLOCK: u32 = 0xA3;
/// BlockGroup.
pub const BLOCK_GROUP: u32 = 0xA0;
/// Block.
pub const BLOCK: u32 = 0xA1;

// =============================================================================
// Track Elements
// =============================================================================

/// Tracks.
pub const TRACKS: u32 = 0x1654AE6B;
/// Track Entry.
pub const TRACK_ENTRY: u32 = 0xAE;

// =============================================================================
// Cueing Data
// =============================================================================

/// Cues.
pub const CUES: u32 = 0x1C53BB6B;
/// Cue Point.
pub const CUE_POINT: u32 = 0xBB;
/// Cue Time.
pub const CUE_TIME: u32 = 0xB3;
/// Cue Track Positions.
pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
/// Cue Track.
pub const CUE_TRACK: u32 = 0xF7;
/// Cue Cluster Position.
pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
/// Cue Relative Position.
pub const CUE_RELATIVE_POSITION: u32 = 0xF0;
/// Cue Duration.
pub const CUE_DURATION: u32 = 0xB2;
/// Cue Block Number.
pub const CUE_BLOCK_NUMBER: u32 = 0x5378;

// =============================================================================
// Attachment Elements
// =============================================================================

/// Attachments.
pub const ATTACHMENTS: u32 = 0x1941A469;
/// Attached File.
pub const ATTACHED_FILE: u32 = 0x61A7;
/// File Description.
pub const FILE_DESCRIPTION: u32 = 0x467E;
/// File Name.
pub const FILE_NAME: u32 = 0x466E;
/// File Media Type.
pub const FILE_MEDIA_TYPE: u32 = 0x4660;
/// File Data.
pub const FILE_DATA: u32 = 0x465C;
/// File UID.
pub const FILE_UID: u32 = 0x46AE;

// =============================================================================
// Chapters
// =============================================================================

/// Chapters.
pub const CHAPTERS: u32 = 0x1043A770;
/// Edition Entry.
pub const EDITION_ENTRY: u32 = 0x45B9;
/// Chapter Atom.
pub const CHAPTER_ATOM: u32 = 0xB6;
/// Chapter Display.
pub const CHAPTER_DISPLAY: u32 = 0x80;

// =============================================================================
// Tagging
// =============================================================================

/// Tags.
pub const TAGS: u32 = 0x1254C367;
/// Tag.
pub const TAG: u32 = 0x7373;
/// Targets.
pub const TARGETS: u32 = 0x63C0;
/// Target Type Value.
pub const TARGET_TYPE_VALUE: u32 = 0x68CA;
/// Target Type.
pub const TARGET_TYPE: u32 = 0x63CA;
/// Tag Track UID.
pub const TAG_TRACK_UID: u32 = 0x63C5;
/// Tag Edition UID.
pub const TAG_EDITION_UID: u32 = 0x63C9;
/// Tag Chapter UID.
pub const TAG_CHAPTER_UID: u32 = 0x63C4;
/// Tag Attachment UID.
pub const TAG_ATTACHMENT_UID: u32 = 0x63C6;
/// Simple Tag.
pub const SIMPLE_TAG: u32 = 0x67C8;
/// Tag Name.
pub const TAG_NAME: u32 = 0x45A3;
/// Tag Language.
pub const TAG_LANGUAGE: u32 = 0x447A;
/// Tag Default.
pub const TAG_DEFAULT: u32 = 0x4484;
/// Tag String.
pub const TAG_STRING: u32 = 0x4487;
/// Tag Binary.
pub const TAG_BINARY: u32 = 0x4485;

// =============================================================================
// Void and CRC
// =============================================================================

/// Void (padding).
pub const VOID: u32 = 0xEC;
/// CRC-32.
pub const CRC32: u32 = 0xBF;

/// Element type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// Master element (contains other elements).
    Master,
    /// Unsigned integer.
    UnsignedInt,
    /// Floating point.
    Float,
    /// UTF-8 string.
    String,
    /// Binary data.
    Binary,
    /// Date (nanoseconds since 2001-01-01).
    Date,
}

/// Get the type of a known element.
pub fn element_type(id: u32) -> Option<ElementType> {
    match id {
        // Master elements
        EBML | SEGMENT | SEEK_HEAD | SEEK | INFO | TRACKS | TRACK_ENTRY | CLUSTER
        | BLOCK_GROUP | SILENT_TRACKS | CUES | CUE_POINT | CUE_TRACK_POSITIONS | CHAPTERS
        | EDITION_ENTRY | CHAPTER_ATOM | CHAPTER_DISPLAY | TAGS | TAG | TARGETS | SIMPLE_TAG
        | ATTACHMENTS | ATTACHED_FILE => Some(ElementType::Master),

        // Unsigned integers
        EBML_VERSION | EBML_READ_VERSION | EBML_MAX_ID_LENGTH | EBML_MAX_SIZE_LENGTH
        | DOC_TYPE_VERSION | DOC_TYPE_READ_VERSION | TIMECODE_SCALE | TIMESTAMP | POSITION
        | PREV_SIZE | CUE_TIME | CUE_TRACK | CUE_CLUSTER_POSITION | CUE_RELATIVE_POSITION
        | CUE_DURATION | CUE_BLOCK_NUMBER | TARGET_TYPE_VALUE | TAG_TRACK_UID
        | TAG_EDITION_UID | TAG_CHAPTER_UID | TAG_ATTACHMENT_UID | TAG_DEFAULT | FILE_UID
        | SEEK_POSITION => Some(ElementType::UnsignedInt),

        // Floats
        DURATION => Some(ElementType::Float),

        // Strings
        DOC_TYPE | SEGMENT_FILENAME | TITLE | MUXING_APP | WRITING_APP | FILE_NAME
        | FILE_MEDIA_TYPE | FILE_DESCRIPTION | TARGET_TYPE | TAG_NAME | TAG_LANGUAGE
        | TAG_STRING => Some(ElementType::String),

        // Binary
        SEGMENT_UID | SEEK_ID | SIMPLE_BLOCK | BLOCK | FILE_DATA | TAG_BINARY | CRC32
        | VOID => Some(ElementType::Binary),

        // Date
        DATE_UTC => Some(ElementType::Date),

        _ => None,
    }
}

/// Check if an element is a master element (container).
///
/// Unknown elements are treated as leaves so lazy parsing never descends
/// into payloads it cannot interpret.
pub fn is_master_element(id: u32) -> bool {
    element_type(id) == Some(ElementType::Master)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_ids() {
        assert_eq!(EBML, 0x1A45DFA3);
        assert_eq!(SEGMENT, 0x18538067);
        assert_eq!(SEEK_HEAD, 0x114D9B74);
        assert_eq!(CLUSTER, 0x1F43B675);
        assert_eq!(TRACKS, 0x1654AE6B);
        assert_eq!(CUES, 0x1C53BB6B);
        assert_eq!(ATTACHMENTS, 0x1941A469);
        assert_eq!(TAGS, 0x1254C367);
        assert_eq!(POSITION, 0xA7);
        assert_eq!(PREV_SIZE, 0xAB);
        assert_eq!(CRC32, 0xBF);
        assert_eq!(VOID, 0xEC);
    }

    #[test]
    fn test_element_types() {
        assert_eq!(element_type(SEGMENT), Some(ElementType::Master));
        assert_eq!(element_type(POSITION), Some(ElementType::UnsignedInt));
        assert_eq!(element_type(DURATION), Some(ElementType::Float));
        assert_eq!(element_type(TITLE), Some(ElementType::String));
        assert_eq!(element_type(SIMPLE_BLOCK), Some(ElementType::Binary));
        assert_eq!(element_type(DATE_UTC), Some(ElementType::Date));
        assert_eq!(element_type(0x12345678), None);
    }

    #[test]
    fn test_is_master_element() {
        assert!(is_master_element(SEGMENT));
        assert!(is_master_element(CLUSTER));
        assert!(is_master_element(SIMPLE_TAG));
        assert!(!is_master_element(SIMPLE_BLOCK));
        assert!(!is_master_element(VOID));
        assert!(!is_master_element(CRC32));
        // unknown elements stay leaves
        assert!(!is_master_element(0x12345678));
    }
}
