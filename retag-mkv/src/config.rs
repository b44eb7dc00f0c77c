//! Configuration surface of the Matroska writer.

use std::path::PathBuf;

/// Where an element group is placed relative to the media data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementPosition {
    /// Before the first Cluster.
    BeforeData,
    /// After the last Cluster.
    AfterData,
    /// Keep the position found in the original file.
    #[default]
    Keep,
}

/// Options recognized by the segment planner/writer.
#[derive(Debug, Clone)]
pub struct WriteConfig {
    /// Desired position of Tags and Attachments.
    pub tag_position: ElementPosition,
    /// Never deviate from `tag_position`, even when that forces a rewrite.
    pub force_tag_position: bool,
    /// Desired position of the Cues.
    pub index_position: ElementPosition,
    /// Never deviate from `index_position`, even when that forces a rewrite.
    pub force_index_position: bool,
    /// Padding to leave before the first Cluster when rewriting.
    pub preferred_padding: u64,
    /// Smallest padding acceptable without a rewrite.
    pub min_padding: u64,
    /// Largest padding acceptable without a rewrite.
    pub max_padding: u64,
    /// Always rewrite the whole file.
    pub force_rewrite: bool,
    /// Write the result to this path instead of replacing the original.
    pub save_file_path: Option<PathBuf>,
    /// Directory for the transient backup file; the original file's
    /// directory when `None`.
    pub backup_directory: Option<PathBuf>,
    /// Upper bound on eager header parsing for huge files.
    pub max_full_parse_size: u64,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            tag_position: ElementPosition::Keep,
            force_tag_position: false,
            index_position: ElementPosition::Keep,
            force_index_position: false,
            preferred_padding: 0,
            min_padding: 0,
            max_padding: u64::MAX,
            force_rewrite: false,
            save_file_path: None,
            backup_directory: None,
            max_full_parse_size: 0x320_0000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WriteConfig::default();
        assert_eq!(config.tag_position, ElementPosition::Keep);
        assert_eq!(config.index_position, ElementPosition::Keep);
        assert!(!config.force_rewrite);
        assert_eq!(config.min_padding, 0);
        assert_eq!(config.max_padding, u64::MAX);
        assert_eq!(config.max_full_parse_size, 0x320_0000);
        assert!(config.save_file_path.is_none());
    }
}
