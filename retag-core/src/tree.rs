//! Generic walker over recursive container element structures.
//!
//! Container formats expose a tree of `(identifier, size, payload)` elements.
//! The per-format tree stays monomorphic; this trait is the small dynamic
//! seam a generic walker needs: lazy parsing happens inside the navigation
//! calls, handles are opaque indices.

use crate::error::Result;
use crate::notify::NotificationList;

/// Navigable element structure of one parsed file.
///
/// Navigation parses lazily and therefore may fail; accessors require the
/// handle to have been returned by a successful navigation call.
pub trait ElementStructure {
    /// Handle of the first top-level element, if the file is non-empty.
    fn first(&mut self) -> Result<Option<usize>>;

    /// Handle of the first child, parsing the element first.
    fn first_child(&mut self, handle: usize) -> Result<Option<usize>>;

    /// Handle of the next sibling, parsing the element first.
    fn next_sibling(&mut self, handle: usize) -> Result<Option<usize>>;

    /// Printable identifier of the element.
    fn id_string(&self, handle: usize) -> String;

    /// Start offset of the element in the stream.
    fn start_offset(&self, handle: usize) -> u64;

    /// Total size of the element including its header.
    fn total_size(&self, handle: usize) -> u64;

    /// Whether the element is pure padding.
    fn is_padding(&self, handle: usize) -> bool;
}

/// Walk the whole structure iteratively, recording parse failures as
/// critical notifications while continuing with reachable elements.
///
/// Returns the accumulated total size of padding elements.
pub fn validate_structure(
    structure: &mut dyn ElementStructure,
    notifications: &mut NotificationList,
) -> Result<u64> {
    const CONTEXT: &str = "validating element structure";

    let mut padding = 0u64;
    let mut stack: Vec<usize> = Vec::new();
    match structure.first() {
        Ok(Some(first)) => stack.push(first),
        Ok(None) => return Ok(0),
        Err(error) => {
            notifications.critical(CONTEXT, format!("unable to parse first element: {error}"));
            return Ok(0);
        }
    }

    while let Some(handle) = stack.pop() {
        match structure.first_child(handle) {
            Ok(Some(child)) => stack.push(child),
            Ok(None) => {
                if structure.is_padding(handle) {
                    padding += structure.total_size(handle);
                }
            }
            Err(error) => notifications.critical(
                CONTEXT,
                format!(
                    "unable to parse \"{}\" at {}: {error}",
                    structure.id_string(handle),
                    structure.start_offset(handle)
                ),
            ),
        }
        match structure.next_sibling(handle) {
            Ok(Some(sibling)) => stack.push(sibling),
            Ok(None) => {}
            Err(error) => notifications.critical(
                CONTEXT,
                format!(
                    "unable to parse sibling of element at {}: {error}",
                    structure.start_offset(handle)
                ),
            ),
        }
    }

    Ok(padding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    /// Toy structure: fixed nodes, one of which fails to parse children.
    struct Toy {
        // (first_child, next_sibling, size, padding, child_error)
        nodes: Vec<(Option<usize>, Option<usize>, u64, bool, bool)>,
    }

    impl ElementStructure for Toy {
        fn first(&mut self) -> Result<Option<usize>> {
            Ok(if self.nodes.is_empty() { None } else { Some(0) })
        }

        fn first_child(&mut self, handle: usize) -> Result<Option<usize>> {
            let node = self.nodes[handle];
            if node.4 {
                return Err(Error::parse(0, "bad child"));
            }
            Ok(node.0)
        }

        fn next_sibling(&mut self, handle: usize) -> Result<Option<usize>> {
            Ok(self.nodes[handle].1)
        }

        fn id_string(&self, handle: usize) -> String {
            format!("0x{handle:02X}")
        }

        fn start_offset(&self, handle: usize) -> u64 {
            handle as u64 * 10
        }

        fn total_size(&self, handle: usize) -> u64 {
            self.nodes[handle].2
        }

        fn is_padding(&self, handle: usize) -> bool {
            self.nodes[handle].3
        }
    }

    #[test]
    fn test_padding_accumulation() {
        // root -> [child padding(8), sibling padding(16)]
        let mut toy = Toy {
            nodes: vec![
                (Some(1), Some(2), 100, false, false),
                (None, None, 8, true, false),
                (None, None, 16, true, false),
            ],
        };
        let mut notifications = NotificationList::new();
        let padding = validate_structure(&mut toy, &mut notifications).unwrap();
        assert_eq!(padding, 24);
        assert!(notifications.is_empty());
    }

    #[test]
    fn test_failure_recorded_and_siblings_continue() {
        let mut toy = Toy {
            nodes: vec![
                (None, Some(1), 10, false, true),
                (None, None, 4, true, false),
            ],
        };
        let mut notifications = NotificationList::new();
        let padding = validate_structure(&mut toy, &mut notifications).unwrap();
        assert_eq!(padding, 4);
        assert!(notifications.has_critical());
    }

    #[test]
    fn test_empty_structure() {
        let mut toy = Toy { nodes: vec![] };
        let mut notifications = NotificationList::new();
        assert_eq!(validate_structure(&mut toy, &mut notifications).unwrap(), 0);
    }
}
