//! Parse limits and switches.

use crate::section::LOADER_MAX_SECTIONS;

/// Default bound on resource directory nesting.
pub const DEFAULT_MAX_RESOURCE_DEPTH: usize = 32;

/// Options controlling how an image is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOptions {
    /// Deepest resource directory accepted; the root is at depth 1.
    pub max_resource_depth: usize,
    /// Section counts above this that do not fit in the file are reported
    /// as an overflow instead of as truncation.
    pub max_sections: usize,
    /// Build the resource tree at open time.
    pub parse_resources: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            max_resource_depth: DEFAULT_MAX_RESOURCE_DEPTH,
            max_sections: LOADER_MAX_SECTIONS,
            parse_resources: true,
        }
    }
}

impl ParseOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deepest accepted resource directory.
    pub fn with_max_resource_depth(mut self, depth: usize) -> Self {
        self.max_resource_depth = depth;
        self
    }

    /// Set the section count above which a short table is an overflow.
    pub fn with_max_sections(mut self, count: usize) -> Self {
        self.max_sections = count;
        self
    }

    /// Skip the resource directory entirely.
    pub fn headers_only(mut self) -> Self {
        self.parse_resources = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ParseOptions::default();
        assert_eq!(options.max_resource_depth, 32);
        assert_eq!(options.max_sections, 96);
        assert!(options.parse_resources);
    }

    #[test]
    fn test_builder_setters() {
        let options = ParseOptions::new()
            .with_max_resource_depth(4)
            .with_max_sections(16)
            .headers_only();
        assert_eq!(options.max_resource_depth, 4);
        assert_eq!(options.max_sections, 16);
        assert!(!options.parse_resources);
    }
}
