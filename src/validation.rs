//! Structural validation of an opened image.
//!
//! Opening an image only fails on damage that prevents decoding. Anomalies the
//! format tolerates, such as overlapping sections or unsorted resource entries,
//! are reported here instead.
//!
//! # Example
//!
//! ```no_run
//! use petree::PEImage;
//!
//! let image = PEImage::from_path("example.exe").unwrap();
//! let issues = image.validate();
//!
//! for issue in &issues {
//!     println!("{issue}");
//! }
//!
//! if issues.has_errors() {
//!     eprintln!("image has structural errors");
//! }
//! ```

use std::fmt;

use crate::data_dir::DataDirectoryKind;
use crate::pe::PEImage;
use crate::reader::ByteSource;
use crate::section::SectionHeader;

/// Severity level of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValidationLevel {
    /// The image loads but looks suspicious.
    Warning,
    /// The image is likely unusable.
    Error,
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationLevel::Warning => write!(f, "Warning"),
            ValidationLevel::Error => write!(f, "Error"),
        }
    }
}

/// Type of validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationCode {
    /// Two sections claim intersecting RVA ranges.
    OverlappingSections,
    /// Non-zero entry point outside every section.
    EntryPointOutsideSections,
    /// A section's raw data extends past the end of the file.
    SectionDataOutsideFile,
    /// A present data directory whose RVA maps to no file offset.
    UnresolvedDataDirectory,
    /// A resource directory whose entries are not in format order.
    UnsortedResourceEntries,
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: ValidationCode,
    pub message: String,
    /// Optional context (e.g., section name, RVA).
    pub context: Option<String>,
}

impl ValidationIssue {
    /// Create a new error.
    pub fn error(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Error,
            code,
            message: message.into(),
            context: None,
        }
    }

    /// Create a new warning.
    pub fn warning(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Warning,
            code,
            message: message.into(),
            context: None,
        }
    }

    /// Add context to the issue.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Check if this is an error.
    pub fn is_error(&self) -> bool {
        self.level == ValidationLevel::Error
    }

    /// Check if this is a warning.
    pub fn is_warning(&self) -> bool {
        self.level == ValidationLevel::Warning
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.level, self.code, self.message)?;
        if let Some(ctx) = &self.context {
            write!(f, " ({})", ctx)?;
        }
        Ok(())
    }
}

/// Collection of validation issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create an empty result.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Add an issue.
    pub fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    /// Check if there are any errors.
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.is_error())
    }

    /// Check if there are any warnings.
    pub fn has_warnings(&self) -> bool {
        self.issues.iter().any(|i| i.is_warning())
    }

    /// Issues with the given code.
    pub fn with_code(&self, code: ValidationCode) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(move |i| i.code == code)
    }

    /// Number of issues.
    pub fn len(&self) -> usize {
        self.issues.len()
    }

    /// Check if no issues were found.
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }
}

impl IntoIterator for ValidationResult {
    type Item = ValidationIssue;
    type IntoIter = std::vec::IntoIter<ValidationIssue>;

    fn into_iter(self) -> Self::IntoIter {
        self.issues.into_iter()
    }
}

impl<'a> IntoIterator for &'a ValidationResult {
    type Item = &'a ValidationIssue;
    type IntoIter = std::slice::Iter<'a, ValidationIssue>;

    fn into_iter(self) -> Self::IntoIter {
        self.issues.iter()
    }
}

fn ranges_overlap(a: &SectionHeader, b: &SectionHeader) -> bool {
    let (a, b) = (a.virtual_range(), b.virtual_range());
    !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end
}

impl<S: ByteSource> PEImage<S> {
    /// Check the decoded model for anomalies that did not prevent opening it.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();
        let sections = self.sections().as_slice();

        for (i, a) in sections.iter().enumerate() {
            for b in &sections[i + 1..] {
                if ranges_overlap(a, b) {
                    result.push(
                        ValidationIssue::warning(
                            ValidationCode::OverlappingSections,
                            "sections overlap in virtual address space",
                        )
                        .with_context(format!("{} and {}", a.name, b.name)),
                    );
                }
            }
            if a.raw_range().end > self.source().len() {
                result.push(
                    ValidationIssue::error(
                        ValidationCode::SectionDataOutsideFile,
                        format!(
                            "raw data ends at {:#x}, file is {:#x} bytes",
                            a.raw_range().end,
                            self.source().len()
                        ),
                    )
                    .with_context(a.name.to_string()),
                );
            }
        }

        let entry = self.entry_point();
        if entry != 0 && self.sections().section_for_rva(entry).is_none() {
            result.push(
                ValidationIssue::warning(
                    ValidationCode::EntryPointOutsideSections,
                    "entry point is not inside any section",
                )
                .with_context(format!("RVA {entry:#x}")),
            );
        }

        for (index, dir) in self.optional_header().data_directories().iter().enumerate() {
            // The certificate table is addressed by file offset, not RVA.
            if !dir.is_present() || index == DataDirectoryKind::Security.as_index() {
                continue;
            }
            if self.rva_to_file_offset(dir.virtual_address).is_none() {
                let name = DataDirectoryKind::from_index(index)
                    .map(|kind| kind.to_string())
                    .unwrap_or_else(|| format!("#{index}"));
                result.push(
                    ValidationIssue::warning(
                        ValidationCode::UnresolvedDataDirectory,
                        format!("{name} directory RVA does not map to file data"),
                    )
                    .with_context(format!("RVA {:#x}", dir.virtual_address)),
                );
            }
        }

        if let Some(tree) = self.resource_tree() {
            let unsorted = tree.directories().filter(|dir| !dir.is_sorted()).count();
            if unsorted > 0 {
                result.push(ValidationIssue::warning(
                    ValidationCode::UnsortedResourceEntries,
                    format!("{unsorted} resource directories store entries out of order"),
                ));
            }
        }

        result
    }
}
