//! Error types and Result module.

use std::{
    backtrace::Backtrace,
    fmt::{self, Display},
};

/// Result type that is being returned from methods that can fail and thus have [`DuvizError`]s.
pub type DuvizResult<T, E = Box<DuvizError>> = Result<T, E>;

/// Errors that can result from duviz.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub struct DuvizError {
    /// The kind of the error.
    kind: ErrorKind,

    /// Chain to the cause of the error.
    source: Option<Box<(dyn std::error::Error + Send + Sync)>>,

    /// The error message with guidance.
    guidance: String,

    /// The context of the error.
    context: Vec<(&'static str, String)>,

    /// Backtrace of the error.
    ///
    // Need to use option, otherwise thiserror will not be able to derive the Error trait.
    backtrace: Option<Backtrace>,
}

impl Display for DuvizError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.guidance)?;

        if !self.context.is_empty() {
            write!(
                f,
                " ({})",
                self.context
                    .iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )?;
        }

        if let Some(cause) = &self.source {
            write!(f, "\n\nCaused by: {cause}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            write!(f, "\n\nBacktrace:\n{backtrace:?}")?;
        }

        Ok(())
    }
}

impl DuvizError {
    /// Creates a new error with the given kind and guidance.
    pub fn new(kind: ErrorKind, guidance: impl Into<String>) -> Box<Self> {
        Box::new(Self {
            kind,
            guidance: guidance.into(),
            context: Vec::new(),
            source: None,
            // `Backtrace::capture()` will check if backtrace has been enabled
            // internally. It's zero cost if backtrace is disabled.
            backtrace: Some(Backtrace::capture()),
        })
    }

    /// Creates a new error with the given kind, guidance and source error.
    pub fn with_source(
        kind: ErrorKind,
        guidance: impl Into<String>,
        source: impl Into<Box<(dyn std::error::Error + Send + Sync)>>,
    ) -> Box<Self> {
        Box::new(Self {
            kind,
            guidance: guidance.into(),
            context: Vec::new(),
            source: Some(source.into()),
            backtrace: Some(Backtrace::capture()),
        })
    }

    /// Attach context to the error.
    ///
    /// Can be called multiple times; contexts accumulate.
    pub fn attach_context(mut self: Box<Self>, key: &'static str, value: impl Into<String>) -> Box<Self> {
        self.context.push((key, value.into()));
        self
    }

    /// Expose the inner error kind.
    ///
    /// This is useful for matching on the error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable message without the error chain.
    #[must_use]
    pub fn guidance(&self) -> &str {
        &self.guidance
    }

    /// Checks if the error has the given kind.
    #[must_use]
    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

/// [`ErrorKind`] describes the errors that can happen while executing a high-level command.
///
/// The kinds are the stable, machine-readable error taxonomy; API error bodies
/// carry [`ErrorKind::api_kind`] next to the human-readable message.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, displaydoc::Display)]
pub enum ErrorKind {
    /// No scan covers the requested URI
    NotFound,
    /// Scheme is not supported for this operation
    UnsupportedScheme,
    /// URI is not well-formed
    InvalidUri,
    /// Permission denied while reading the source
    SourcePermission,
    /// Transient I/O failure while reading the source
    SourceTransient,
    /// Snapshot blob is corrupt or unreadable
    BlobCorrupt,
    /// Conflicting concurrent access to the catalog
    CatalogConflict,
    /// Operation was aborted
    Aborted,
    /// Internal Error
    Internal,
}

impl ErrorKind {
    /// The wire name of this kind, as used in API error bodies.
    #[must_use]
    pub const fn api_kind(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::InvalidUri => "invalid_uri",
            Self::SourcePermission => "source_permission",
            Self::SourceTransient => "source_transient",
            Self::BlobCorrupt => "blob_corrupt",
            Self::CatalogConflict => "catalog_conflict",
            Self::Aborted => "aborted",
            Self::Internal => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_kind_and_context() {
        let err = DuvizError::new(ErrorKind::InvalidUri, "URI must be absolute.")
            .attach_context("uri", "foo/bar");

        let msg = err.to_string();

        assert!(msg.contains("URI must be absolute."));
        assert!(msg.contains("uri: foo/bar"));
        assert_eq!(err.kind(), ErrorKind::InvalidUri);
    }

    #[test]
    fn test_api_kind_is_stable() {
        assert_eq!(ErrorKind::NotFound.api_kind(), "not_found");
        assert_eq!(ErrorKind::UnsupportedScheme.api_kind(), "unsupported_scheme");
        assert_eq!(ErrorKind::CatalogConflict.api_kind(), "catalog_conflict");
    }
}
