//! Origin-qualified names for everything the index can scan.
//!
//! A [`Uri`] addresses either a local filesystem tree (an absolute POSIX
//! path) or an object-store prefix (`s3://bucket/key`). All catalog keys,
//! snapshot rows and API parameters use the canonical form: components
//! separated by single `/`, no trailing slash except for the local scheme
//! root, no `.`/`..` components.

use std::{
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DuvizError, DuvizResult, ErrorKind};

/// The origin a [`Uri`] refers to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Scheme {
    /// A local POSIX filesystem tree
    Local,
    /// An object-store bucket prefix
    S3,
}

/// A canonical, origin-qualified name of a scanned or queried entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uri {
    /// The canonical textual form; identity of the `Uri`.
    canonical: String,
    scheme: Scheme,
    /// Bucket name; set exactly for [`Scheme::S3`].
    bucket: Option<String>,
    /// Path components below the scheme root.
    segments: Vec<String>,
}

impl Uri {
    /// Parse and canonicalize a URI.
    ///
    /// Repeated and trailing slashes are collapsed; `.` and `..` components
    /// are rejected, as are relative local paths and unknown schemes.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::InvalidUri`] if the URI is not well-formed.
    /// * [`ErrorKind::UnsupportedScheme`] for any scheme other than local paths and `s3://`.
    pub fn parse(s: &str) -> DuvizResult<Self> {
        if let Some(rest) = s.strip_prefix("s3://") {
            let mut parts = rest.split('/');
            let bucket = parts.next().unwrap_or_default();
            if bucket.is_empty() {
                return Err(DuvizError::new(
                    ErrorKind::InvalidUri,
                    "Object URIs must name a bucket.",
                )
                .attach_context("uri", s.to_string()));
            }
            let segments = Self::parse_segments(s, parts)?;
            Ok(Self::build(Scheme::S3, Some(bucket.to_string()), segments))
        } else if let Some((scheme, _)) = s.split_once("://") {
            Err(DuvizError::new(
                ErrorKind::UnsupportedScheme,
                "Only local paths and s3:// URIs are supported.",
            )
            .attach_context("scheme", scheme.to_string()))
        } else if let Some(rest) = s.strip_prefix('/') {
            let segments = Self::parse_segments(s, rest.split('/'))?;
            Ok(Self::build(Scheme::Local, None, segments))
        } else {
            Err(DuvizError::new(
                ErrorKind::InvalidUri,
                "Local URIs must be absolute paths.",
            )
            .attach_context("uri", s.to_string()))
        }
    }

    fn parse_segments<'a>(
        uri: &str,
        parts: impl Iterator<Item = &'a str>,
    ) -> DuvizResult<Vec<String>> {
        let mut segments = Vec::new();
        for part in parts {
            match part {
                // collapsed double or trailing slash
                "" => {}
                "." | ".." => {
                    return Err(DuvizError::new(
                        ErrorKind::InvalidUri,
                        "URIs must not contain `.` or `..` components.",
                    )
                    .attach_context("uri", uri.to_string()));
                }
                seg => segments.push(seg.to_string()),
            }
        }
        Ok(segments)
    }

    fn build(scheme: Scheme, bucket: Option<String>, segments: Vec<String>) -> Self {
        let mut canonical = match (&scheme, &bucket) {
            (Scheme::S3, Some(bucket)) => format!("s3://{bucket}"),
            _ => String::new(),
        };
        if segments.is_empty() && scheme == Scheme::Local {
            canonical.push('/');
        }
        for seg in &segments {
            canonical.push('/');
            canonical.push_str(seg);
        }
        Self {
            canonical,
            scheme,
            bucket,
            segments,
        }
    }

    /// The canonical textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The scheme of this URI.
    #[must_use]
    pub const fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The bucket, for object URIs.
    #[must_use]
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Path components below the scheme root.
    ///
    /// The local root `/` and a bare bucket have no components.
    #[must_use]
    pub fn components(&self) -> &[String] {
        &self.segments
    }

    /// Number of components below the scheme root.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Whether this is a scheme root (`/` or a bare bucket).
    #[must_use]
    pub fn is_scheme_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The last component, or the whole root name for scheme roots.
    #[must_use]
    pub fn name(&self) -> &str {
        self.segments
            .last()
            .map_or_else(|| self.canonical.as_str(), String::as_str)
    }

    /// The parent URI; `None` at the scheme root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        let mut segments = self.segments.clone();
        _ = segments.pop();
        Some(Self::build(self.scheme, self.bucket.clone(), segments))
    }

    /// This URI and all its ancestors up to the scheme root, closest first.
    #[must_use]
    pub fn self_and_ancestors(&self) -> Vec<Self> {
        let mut out = vec![self.clone()];
        let mut cur = self.clone();
        while let Some(parent) = cur.parent() {
            out.push(parent.clone());
            cur = parent;
        }
        out
    }

    /// Whether `other` lies at or below this URI, on `/` boundaries.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.bucket == other.bucket
            && other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// The `/`-joined path of `other` relative to this URI.
    ///
    /// Returns `"."` when both are equal, `None` when `other` is not at or
    /// below this URI.
    #[must_use]
    pub fn rel_path_of(&self, other: &Self) -> Option<String> {
        if !self.is_ancestor_of(other) {
            return None;
        }
        let rest = &other.segments[self.segments.len()..];
        if rest.is_empty() {
            Some(".".to_string())
        } else {
            Some(rest.join("/"))
        }
    }

    /// Append a single child component.
    ///
    /// # Errors
    ///
    /// * If the component is empty or contains a `/`.
    pub fn join(&self, name: &str) -> DuvizResult<Self> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(DuvizError::new(
                ErrorKind::InvalidUri,
                "URI components must be non-empty and must not contain `/`.",
            )
            .attach_context("component", name.to_string()));
        }
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self::build(self.scheme, self.bucket.clone(), segments))
    }

    /// The local filesystem path, for local URIs.
    #[must_use]
    pub fn to_local_path(&self) -> Option<PathBuf> {
        match self.scheme {
            Scheme::Local => Some(PathBuf::from(&self.canonical)),
            Scheme::S3 => None,
        }
    }

    /// The key prefix below the bucket, for object URIs (`""` for a bare bucket).
    #[must_use]
    pub fn object_key(&self) -> Option<String> {
        match self.scheme {
            Scheme::Local => None,
            Scheme::S3 => Some(self.segments.join("/")),
        }
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for Uri {
    type Err = Box<DuvizError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Uri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("/", "/")]
    #[case("/home/u", "/home/u")]
    #[case("/home//u/", "/home/u")]
    #[case("s3://bucket", "s3://bucket")]
    #[case("s3://bucket/", "s3://bucket")]
    #[case("s3://bucket/a//b/", "s3://bucket/a/b")]
    fn test_canonicalization(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(Uri::parse(input).unwrap().as_str(), expected);
    }

    #[rstest]
    #[case("relative/path")]
    #[case("")]
    #[case("/a/./b")]
    #[case("/a/../b")]
    #[case("s3://")]
    fn test_invalid_uris(#[case] input: &str) {
        let err = Uri::parse(input).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUri);
    }

    #[test]
    fn test_unknown_scheme() {
        let err = Uri::parse("gs://bucket/key").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedScheme);
    }

    #[test]
    fn test_parent_is_total_except_at_root() {
        let uri = Uri::parse("/a/b").unwrap();
        assert_eq!(uri.parent().unwrap().as_str(), "/a");
        assert_eq!(uri.parent().unwrap().parent().unwrap().as_str(), "/");
        assert!(Uri::parse("/").unwrap().parent().is_none());

        let obj = Uri::parse("s3://b/k").unwrap();
        assert_eq!(obj.parent().unwrap().as_str(), "s3://b");
        assert!(obj.parent().unwrap().parent().is_none());
    }

    #[rstest]
    #[case("/a", "/a/b/c", true)]
    #[case("/a", "/a", true)]
    #[case("/", "/a", true)]
    #[case("/a", "/ab", false)]
    #[case("/a/b", "/a", false)]
    #[case("s3://b", "s3://b/k", true)]
    #[case("s3://b", "s3://c/k", false)]
    fn test_ancestor_on_slash_boundaries(
        #[case] anc: &str,
        #[case] desc: &str,
        #[case] expected: bool,
    ) {
        let anc = Uri::parse(anc).unwrap();
        let desc = Uri::parse(desc).unwrap();
        assert_eq!(anc.is_ancestor_of(&desc), expected);
    }

    #[test]
    fn test_rel_path() {
        let base = Uri::parse("/home/u").unwrap();
        assert_eq!(base.rel_path_of(&base).unwrap(), ".");
        assert_eq!(
            base.rel_path_of(&Uri::parse("/home/u/docs/a").unwrap())
                .unwrap(),
            "docs/a"
        );
        assert!(base.rel_path_of(&Uri::parse("/home/v").unwrap()).is_none());
    }

    #[test]
    fn test_self_and_ancestors_closest_first() {
        let uri = Uri::parse("/a/b/c").unwrap();
        let chain: Vec<String> = uri
            .self_and_ancestors()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(chain, ["/a/b/c", "/a/b", "/a", "/"]);
    }

    #[test]
    fn test_join_rejects_separators() {
        let base = Uri::parse("/a").unwrap();
        assert_eq!(base.join("b").unwrap().as_str(), "/a/b");
        assert!(base.join("b/c").is_err());
        assert!(base.join("").is_err());
    }

    #[test]
    fn test_depth_counts_components() {
        assert_eq!(Uri::parse("/").unwrap().depth(), 0);
        assert_eq!(Uri::parse("/a/b").unwrap().depth(), 2);
        assert_eq!(Uri::parse("s3://b").unwrap().depth(), 0);
        assert_eq!(Uri::parse("s3://b/k/l").unwrap().depth(), 2);
    }

    #[test]
    fn test_serde_round_trip() {
        let uri = Uri::parse("s3://b/k").unwrap();
        let json = serde_json::to_string(&uri).unwrap();
        assert_eq!(json, "\"s3://b/k\"");
        let back: Uri = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uri);
    }
}
