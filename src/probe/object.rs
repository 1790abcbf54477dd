//! The object-store probe: enumerate keys beneath a bucket prefix.
//!
//! Uses a blocking opendal operator over a shared tokio runtime. Transient
//! listing failures are retried with jitter inside the operator; directories
//! do not exist in the store and are synthesized downstream from key
//! prefixes.

use std::{collections::HashMap, sync::OnceLock};

use log::trace;
use opendal::{
    layers::{BlockingLayer, ConcurrentLimitLayer, LoggingLayer, RetryLayer},
    BlockingOperator, Metakey, Operator, Scheme,
};
use tokio::runtime::Runtime;

use crate::{
    error::{DuvizError, DuvizResult, ErrorKind},
    probe::{EntryResult, ObjectStoreOptions, Probe, RawEntry},
    snapshot::NodeKind,
    uri::Uri,
};

mod consts {
    /// Default number of retries for transient store failures
    pub(super) const DEFAULT_RETRY: usize = 5;
}

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("failed to build the object-store runtime")
    })
}

/// A [`Probe`] over the keys beneath a bucket prefix.
#[derive(Debug)]
pub struct ObjectProbe {
    root: Uri,
    bucket_root: Uri,
    prefix: String,
    operator: BlockingOperator,
}

impl ObjectProbe {
    /// Create a probe enumerating the keys beneath `root`.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::UnsupportedScheme`] if `root` is not an object URI.
    /// * [`ErrorKind::SourceTransient`] if the operator cannot be built.
    pub fn new(root: &Uri, opts: &ObjectStoreOptions) -> DuvizResult<Self> {
        let (Some(bucket), Some(prefix)) = (root.bucket(), root.object_key()) else {
            return Err(DuvizError::new(
                ErrorKind::UnsupportedScheme,
                "The object probe only enumerates object URIs.",
            )
            .attach_context("uri", root.to_string()));
        };

        let mut map = HashMap::from([
            ("bucket".to_string(), bucket.to_string()),
            ("root".to_string(), "/".to_string()),
        ]);
        if let Some(endpoint) = &opts.endpoint {
            _ = map.insert("endpoint".to_string(), endpoint.clone());
        }
        if let Some(region) = &opts.region {
            _ = map.insert("region".to_string(), region.clone());
        }

        let build_failed = |err: opendal::Error| {
            DuvizError::with_source(
                ErrorKind::SourceTransient,
                "Failed to set up the object-store operator.",
                err,
            )
            .attach_context("bucket", bucket.to_string())
        };

        let mut operator = Operator::via_map(Scheme::S3, map)
            .map_err(build_failed)?
            .layer(
                RetryLayer::new()
                    .with_max_times(opts.retries.unwrap_or(consts::DEFAULT_RETRY))
                    .with_jitter(),
            );
        if let Some(connections) = opts.connections {
            operator = operator.layer(ConcurrentLimitLayer::new(connections));
        }

        let _guard = runtime().enter();
        let operator = operator
            .layer(LoggingLayer::default())
            .layer(BlockingLayer::create().map_err(build_failed)?)
            .blocking();

        let mut bucket_root = root.clone();
        while let Some(parent) = bucket_root.parent() {
            bucket_root = parent;
        }

        Ok(Self {
            root: root.clone(),
            bucket_root,
            prefix,
            operator,
        })
    }
}

impl Probe for ObjectProbe {
    type Iter = std::vec::IntoIter<EntryResult>;

    fn root(&self) -> &Uri {
        &self.root
    }

    fn entries(self) -> DuvizResult<Self::Iter> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        trace!("listing s3 prefix: {prefix}");

        // listing the whole prefix; a failure here means the root is unreadable
        let listed = self
            .operator
            .list_with(&prefix)
            .recursive(true)
            .metakey(Metakey::ContentLength | Metakey::LastModified)
            .call()
            .map_err(|err| {
                let kind = match err.kind() {
                    opendal::ErrorKind::NotFound => ErrorKind::NotFound,
                    opendal::ErrorKind::PermissionDenied => ErrorKind::SourcePermission,
                    _ => ErrorKind::SourceTransient,
                };
                DuvizError::with_source(kind, "Failed to list the bucket prefix.", err)
                    .attach_context("uri", self.root.to_string())
            })?;

        let mut entries: Vec<EntryResult> = Vec::with_capacity(listed.len());
        for entry in listed {
            // directory markers carry no data; real directories are
            // synthesized from the key prefixes downstream
            if !entry.metadata().is_file() {
                continue;
            }
            let mut uri = self.bucket_root.clone();
            let mut bad_key = false;
            for segment in entry.path().split('/').filter(|s| !s.is_empty()) {
                match uri.join(segment) {
                    Ok(joined) => uri = joined,
                    Err(_) => {
                        bad_key = true;
                        break;
                    }
                }
            }
            if bad_key {
                trace!("skipping unrepresentable key: {}", entry.path());
                continue;
            }
            let meta = entry.metadata();
            entries.push(Ok(RawEntry {
                uri,
                kind: NodeKind::File,
                size: meta.content_length(),
                mtime: meta.last_modified().map_or(0, |dt| dt.timestamp()),
            }));
        }

        Ok(entries.into_iter())
    }
}
