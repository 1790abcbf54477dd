/*!
A library for indexing and querying disk-space usage across heterogeneous
storage namespaces - local POSIX filesystems and object-store buckets.

# Overview

The main type is the [`Service`], which owns all state below one directory:
a SQLite [`Catalog`] of completed scans, a content-addressed [`BlobStore`]
holding each scan as a columnar tree snapshot, and a scheduler that runs
scans as supervised worker subprocesses with live progress and cancellation.

Scans record, per path, the cumulative (allocated) size, modification time,
direct-child count and total-descendant count. Queries combine an ancestor
snapshot with the denormalized aggregates of fresher scans rooted below the
queried path, so a tree can be explored incrementally - and while offline -
without rescanning: [`Service::view`] answers "what do I know about URI X?".

Various `*Options` types configure the service and its probes. They
implement [`serde::Serialize`] and [`serde::Deserialize`], offer setter
methods, and with the `cli` feature double as [`clap`] parsers.

# Example - bring up a service, scan a tree and query it

```no_run
use duviz_core::{Service, ServiceOptions, Uri};

let opts = ServiceOptions::default().root_dir("/var/lib/duviz");
let service = Service::new(opts).unwrap();

// scan a local tree (use start_scan for a supervised background scan)
let uri = Uri::parse("/home/u").unwrap();
let record = service.run_scan_blocking(&uri).unwrap();
println!("{} holds {} bytes", record.root_uri, record.root_size);

// explore a subtree without rescanning
let view = service.view(&Uri::parse("/home/u/docs").unwrap(), 2).unwrap();
for node in &view.nodes {
    println!("{}\t{}", node.size, node.path);
}
```

# Crate features

- **s3** - Object-store probing via `opendal`. *Enabled by default.*
- **cli** - Enables support for CLI features by enabling `clap` and `merge`
  features. *Disabled by default.*
- **clap** - Enables a dependency on the `clap` crate and enables parsing
  the option types from the commandline. *Disabled by default.*
- **merge** - Enables merging multiple values into one via the `conflate`
  dependency, e.g. config files and CLI options. *Disabled by default.*
*/

pub(crate) mod aggregate;
pub(crate) mod blob;
pub(crate) mod catalog;
pub(crate) mod error;
pub(crate) mod id;
pub(crate) mod mutator;
pub(crate) mod planner;
pub(crate) mod probe;
pub(crate) mod progress;
pub(crate) mod scheduler;
pub(crate) mod service;
pub(crate) mod snapshot;
pub(crate) mod uri;
/// The scan worker entry point, used by the `duviz-scan-worker` binary
pub mod worker;

// duviz_core public API
pub use crate::{
    aggregate::{NoObserver, ScanObserver},
    blob::{
        format::ScanIter,
        store::{BlobStore, SnapshotReader},
        NodeFilter,
    },
    catalog::{Catalog, ScanProgress, ScanRecord, ScanStatus},
    error::{DuvizError, DuvizResult, ErrorKind},
    id::{BlobId, HexId, Id},
    mutator::DeleteResult,
    planner::{CompareRow, CompareStatus, Comparison, Patched, View, ViewNode, ViewStatus},
    probe::{
        command::CommandProbe, local::LocalProbe, EntryError, EntryResult, ObjectStoreOptions,
        Probe, ProbeOptions, RawEntry,
    },
    progress::{ProgressFrame, ProgressHub, ProgressSubscriber},
    scheduler::{Job, JobId, JobState, Scheduler},
    service::{BucketInfo, CommandInput, GcStats, RetentionOptions, Service, ServiceOptions},
    snapshot::{Node, NodeKind, Snapshot},
    uri::{Scheme, Uri},
};

#[cfg(feature = "s3")]
pub use crate::probe::object::ObjectProbe;
