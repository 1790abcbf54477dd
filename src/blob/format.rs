//! The columnar snapshot file format.
//!
//! Layout: a header (root uri, completion time, error summary), then one
//! storage group per depth level, then a footer indexing the groups, then the
//! footer offset as a trailing little-endian u64. Each group holds the seven
//! node columns as independently zstd-compressed chunks; `depth` is the group
//! key. Rows inside a group keep their `(depth, uri)` snapshot order, so
//! reading the leading groups yields exactly the depth-bounded prefix.

use std::{
    collections::VecDeque,
    io::{Cursor, Seek, SeekFrom, Write},
};

use binrw::{binrw, BinRead, BinReaderExt, BinWrite};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::{
    blob::NodeFilter,
    error::{DuvizError, DuvizResult, ErrorKind},
    snapshot::{Node, NodeKind, Snapshot},
    uri::Uri,
};

pub(crate) mod constants {
    /// Format version written into the header
    pub(crate) const VERSION: u32 = 1;
    /// Compression level for column chunks
    pub(crate) const ZSTD_LEVEL: i32 = 3;
}

fn corrupt(what: &str) -> Box<DuvizError> {
    DuvizError::new(ErrorKind::BlobCorrupt, "Snapshot blob is not readable.")
        .attach_context("detail", what.to_string())
}

fn corrupt_src(what: &'static str) -> impl FnOnce(binrw::Error) -> Box<DuvizError> {
    move |err| {
        DuvizError::with_source(ErrorKind::BlobCorrupt, "Snapshot blob is not readable.", err)
            .attach_context("detail", what)
    }
}

fn encode_failed(err: impl std::error::Error + Send + Sync + 'static) -> Box<DuvizError> {
    DuvizError::with_source(ErrorKind::Internal, "Failed to encode snapshot blob.", err)
}

#[binrw]
#[brw(little)]
#[derive(Clone)]
struct BinString {
    #[bw(try_calc(u32::try_from(bytes.len())))]
    #[br(temp)]
    len: u32,
    #[br(count = len)]
    bytes: Vec<u8>,
}

impl BinString {
    fn new(s: &str) -> Self {
        Self {
            bytes: s.as_bytes().to_vec(),
        }
    }

    fn into_string(self) -> DuvizResult<String> {
        String::from_utf8(self.bytes).map_err(|_| corrupt("non-utf8 string"))
    }
}

#[binrw]
#[brw(little, magic = b"DUVZBLOB")]
struct Header {
    version: u32,
    completed_at_micros: i64,
    error_count: u64,
    root: BinString,
    #[bw(try_calc(u32::try_from(error_paths.len())))]
    #[br(temp)]
    n_error_paths: u32,
    #[br(count = n_error_paths)]
    error_paths: Vec<BinString>,
}

/// Location of one compressed column chunk inside the file.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, Default)]
struct Chunk {
    offset: u64,
    len: u64,
}

/// Footer entry describing one storage group.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Default)]
struct GroupEntry {
    /// Depth of all rows in this group; the groups are depth-ascending
    depth: u32,
    rows: u64,
    uri: Chunk,
    kind: Chunk,
    size: Chunk,
    mtime: Chunk,
    parent: Chunk,
    n_children: Chunk,
    n_desc: Chunk,
}

#[binrw]
#[brw(little, magic = b"DVZFOOT!")]
struct Footer {
    #[bw(try_calc(u32::try_from(groups.len())))]
    #[br(temp)]
    n_groups: u32,
    #[br(count = n_groups)]
    groups: Vec<GroupEntry>,
}

#[binrw]
#[brw(little)]
struct StrColumn {
    #[bw(try_calc(u64::try_from(items.len())))]
    #[br(temp)]
    count: u64,
    #[br(count = count)]
    items: Vec<BinString>,
}

#[binrw]
#[brw(little)]
struct U64Column {
    #[bw(try_calc(u64::try_from(vals.len())))]
    #[br(temp)]
    count: u64,
    #[br(count = count)]
    vals: Vec<u64>,
}

#[binrw]
#[brw(little)]
struct I64Column {
    #[bw(try_calc(u64::try_from(vals.len())))]
    #[br(temp)]
    count: u64,
    #[br(count = count)]
    vals: Vec<i64>,
}

#[binrw]
#[brw(little)]
struct U32Column {
    #[bw(try_calc(u64::try_from(vals.len())))]
    #[br(temp)]
    count: u64,
    #[br(count = count)]
    vals: Vec<u32>,
}

#[binrw]
#[brw(little)]
struct ByteColumn {
    #[bw(try_calc(u64::try_from(vals.len())))]
    #[br(temp)]
    count: u64,
    #[br(count = count)]
    vals: Vec<u8>,
}

macro_rules! column_bytes {
    ($col:expr) => {{
        let mut cursor = Cursor::new(Vec::new());
        $col.write(&mut cursor).map_err(encode_failed)?;
        cursor.into_inner()
    }};
}

/// Serialize a snapshot into its columnar file bytes.
pub(crate) fn encode(snapshot: &Snapshot) -> DuvizResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());

    let header = Header {
        version: constants::VERSION,
        completed_at_micros: snapshot.completed_at.timestamp_micros(),
        error_count: snapshot.error_count,
        root: BinString::new(snapshot.root_uri.as_str()),
        error_paths: snapshot
            .error_paths
            .iter()
            .map(|p| BinString::new(p))
            .collect(),
    };
    header.write(&mut cursor).map_err(encode_failed)?;

    let mut groups: Vec<GroupEntry> = Vec::new();
    let nodes = snapshot.nodes();
    let mut start = 0;
    while start < nodes.len() {
        let depth = nodes[start].depth;
        let end = start
            + nodes[start..]
                .iter()
                .take_while(|n| n.depth == depth)
                .count();
        let rows = &nodes[start..end];

        let mut write_chunk = |bytes: Vec<u8>| -> DuvizResult<Chunk> {
            let compressed =
                zstd::encode_all(&bytes[..], constants::ZSTD_LEVEL).map_err(encode_failed)?;
            let offset = cursor.position();
            cursor.write_all(&compressed).map_err(encode_failed)?;
            Ok(Chunk {
                offset,
                len: compressed.len() as u64,
            })
        };

        let entry = GroupEntry {
            depth,
            rows: rows.len() as u64,
            uri: write_chunk(column_bytes!(StrColumn {
                items: rows.iter().map(|n| BinString::new(&n.uri)).collect(),
            }))?,
            kind: write_chunk(column_bytes!(ByteColumn {
                vals: rows.iter().map(|n| n.kind.as_u8()).collect(),
            }))?,
            size: write_chunk(column_bytes!(U64Column {
                vals: rows.iter().map(|n| n.size).collect(),
            }))?,
            mtime: write_chunk(column_bytes!(I64Column {
                vals: rows.iter().map(|n| n.mtime).collect(),
            }))?,
            parent: write_chunk(column_bytes!(StrColumn {
                items: rows
                    .iter()
                    .map(|n| BinString::new(n.parent.as_deref().unwrap_or_default()))
                    .collect(),
            }))?,
            n_children: write_chunk(column_bytes!(U32Column {
                vals: rows.iter().map(|n| n.n_children).collect(),
            }))?,
            n_desc: write_chunk(column_bytes!(U64Column {
                vals: rows.iter().map(|n| n.n_desc).collect(),
            }))?,
        };
        groups.push(entry);
        start = end;
    }

    let footer_offset = cursor.position();
    Footer { groups }.write(&mut cursor).map_err(encode_failed)?;
    footer_offset.write_le(&mut cursor).map_err(encode_failed)?;

    Ok(cursor.into_inner())
}

/// A parsed blob file, ready for predicate scans.
#[derive(Debug)]
pub(crate) struct BlobFile {
    bytes: Bytes,
    root_uri: Uri,
    completed_at: DateTime<Utc>,
    error_count: u64,
    error_paths: Vec<String>,
    groups: Vec<GroupEntry>,
}

impl BlobFile {
    /// Parse the header and footer; column chunks stay untouched until scanned.
    pub(crate) fn parse(bytes: Bytes) -> DuvizResult<Self> {
        if bytes.len() < 8 {
            return Err(corrupt("file too short"));
        }
        let mut cursor = Cursor::new(bytes.as_ref());

        let header = Header::read(&mut cursor).map_err(corrupt_src("header"))?;
        if header.version != constants::VERSION {
            return Err(corrupt("unsupported version"));
        }

        _ = cursor
            .seek(SeekFrom::End(-8))
            .map_err(|_| corrupt("footer offset"))?;
        let footer_offset: u64 = cursor.read_le().map_err(corrupt_src("footer offset"))?;
        if footer_offset >= bytes.len() as u64 - 8 {
            return Err(corrupt("footer offset out of bounds"));
        }
        _ = cursor
            .seek(SeekFrom::Start(footer_offset))
            .map_err(|_| corrupt("footer seek"))?;
        let footer = Footer::read(&mut cursor).map_err(corrupt_src("footer"))?;

        let root_str = header.root.into_string()?;
        let root_uri = Uri::parse(&root_str).map_err(|_| corrupt("root uri"))?;
        let completed_at = Utc
            .timestamp_micros(header.completed_at_micros)
            .single()
            .ok_or_else(|| corrupt("completion timestamp"))?;
        let error_paths = header
            .error_paths
            .into_iter()
            .map(BinString::into_string)
            .collect::<DuvizResult<Vec<_>>>()?;

        Ok(Self {
            bytes,
            root_uri,
            completed_at,
            error_count: header.error_count,
            error_paths,
            groups: footer.groups,
        })
    }

    pub(crate) fn root_uri(&self) -> &Uri {
        &self.root_uri
    }

    pub(crate) fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub(crate) fn error_count(&self) -> u64 {
        self.error_count
    }

    pub(crate) fn error_paths(&self) -> &[String] {
        &self.error_paths
    }

    /// Lazily scan the rows matching `filter`, group by group.
    pub(crate) fn scan(&self, filter: &NodeFilter) -> ScanIter<'_> {
        ScanIter {
            file: self,
            filter: filter.clone(),
            next_group: 0,
            buffer: VecDeque::new(),
            failed: false,
        }
    }

    /// Reassemble the full snapshot, e.g. for a repair rewrite.
    pub(crate) fn to_snapshot(&self) -> DuvizResult<Snapshot> {
        let nodes = self
            .scan(&NodeFilter::default())
            .collect::<DuvizResult<Vec<_>>>()?;
        Ok(Snapshot::from_sorted_nodes(
            self.root_uri.clone(),
            self.completed_at,
            self.error_count,
            self.error_paths.clone(),
            nodes,
        ))
    }

    fn chunk_bytes(&self, chunk: Chunk) -> DuvizResult<Vec<u8>> {
        let start = usize::try_from(chunk.offset).map_err(|_| corrupt("chunk offset"))?;
        let end = start
            .checked_add(usize::try_from(chunk.len).map_err(|_| corrupt("chunk length"))?)
            .ok_or_else(|| corrupt("chunk bounds"))?;
        let raw = self
            .bytes
            .get(start..end)
            .ok_or_else(|| corrupt("chunk out of bounds"))?;
        zstd::decode_all(raw).map_err(|err| {
            DuvizError::with_source(
                ErrorKind::BlobCorrupt,
                "Failed to decompress column chunk.",
                err,
            )
        })
    }

    /// Decode only the uri column of a group.
    fn group_uris(&self, entry: &GroupEntry) -> DuvizResult<Vec<String>> {
        let bytes = self.chunk_bytes(entry.uri)?;
        let col = StrColumn::read(&mut Cursor::new(bytes)).map_err(corrupt_src("uri column"))?;
        col.items.into_iter().map(BinString::into_string).collect()
    }

    /// Decode the remaining columns and assemble the selected rows.
    fn group_rows(
        &self,
        entry: &GroupEntry,
        uris: Vec<String>,
        mask: &[bool],
    ) -> DuvizResult<Vec<Node>> {
        let kinds = ByteColumn::read(&mut Cursor::new(self.chunk_bytes(entry.kind)?))
            .map_err(corrupt_src("kind column"))?;
        let sizes = U64Column::read(&mut Cursor::new(self.chunk_bytes(entry.size)?))
            .map_err(corrupt_src("size column"))?;
        let mtimes = I64Column::read(&mut Cursor::new(self.chunk_bytes(entry.mtime)?))
            .map_err(corrupt_src("mtime column"))?;
        let parents = StrColumn::read(&mut Cursor::new(self.chunk_bytes(entry.parent)?))
            .map_err(corrupt_src("parent column"))?;
        let n_children = U32Column::read(&mut Cursor::new(self.chunk_bytes(entry.n_children)?))
            .map_err(corrupt_src("n_children column"))?;
        let n_desc = U64Column::read(&mut Cursor::new(self.chunk_bytes(entry.n_desc)?))
            .map_err(corrupt_src("n_desc column"))?;

        let rows = usize::try_from(entry.rows).map_err(|_| corrupt("row count"))?;
        if [
            uris.len(),
            kinds.vals.len(),
            sizes.vals.len(),
            mtimes.vals.len(),
            parents.items.len(),
            n_children.vals.len(),
            n_desc.vals.len(),
        ]
        .iter()
        .any(|len| *len != rows)
        {
            return Err(corrupt("column length mismatch"));
        }

        let mut parents = parents
            .items
            .into_iter()
            .map(BinString::into_string)
            .collect::<DuvizResult<Vec<_>>>()?;

        let mut nodes = Vec::new();
        for (i, uri) in uris.into_iter().enumerate() {
            if !mask[i] {
                continue;
            }
            let parent = std::mem::take(&mut parents[i]);
            nodes.push(Node {
                uri,
                kind: NodeKind::from_u8(kinds.vals[i])?,
                size: sizes.vals[i],
                mtime: mtimes.vals[i],
                parent: (!parent.is_empty()).then_some(parent),
                depth: entry.depth,
                n_children: n_children.vals[i],
                n_desc: n_desc.vals[i],
            });
        }
        Ok(nodes)
    }
}

/// Lazy scan over the groups of one stored snapshot.
#[derive(Debug)]
pub struct ScanIter<'a> {
    file: &'a BlobFile,
    filter: NodeFilter,
    next_group: usize,
    buffer: VecDeque<Node>,
    failed: bool,
}

impl ScanIter<'_> {
    fn fill_from_next_group(&mut self) -> DuvizResult<bool> {
        let Some(entry) = self.file.groups.get(self.next_group) else {
            return Ok(false);
        };
        self.next_group += 1;

        // depth pushdown: skip the whole group on footer data alone
        if !self.filter.depth_matches(entry.depth) {
            return Ok(true);
        }

        let uris = self.file.group_uris(entry)?;
        let mask: Vec<bool> = match &self.filter.uri_prefix {
            Some(prefix) => uris.iter().map(|uri| uri_has_prefix(uri, prefix)).collect(),
            None => vec![true; uris.len()],
        };
        // no row matches: the other six columns stay compressed
        if !mask.iter().any(|m| *m) {
            return Ok(true);
        }

        self.buffer = self.file.group_rows(entry, uris, &mask)?.into();
        Ok(true)
    }
}

impl Iterator for ScanIter<'_> {
    type Item = DuvizResult<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(node) = self.buffer.pop_front() {
                return Some(Ok(node));
            }
            match self.fill_from_next_group() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Whether `uri` equals `prefix` or lies below it on a `/` boundary.
pub(crate) fn uri_has_prefix(uri: &str, prefix: &Uri) -> bool {
    let p = prefix.as_str();
    if uri == p {
        return true;
    }
    if p.ends_with('/') {
        // the local scheme root
        uri.starts_with(p)
    } else {
        uri.len() > p.len() && uri.starts_with(p) && uri.as_bytes()[p.len()] == b'/'
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use crate::aggregate::testing::snapshot_of;

    use super::*;

    fn encode_parse(snapshot: &Snapshot) -> BlobFile {
        let bytes = encode(snapshot).unwrap();
        BlobFile::parse(Bytes::from(bytes)).unwrap()
    }

    #[test]
    fn test_round_trip_is_identity() {
        let snapshot = snapshot_of(
            "/r",
            &[("a/x", 1024, 100), ("a/y", 512, 300), ("b", 2048, 50)],
        );
        let file = encode_parse(&snapshot);

        assert_eq!(file.to_snapshot().unwrap(), snapshot);
    }

    #[test]
    fn test_depth_pushdown_matches_full_scan_filter() {
        let snapshot = snapshot_of(
            "/r",
            &[("a/b/c/d", 1, 0), ("a/b/x", 2, 0), ("a/y", 3, 0), ("z", 4, 0)],
        );
        let file = encode_parse(&snapshot);

        for k in 0..=4 {
            let pushed: Vec<Node> = file
                .scan(&NodeFilter::depth_le(k))
                .collect::<DuvizResult<_>>()
                .unwrap();
            let filtered: Vec<Node> = snapshot
                .nodes()
                .iter()
                .filter(|n| n.depth <= k)
                .cloned()
                .collect();
            assert_eq!(pushed, filtered, "depth {k}");
        }
    }

    #[test]
    fn test_uri_prefix_scan() {
        let snapshot = snapshot_of("/r", &[("a/x", 1, 0), ("a/y", 2, 0), ("ab", 3, 0)]);
        let file = encode_parse(&snapshot);

        let nodes: Vec<Node> = file
            .scan(&NodeFilter::uri_prefix(Uri::parse("/r/a").unwrap()))
            .collect::<DuvizResult<_>>()
            .unwrap();
        let uris: Vec<&str> = nodes.iter().map(|n| n.uri.as_str()).collect();

        // `/r/ab` shares the string prefix but not the path prefix
        assert_eq!(uris, ["/r/a", "/r/a/x", "/r/a/y"]);
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let snapshot = snapshot_of("/r", &[("a", 1, 0)]);
        let bytes = encode(&snapshot).unwrap();

        for cut in [0, 4, bytes.len() / 2, bytes.len() - 1] {
            let err = match BlobFile::parse(Bytes::copy_from_slice(&bytes[..cut])) {
                Err(err) => err,
                Ok(file) => file
                    .to_snapshot()
                    .expect_err("truncated file must not decode"),
            };
            assert_eq!(err.kind(), crate::error::ErrorKind::BlobCorrupt, "cut {cut}");
        }
    }

    #[test]
    fn test_error_summary_survives() {
        let mut snapshot = snapshot_of("/r", &[("a", 1, 0)]);
        snapshot.error_count = 7;
        snapshot.error_paths = vec!["/r/denied".to_string()];

        let file = encode_parse(&snapshot);
        assert_eq!(file.error_count(), 7);
        assert_eq!(file.error_paths(), ["/r/denied"]);
    }

    proptest! {
        #[test]
        fn prop_round_trip_and_pushdown(
            files in prop::collection::vec(
                (
                    prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 1..4),
                    0u64..1_000,
                ),
                1..25,
            ),
            k in 0u32..4,
        ) {
            let specs: Vec<(String, u64, i64)> = files
                .into_iter()
                .map(|(segs, size)| (segs.join("/"), size, 0))
                .collect();
            let spec_refs: Vec<(&str, u64, i64)> =
                specs.iter().map(|(p, s, m)| (p.as_str(), *s, *m)).collect();
            let snapshot = snapshot_of("/r", &spec_refs);

            let file = encode_parse(&snapshot);
            prop_assert_eq!(&file.to_snapshot().unwrap(), &snapshot);

            let pushed: Vec<Node> = file
                .scan(&NodeFilter::depth_le(k))
                .collect::<DuvizResult<_>>()
                .unwrap();
            let filtered: Vec<Node> = snapshot
                .nodes()
                .iter()
                .filter(|n| n.depth <= k)
                .cloned()
                .collect();
            prop_assert_eq!(pushed, filtered);
        }
    }
}
