//! The local-subprocess probe: parse the output of an external enumerator.
//!
//! Fallback for setups where the built-in walker cannot be used, e.g. when an
//! enumerator must run under sudo or the platform lacks block-accurate
//! metadata. The command gets the root path appended and must print one
//! `<kind> <512-blocks> <mtime> <path>` line per entry, which is the shape of
//! `find <root> -printf "%y %b %T@ %p\n"`.

use std::{
    io::{BufRead, BufReader, Lines},
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, Stdio},
};

use log::warn;

use crate::{
    error::{DuvizError, DuvizResult, ErrorKind},
    probe::{EntryError, EntryResult, Probe, ProbeOptions, RawEntry},
    service::command_input::CommandInput,
    snapshot::NodeKind,
    uri::Uri,
};

/// Default enumerator when none is configured.
const DEFAULT_ENUMERATOR: &str = "find";
/// Output format handed to the default enumerator.
const PRINTF_FORMAT: &str = "%y %b %T@ %p\n";

/// A [`Probe`] which shells out to an external enumerator command.
#[derive(Debug)]
pub struct CommandProbe {
    root: Uri,
    root_path: PathBuf,
    command: CommandInput,
    /// Whether to pass the `-printf` format; only done for the built-in default.
    append_format: bool,
}

impl CommandProbe {
    /// Create a probe running the configured enumerator over `root`.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::UnsupportedScheme`] if `root` is not a local URI.
    pub fn new(root: &Uri, opts: &ProbeOptions) -> DuvizResult<Self> {
        let root_path = root.to_local_path().ok_or_else(|| {
            DuvizError::new(
                ErrorKind::UnsupportedScheme,
                "The subprocess probe only enumerates local URIs.",
            )
            .attach_context("uri", root.to_string())
        })?;
        let configured = opts.enumerator_command.clone().filter(CommandInput::is_set);
        let append_format = configured.is_none();
        let command =
            configured.unwrap_or_else(|| vec![DEFAULT_ENUMERATOR.to_string()].into());

        Ok(Self {
            root: root.clone(),
            root_path,
            command,
            append_format,
        })
    }
}

impl Probe for CommandProbe {
    type Iter = CommandProbeIter;

    fn root(&self) -> &Uri {
        &self.root
    }

    fn entries(self) -> DuvizResult<Self::Iter> {
        let mut cmd = Command::new(self.command.command());
        _ = cmd.args(self.command.args()).arg(&self.root_path);
        if self.append_format {
            _ = cmd.args(["-printf", PRINTF_FORMAT]);
        }
        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                DuvizError::with_source(
                    ErrorKind::SourceTransient,
                    "Failed to spawn the enumerator command.",
                    err,
                )
                .attach_context("command", self.command.to_string())
            })?;

        // stdout is piped, so take() cannot fail here
        let stdout = child.stdout.take().ok_or_else(|| {
            DuvizError::new(ErrorKind::Internal, "Enumerator has no captured stdout.")
        })?;

        Ok(CommandProbeIter {
            lines: BufReader::new(stdout).lines(),
            child: Some(child),
            root: self.root,
            root_path: self.root_path,
        })
    }
}

// Lines<BufReader<..>> has no useful Debug
#[allow(missing_debug_implementations)]
pub struct CommandProbeIter {
    lines: Lines<BufReader<ChildStdout>>,
    child: Option<Child>,
    root: Uri,
    root_path: PathBuf,
}

impl CommandProbeIter {
    /// Reap the child once the line stream is exhausted.
    ///
    /// A non-zero exit means the enumerator hit paths it could not read; this
    /// surfaces as one trailing stream error so the scan records it.
    fn finish(&mut self) -> Option<EntryResult> {
        let mut child = self.child.take()?;
        match child.wait() {
            Ok(status) if status.success() => None,
            Ok(status) => Some(Err(EntryError {
                path: self.root_path.display().to_string(),
                error: DuvizError::new(
                    ErrorKind::SourcePermission,
                    "Enumerator finished with a non-zero status; some paths were not readable.",
                )
                .attach_context("status", status.to_string()),
            })),
            Err(err) => Some(Err(EntryError {
                path: self.root_path.display().to_string(),
                error: DuvizError::with_source(
                    ErrorKind::Internal,
                    "Failed to wait for the enumerator command.",
                    err,
                ),
            })),
        }
    }
}

impl Iterator for CommandProbeIter {
    type Item = EntryResult;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next() {
                None => return self.finish(),
                Some(Err(err)) => {
                    return Some(Err(EntryError {
                        path: self.root_path.display().to_string(),
                        error: DuvizError::with_source(
                            ErrorKind::SourceTransient,
                            "Failed to read a line from the enumerator.",
                            err,
                        ),
                    }));
                }
                Some(Ok(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    match parse_line(&self.root, &self.root_path, &line) {
                        Ok(Some(raw)) => return Some(Ok(raw)),
                        // entry kinds we don't track, e.g. sockets below another root
                        Ok(None) => {}
                        Err(error) => {
                            warn!("ignoring unparsable enumerator line: {line}");
                            return Some(Err(EntryError { path: line, error }));
                        }
                    }
                }
            }
        }
    }
}

/// Parse one `<kind> <512-blocks> <mtime> <path>` line.
fn parse_line(root: &Uri, root_path: &Path, line: &str) -> DuvizResult<Option<RawEntry>> {
    let bad = |what: &str| {
        DuvizError::new(ErrorKind::Internal, "Malformed enumerator output line.")
            .attach_context("expected", what.to_string())
            .attach_context("line", line.to_string())
    };

    let mut parts = line.splitn(4, ' ');
    let kind = match parts.next().ok_or_else(|| bad("kind"))? {
        "d" => NodeKind::Dir,
        // files, links and special files all count as file entries
        _ => NodeKind::File,
    };
    let blocks: u64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| bad("block count"))?;
    let mtime = parts
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| bad("mtime"))? as i64;
    let path = parts.next().ok_or_else(|| bad("path"))?;

    let rel = match Path::new(path).strip_prefix(root_path) {
        Ok(rel) => rel,
        // the enumerator may report entries outside the root; skip them
        Err(_) => return Ok(None),
    };
    let mut uri = root.clone();
    for component in rel.components() {
        uri = uri.join(&component.as_os_str().to_string_lossy())?;
    }

    Ok(Some(RawEntry {
        uri,
        kind,
        size: if kind == NodeKind::Dir { 0 } else { blocks * 512 },
        mtime,
    }))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_file_line() {
        let root = Uri::parse("/data").unwrap();
        let entry = parse_line(&root, Path::new("/data"), "f 8 1618033988.7500000000 /data/a.bin")
            .unwrap()
            .unwrap();

        assert_eq!(entry.uri.as_str(), "/data/a.bin");
        assert_eq!(entry.kind, NodeKind::File);
        assert_eq!(entry.size, 8 * 512);
        assert_eq!(entry.mtime, 1_618_033_988);
    }

    #[test]
    fn test_parse_dir_line_has_zero_size() {
        let root = Uri::parse("/data").unwrap();
        let entry = parse_line(&root, Path::new("/data"), "d 8 100.0 /data/sub")
            .unwrap()
            .unwrap();

        assert_eq!(entry.kind, NodeKind::Dir);
        assert_eq!(entry.size, 0);
    }

    #[test]
    fn test_parse_path_with_spaces() {
        let root = Uri::parse("/data").unwrap();
        let entry = parse_line(&root, Path::new("/data"), "f 0 0.0 /data/with space/x y")
            .unwrap()
            .unwrap();

        assert_eq!(entry.uri.as_str(), "/data/with space/x y");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let root = Uri::parse("/data").unwrap();
        assert!(parse_line(&root, Path::new("/data"), "not a record").is_err());
    }

    #[test]
    fn test_entries_outside_root_are_skipped() {
        let root = Uri::parse("/data").unwrap();
        assert!(parse_line(&root, Path::new("/data"), "f 0 0.0 /elsewhere/x")
            .unwrap()
            .is_none());
    }
}
