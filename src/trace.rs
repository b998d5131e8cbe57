//! The file-access log the hooks write into.
//!
//! Every successfully opened file is recorded as one line, shaped by the configured
//! [`LogFormat`]: an optional millisecond Unix timestamp, an optional archive name
//! (the final path component of the MPQ the file came from), and the file name the
//! game asked for. With unique-only logging enabled, repeat opens of the same
//! archive/file pair are dropped - the timestamp is excluded from that comparison so a
//! repeat at a different time is still a repeat.
//!
//! Write failures are swallowed: a tracing layer inside someone else's game has no
//! business failing an open call over a full disk.

use std::{
    collections::HashSet,
    fs::File,
    io::{LineWriter, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    config::{Config, LogFormat},
    Result,
};

/// A line-flushed log of file accesses.
pub struct FileAccessLog {
    out: LineWriter<File>,
    format: LogFormat,
    unique_only: bool,
    seen: HashSet<String>,
}

impl FileAccessLog {
    /// Create (truncating) the log file at `path`, shaped by `config`.
    ///
    /// # Errors
    /// Returns the underlying I/O error if the file cannot be created.
    pub fn create(path: &Path, config: &Config) -> Result<FileAccessLog> {
        let file = File::create(path)?;
        Ok(FileAccessLog {
            out: LineWriter::new(file),
            format: config.format,
            unique_only: config.unique_only,
            seen: HashSet::new(),
        })
    }

    /// Whether callers should bother resolving the source archive of a file.
    pub fn wants_archive(&self) -> bool {
        self.format.wants_archive()
    }

    /// Record one file access.
    ///
    /// `archive_path` is the full path of the MPQ the file came from, when the
    /// caller resolved one; only its final path component is logged, and it is
    /// ignored entirely by formats that do not name archives.
    pub fn record(&mut self, file_name: &str, archive_path: Option<&str>) {
        let archive = if self.format.wants_archive() {
            archive_path.and_then(archive_file_name)
        } else {
            None
        };

        let key = match &archive {
            Some(archive) => format!("{archive}: {file_name}"),
            None => file_name.to_string(),
        };

        if self.unique_only && !self.seen.insert(key) {
            return;
        }

        let entry = match (self.format.wants_timestamp(), &archive) {
            (true, Some(archive)) => format!("{} {archive}: {file_name}", timestamp_ms()),
            (true, None) => format!("{} {file_name}", timestamp_ms()),
            (false, Some(archive)) => format!("{archive}: {file_name}"),
            (false, None) => file_name.to_string(),
        };

        let _ = writeln!(self.out, "{entry}");
    }

    /// Write one line verbatim, outside the entry format.
    ///
    /// Used for error notes like a missing Storm.dll, which belong in the same
    /// file the user is watching.
    pub fn note(&mut self, line: &str) {
        let _ = writeln!(self.out, "{line}");
    }

    /// Forget which entries have been seen, so unique-only logging starts over.
    pub fn clear_seen(&mut self) {
        self.seen.clear();
    }

    /// Flush anything buffered to disk.
    pub fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

/// Final path component of an archive path, whichever separator style it uses.
fn archive_file_name(path: &str) -> Option<String> {
    let name = path.rsplit(['\\', '/']).next()?;
    (!name.is_empty()).then(|| name.to_string())
}

fn timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(format: LogFormat, unique_only: bool) -> Config {
        Config {
            unique_only,
            format,
            ..Config::default()
        }
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn filename_only_with_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");

        let mut log =
            FileAccessLog::create(&path, &config(LogFormat::FilenameOnly, true)).unwrap();
        log.record("music\\intro.wav", None);
        log.record("music\\intro.wav", None);
        log.record("gendata\\cuts\\lvl16\\vic.smk", None);
        drop(log);

        assert_eq!(
            lines(&path),
            vec!["music\\intro.wav", "gendata\\cuts\\lvl16\\vic.smk"]
        );
    }

    #[test]
    fn duplicates_kept_without_unique_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");

        let mut log =
            FileAccessLog::create(&path, &config(LogFormat::FilenameOnly, false)).unwrap();
        log.record("ui\\cursor.pcx", None);
        log.record("ui\\cursor.pcx", None);
        drop(log);

        assert_eq!(lines(&path).len(), 2);
    }

    #[test]
    fn archive_name_is_stripped_to_its_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");

        let mut log =
            FileAccessLog::create(&path, &config(LogFormat::ArchiveFilename, true)).unwrap();
        log.record("levels\\towndata\\town.cel", Some("C:\\Diablo\\DIABDAT.MPQ"));
        log.record("levels\\towndata\\sector1s.dun", None);
        drop(log);

        assert_eq!(
            lines(&path),
            vec![
                "DIABDAT.MPQ: levels\\towndata\\town.cel",
                "levels\\towndata\\sector1s.dun"
            ]
        );
    }

    #[test]
    fn same_file_from_different_archives_is_two_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");

        let mut log =
            FileAccessLog::create(&path, &config(LogFormat::ArchiveFilename, true)).unwrap();
        log.record("data\\global\\ui.dc6", Some("d2data.mpq"));
        log.record("data\\global\\ui.dc6", Some("patch_d2.mpq"));
        drop(log);

        assert_eq!(lines(&path).len(), 2);
    }

    #[test]
    fn timestamped_entries_lead_with_milliseconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");

        let mut log =
            FileAccessLog::create(&path, &config(LogFormat::TimestampFilename, true)).unwrap();
        log.record("war3map.j", None);
        drop(log);

        let lines = lines(&path);
        let (stamp, rest) = lines[0].split_once(' ').unwrap();
        assert!(stamp.parse::<u128>().unwrap() > 0);
        assert_eq!(rest, "war3map.j");
    }

    #[test]
    fn archives_are_ignored_by_formats_that_do_not_name_them() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");

        let mut log =
            FileAccessLog::create(&path, &config(LogFormat::FilenameOnly, true)).unwrap();
        assert!(!log.wants_archive());
        log.record("font\\font16.bin", Some("DIABDAT.MPQ"));
        drop(log);

        assert_eq!(lines(&path), vec!["font\\font16.bin"]);
    }

    #[test]
    fn notes_are_written_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");

        let mut log =
            FileAccessLog::create(&path, &config(LogFormat::FilenameOnly, true)).unwrap();
        log.note("ERROR: Storm.dll not found");
        drop(log);

        assert_eq!(lines(&path), vec!["ERROR: Storm.dll not found"]);
    }
}
