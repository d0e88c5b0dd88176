//! Roster input, checkpoint store, and append-only output sinks for RPE.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rpe_core::{EnrichedRecord, ErrorEntry, MemberRecord};
use tracing::info;

pub const CRATE_NAME: &str = "rpe-storage";

const ROSTER_HEADER: [&str; 3] = ["fullname", "email", "username"];

/// Read all member rows from a roster-shaped CSV file (header required;
/// `username` column optional).
pub fn read_roster(path: impl AsRef<Path>) -> Result<Vec<MemberRecord>> {
    let path = path.as_ref();
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(file);
    let mut rows = Vec::new();
    for record in reader.deserialize::<MemberRecord>() {
        rows.push(record.with_context(|| format!("parsing {}", path.display()))?);
    }
    Ok(rows)
}

/// Rewrite a roster-shaped CSV in place via temp file + rename. A crash
/// mid-write leaves the previous checkpoint intact.
fn write_roster_atomic(path: &Path, rows: &[MemberRecord]) -> Result<()> {
    let temp_path = path.with_extension("csv.tmp");
    {
        let file = fs::File::create(&temp_path)
            .with_context(|| format!("creating {}", temp_path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer
            .write_record(ROSTER_HEADER)
            .with_context(|| format!("writing header to {}", temp_path.display()))?;
        for row in rows {
            writer
                .serialize(row)
                .with_context(|| format!("writing row to {}", temp_path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("flushing {}", temp_path.display()))?;
    }
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "renaming {} -> {}",
            temp_path.display(),
            path.display()
        )
    })
}

/// Durable progress marker for batch runs. `load` yields every row still
/// unprocessed; `commit` replaces the stored sequence with the unconsumed
/// tail. Single process, sequential runs only; there is no locking.
pub trait CheckpointStore: Send {
    fn load(&mut self) -> Result<Vec<MemberRecord>>;
    fn commit(&mut self, remaining: &[MemberRecord]) -> Result<()>;
}

/// File-backed checkpoint store. On first `load` (no checkpoint file yet)
/// the source roster is cloned into the checkpoint file verbatim; from then
/// on the source file is never re-read, so edits to it after the first run
/// have no effect on an existing checkpoint.
#[derive(Debug, Clone)]
pub struct CsvCheckpointStore {
    source_path: PathBuf,
    checkpoint_path: PathBuf,
}

impl CsvCheckpointStore {
    pub fn new(source_path: impl Into<PathBuf>, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            checkpoint_path: checkpoint_path.into(),
        }
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }
}

impl CheckpointStore for CsvCheckpointStore {
    fn load(&mut self) -> Result<Vec<MemberRecord>> {
        if !self.checkpoint_path.exists() {
            let rows = read_roster(&self.source_path)?;
            write_roster_atomic(&self.checkpoint_path, &rows)?;
            info!(
                count = rows.len(),
                checkpoint = %self.checkpoint_path.display(),
                "created checkpoint from roster"
            );
            return Ok(rows);
        }
        read_roster(&self.checkpoint_path)
    }

    fn commit(&mut self, remaining: &[MemberRecord]) -> Result<()> {
        write_roster_atomic(&self.checkpoint_path, remaining)
    }
}

/// In-memory checkpoint store for unit tests and dry wiring.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    rows: Vec<MemberRecord>,
}

impl InMemoryCheckpointStore {
    pub fn new(rows: Vec<MemberRecord>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[MemberRecord] {
        &self.rows
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&mut self) -> Result<Vec<MemberRecord>> {
        Ok(self.rows.clone())
    }

    fn commit(&mut self, remaining: &[MemberRecord]) -> Result<()> {
        self.rows = remaining.to_vec();
        Ok(())
    }
}

/// Append-only CSV accumulator for enriched rows. The header is written when
/// the file is first created; every append reopens the file so partial runs
/// keep whatever they managed to write.
#[derive(Debug, Clone)]
pub struct OutputSink {
    path: PathBuf,
}

impl OutputSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &EnrichedRecord) -> Result<()> {
        let write_header = !self.path.exists();
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        writer
            .serialize(record)
            .with_context(|| format!("appending to {}", self.path.display()))?;
        writer
            .flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;
        Ok(())
    }
}

/// Append-only, line-oriented log of per-record enrichment failures.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &ErrorEntry) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        writeln!(file, "{}", entry.log_line())
            .with_context(|| format!("appending to {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rpe_core::ProfileFacts;
    use tempfile::tempdir;

    fn member(fullname: &str, email: &str, username: Option<&str>) -> MemberRecord {
        MemberRecord {
            fullname: fullname.to_string(),
            email: email.to_string(),
            username: username.map(ToString::to_string),
        }
    }

    fn write_roster_file(path: &Path, body: &str) {
        fs::write(path, body).expect("write roster");
    }

    #[test]
    fn roster_parses_optional_username_column() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("members.csv");
        write_roster_file(
            &path,
            "fullname,email\nAda Lovelace,ada@example.org\n,missing@example.org\n",
        );

        let rows = read_roster(&path).expect("read roster");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fullname, "Ada Lovelace");
        assert_eq!(rows[0].username, None);
        assert!(!rows[1].has_fullname());
    }

    #[test]
    fn first_load_clones_roster_into_checkpoint() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("members.csv");
        let checkpoint = dir.path().join("remaining.csv");
        write_roster_file(
            &source,
            "fullname,email,username\nAda Lovelace,ada@example.org,ada\nAlan Turing,alan@example.org,\n",
        );

        let mut store = CsvCheckpointStore::new(&source, &checkpoint);
        let rows = store.load().expect("first load");
        assert_eq!(rows.len(), 2);
        assert!(checkpoint.exists());

        let cloned = read_roster(&checkpoint).expect("read checkpoint");
        assert_eq!(cloned, rows);
    }

    #[test]
    fn commit_keeps_only_the_unconsumed_tail_in_order() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("members.csv");
        let checkpoint = dir.path().join("remaining.csv");
        write_roster_file(
            &source,
            "fullname,email,username\nA One,a@example.org,\nB Two,b@example.org,\nC Three,c@example.org,\n",
        );

        let mut store = CsvCheckpointStore::new(&source, &checkpoint);
        let rows = store.load().expect("load");
        store.commit(&rows[2..]).expect("commit tail");

        let remaining = store.load().expect("reload");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].fullname, "C Three");
    }

    #[test]
    fn committing_an_empty_tail_leaves_a_header_only_checkpoint() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("members.csv");
        let checkpoint = dir.path().join("remaining.csv");
        write_roster_file(&source, "fullname,email,username\nA One,a@example.org,\n");

        let mut store = CsvCheckpointStore::new(&source, &checkpoint);
        store.load().expect("load");
        store.commit(&[]).expect("commit empty");

        assert!(checkpoint.exists());
        let remaining = store.load().expect("reload");
        assert!(remaining.is_empty());
    }

    #[test]
    fn output_sink_writes_header_once_and_appends() {
        let dir = tempdir().expect("tempdir");
        let sink = OutputSink::new(dir.path().join("enriched.csv"));
        let m = member("Ada Lovelace", "ada@example.org", None);

        let first = EnrichedRecord::from_facts(
            &m,
            "https://linkedin.com/in/ada",
            ProfileFacts {
                title: "Analyst".into(),
                ..ProfileFacts::default()
            },
        );
        let second = EnrichedRecord::from_facts(&m, "https://linkedin.com/in/ada2", ProfileFacts::default());
        sink.append(&first).expect("first append");
        sink.append(&second).expect("second append");

        let text = fs::read_to_string(sink.path()).expect("read output");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "fullname,email,linkedin_url,title,company,headline,location,education,org_role_years"
        );
        assert!(lines[1].contains("https://linkedin.com/in/ada"));
        assert!(lines[2].contains("https://linkedin.com/in/ada2"));
    }

    #[test]
    fn error_log_appends_one_line_per_entry() {
        let dir = tempdir().expect("tempdir");
        let log = ErrorLog::new(dir.path().join("enrichment_errors.log"));
        let m = member("Ada Lovelace", "ada@example.org", None);
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap();

        log.append(&ErrorEntry::new(&m, "no confident match", at))
            .expect("first append");
        log.append(&ErrorEntry::new(&m, "http status 500", at))
            .expect("second append");

        let text = fs::read_to_string(log.path()).expect("read log");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Ada Lovelace (ada@example.org): no confident match"));
        assert!(lines[0].starts_with("[2026-03-01T09:30:00"));
        assert!(lines[1].ends_with("http status 500"));
    }
}
