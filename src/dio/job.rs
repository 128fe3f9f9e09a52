//! One unit of disk I/O handed to a [`super::DioPool`] worker
//! (`spec.md` §4.E).

use std::path::PathBuf;

use crate::error::Result;

/// What a [`Job`] asks a DIO worker thread to do.
#[derive(Debug)]
pub enum JobKind {
    /// Read `len` bytes starting at `offset`.
    Read { offset: u64, len: usize },
    /// Write `data` starting at `offset`, creating the file (and its
    /// parent directories) if necessary.
    Write { offset: u64, data: Vec<u8> },
    /// Append `data` to the end of the file.
    Append { data: Vec<u8> },
    /// Truncate (or extend with zeroes) the file to exactly `len` bytes.
    Truncate { len: u64 },
    /// Remove the file.
    Delete,
}

/// A queued disk operation, with the local path it targets. `direct_io`
/// requests `O_DIRECT` on platforms that support it; the caller is
/// responsible for buffer alignment (`spec.md` §4.E).
#[derive(Debug)]
pub struct Job {
    pub path: PathBuf,
    pub kind: JobKind,
    pub direct_io: bool,
}

/// What a completed [`Job`] handed back to its caller.
#[derive(Debug)]
pub enum JobOutcome {
    Bytes(Vec<u8>),
    BytesWritten(u64),
    Done,
}

pub type JobResult = Result<JobOutcome>;

/// Executes one job synchronously against the local filesystem. Runs on a
/// DIO worker thread — never called from a network loop task
/// (`spec.md` §4.E: "off the network loop").
pub fn run_job(job: &Job) -> JobResult {
    use std::fs::OpenOptions;
    use std::io::{Read, Seek, SeekFrom, Write};

    match &job.kind {
        JobKind::Read { offset, len } => {
            let mut opts = OpenOptions::new();
            opts.read(true);
            apply_direct_io(&mut opts, job.direct_io);
            let mut file = opts.open(&job.path)?;
            file.seek(SeekFrom::Start(*offset))?;
            let mut buf = vec![0u8; *len];
            let n = file.read(&mut buf)?;
            buf.truncate(n);
            Ok(JobOutcome::Bytes(buf))
        }
        JobKind::Write { offset, data } => {
            if let Some(parent) = job.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut opts = OpenOptions::new();
            opts.create(true).write(true);
            apply_direct_io(&mut opts, job.direct_io);
            let mut file = opts.open(&job.path)?;
            file.seek(SeekFrom::Start(*offset))?;
            file.write_all(data)?;
            Ok(JobOutcome::BytesWritten(data.len() as u64))
        }
        JobKind::Append { data } => {
            if let Some(parent) = job.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // O_DIRECT requires aligned, offset-bounded writes that a bare
            // append (unknown offset until the kernel seeks to EOF) cannot
            // guarantee portably, so this path always goes through the
            // buffered cache regardless of `job.direct_io`.
            let mut file = OpenOptions::new().create(true).append(true).open(&job.path)?;
            file.write_all(data)?;
            Ok(JobOutcome::BytesWritten(data.len() as u64))
        }
        JobKind::Truncate { len } => {
            let file = OpenOptions::new().write(true).open(&job.path)?;
            file.set_len(*len)?;
            Ok(JobOutcome::Done)
        }
        JobKind::Delete => {
            std::fs::remove_file(&job.path)?;
            Ok(JobOutcome::Done)
        }
    }
}

/// Requests `O_DIRECT` on the handle this `OpenOptions` will produce, on
/// platforms that support it (`spec.md` §4.E "direct_io"). A no-op
/// everywhere else, including non-Linux Unix targets whose `O_DIRECT`
/// alignment rules differ too much to apply uniformly.
#[cfg(target_os = "linux")]
fn apply_direct_io(opts: &mut std::fs::OpenOptions, direct_io: bool) {
    use std::os::unix::fs::OpenOptionsExt;
    if direct_io {
        opts.custom_flags(libc::O_DIRECT);
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_direct_io(_opts: &mut std::fs::OpenOptions, _direct_io: bool) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        run_job(&Job { path: path.clone(), kind: JobKind::Write { offset: 0, data: b"hello".to_vec() }, direct_io: false })
            .unwrap();
        let outcome =
            run_job(&Job { path, kind: JobKind::Read { offset: 0, len: 5 }, direct_io: false }).unwrap();
        assert!(matches!(outcome, JobOutcome::Bytes(b) if b == b"hello"));
    }

    #[test]
    fn append_grows_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        run_job(&Job { path: path.clone(), kind: JobKind::Write { offset: 0, data: b"abc".to_vec() }, direct_io: false }).unwrap();
        run_job(&Job { path: path.clone(), kind: JobKind::Append { data: b"def".to_vec() }, direct_io: false }).unwrap();
        let outcome =
            run_job(&Job { path, kind: JobKind::Read { offset: 0, len: 6 }, direct_io: false }).unwrap();
        assert!(matches!(outcome, JobOutcome::Bytes(b) if b == b"abcdef"));
    }

    #[test]
    fn truncate_shrinks_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        run_job(&Job { path: path.clone(), kind: JobKind::Write { offset: 0, data: b"abcdef".to_vec() }, direct_io: false }).unwrap();
        run_job(&Job { path: path.clone(), kind: JobKind::Truncate { len: 3 }, direct_io: false }).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, b"abc");
    }

    #[test]
    fn delete_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        run_job(&Job { path: path.clone(), kind: JobKind::Write { offset: 0, data: b"x".to_vec() }, direct_io: false }).unwrap();
        run_job(&Job { path: path.clone(), kind: JobKind::Delete, direct_io: false }).unwrap();
        assert!(!path.exists());
    }
}
