//! Replay archival.
//!
//! A bundle is the host's autosave directory plus the session flight log,
//! packed as `<mission>_<YYYYmmdd_HHMMSS>.tar.gz` in the replay directory. If
//! the autosave cannot be copied or packed, a bundle holding only the flight
//! log is written instead.

use crate::error::{DirectorError, Result};
use chrono::{DateTime, Local};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{error, info, warn};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

pub const LATEST_FLIGHT_LOG: &str = "Flightlog_Latest.json";
pub const BUNDLE_FLIGHT_LOG: &str = "flightlog.json";

pub trait ReplayArchiver: Send + Sync {
    /// Writes the bundle for one finished state and returns its path.
    fn archive(&self, mission: &str, flight_log: &str, at: DateTime<Local>) -> Result<PathBuf>;
}

pub fn bundle_name(mission: &str, at: DateTime<Local>) -> String {
    format!("{}_{}", mission, at.format("%Y%m%d_%H%M%S"))
}

#[derive(Debug, Clone)]
pub struct FsArchiver {
    autosave_dir: PathBuf,
    replay_dir: PathBuf,
}

impl FsArchiver {
    pub fn new(autosave_dir: impl Into<PathBuf>, replay_dir: impl Into<PathBuf>) -> Self {
        Self {
            autosave_dir: autosave_dir.into(),
            replay_dir: replay_dir.into(),
        }
    }

    pub fn replay_dir(&self) -> &Path {
        &self.replay_dir
    }

    pub fn write_latest(&self, flight_log: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.replay_dir).map_err(archive_error(&self.replay_dir))?;
        let path = self.replay_dir.join(LATEST_FLIGHT_LOG);
        fs::write(&path, flight_log).map_err(archive_error(&path))?;
        Ok(path)
    }

    fn full_bundle(&self, work_dir: &Path, flight_log: &str) -> Result<PathBuf> {
        if !self.autosave_dir.is_dir() {
            return Err(DirectorError::Archive(format!(
                "autosave directory {} not found",
                self.autosave_dir.display()
            )));
        }
        if work_dir.exists() {
            fs::remove_dir_all(work_dir).map_err(archive_error(work_dir))?;
        }
        copy_dir(&self.autosave_dir, work_dir).map_err(archive_error(&self.autosave_dir))?;
        self.pack(work_dir, flight_log)
    }

    fn log_only_bundle(&self, work_dir: &Path, flight_log: &str) -> Result<PathBuf> {
        if work_dir.exists() {
            fs::remove_dir_all(work_dir).map_err(archive_error(work_dir))?;
        }
        fs::create_dir_all(work_dir).map_err(archive_error(work_dir))?;
        self.pack(work_dir, flight_log)
    }

    fn pack(&self, work_dir: &Path, flight_log: &str) -> Result<PathBuf> {
        let log_path = work_dir.join(BUNDLE_FLIGHT_LOG);
        fs::write(&log_path, flight_log).map_err(archive_error(&log_path))?;

        let mut bundle = work_dir.as_os_str().to_owned();
        bundle.push(".tar.gz");
        let bundle = PathBuf::from(bundle);
        compress_dir(work_dir, &bundle).map_err(archive_error(&bundle))?;
        fs::remove_dir_all(work_dir).map_err(archive_error(work_dir))?;
        Ok(bundle)
    }
}

impl ReplayArchiver for FsArchiver {
    fn archive(&self, mission: &str, flight_log: &str, at: DateTime<Local>) -> Result<PathBuf> {
        if let Err(e) = self.write_latest(flight_log) {
            warn!("Could not write {}: {}", LATEST_FLIGHT_LOG, e);
        }

        let name = bundle_name(mission, at);
        let work_dir = self.replay_dir.join(&name);

        match self.full_bundle(&work_dir, flight_log) {
            Ok(bundle) => {
                if let Err(e) = fs::remove_dir_all(&self.autosave_dir) {
                    warn!("Could not clear autosave {}: {}", self.autosave_dir.display(), e);
                }
                info!("Replay archived to {}", bundle.display());
                Ok(bundle)
            }
            Err(e) => {
                error!("Failed to archive replay: {}", e);
                warn!("Archiving the flight log alone");
                let bundle = self.log_only_bundle(&work_dir, flight_log)?;
                info!("Flight log archived to {}", bundle.display());
                Ok(bundle)
            }
        }
    }
}

fn archive_error(path: &Path) -> impl FnOnce(io::Error) -> DirectorError + '_ {
    move |e| DirectorError::Archive(format!("{}: {}", path.display(), e))
}

pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Packs `dir` into a gzip-compressed tarball whose single top-level entry is
/// the directory's own name.
pub fn compress_dir(dir: &Path, out: &Path) -> io::Result<()> {
    let root = dir
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "directory has no name"))?;

    let encoder = GzEncoder::new(File::create(out)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(root, dir)?;
    builder.into_inner()?.finish()?;
    Ok(())
}
