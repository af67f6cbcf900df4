//! Append-only status log kept on the node's filesystem.

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
    max_bytes: u64,
}

pub fn format_entry(level: Level, now: DateTime<Utc>, message: &str) -> String {
    format!(
        "{} {} {}\n",
        now.format("%Y-%m-%d %H:%M:%S"),
        level.as_str(),
        message.trim_end()
    )
}

impl Journal {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".1");
        PathBuf::from(name)
    }

    pub fn append(&self, level: Level, now: DateTime<Utc>, message: &str) -> Result<()> {
        let entry = format_entry(level, now, message);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let current_len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };

        if current_len > 0 && current_len + entry.len() as u64 > self.max_bytes {
            fs::rename(&self.path, self.rotated_path())?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(entry.as_bytes())?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.lines().map(str::to_string).collect()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// The last `count` lines, oldest first.
    pub fn tail(&self, count: usize) -> Result<Vec<String>> {
        let mut lines = self.read_all()?;
        let skip = lines.len().saturating_sub(count);
        Ok(lines.split_off(skip))
    }
}
