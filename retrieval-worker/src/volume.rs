//! Cache volumes.
//!
//! A volume is one configured cache storage location, given as a bare path
//! or a URL. The pool of volumes is read from the data-volumes file, one
//! entry per line with environment variables expanded.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};

use crate::utils::fs::io_error;
use crate::{Error, Result};

/// Storage protocol of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    /// Plain local filesystem (`/path` or `file:///path`).
    File,
    /// Local filesystem mounted under a named alias (`cci1://`, `cci2://`, ...).
    /// Artifact URLs keep the alias so consumers can map it to their mount.
    LocalAlias(String),
    /// Remote object storage (`s3://`, `http(s)://`).
    ObjectStorage(String),
}

impl Protocol {
    fn from_scheme(scheme: &str) -> Option<Self> {
        let scheme = scheme.to_ascii_lowercase();
        match scheme.as_str() {
            "file" => Some(Self::File),
            "s3" | "http" | "https" => Some(Self::ObjectStorage(scheme)),
            s if s.len() > 3
                && s.starts_with("cci")
                && s[3..].chars().all(|c| c.is_ascii_digit()) =>
            {
                Some(Self::LocalAlias(scheme))
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::File => "file",
            Self::LocalAlias(name) | Self::ObjectStorage(name) => name,
        }
    }

    pub fn is_local(&self) -> bool {
        !matches!(self, Self::ObjectStorage(_))
    }

    /// Whether produced artifacts must be made publicly readable before the
    /// job is reported done.
    pub fn requires_public_read(&self) -> bool {
        matches!(self, Self::ObjectStorage(_))
    }
}

/// One cache storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    raw: String,
    protocol: Protocol,
    /// Location with the protocol prefix stripped. Absolute for local
    /// volumes, resolved against the directory the volume was parsed in.
    path: String,
}

impl Volume {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::validation("empty volume"));
        }

        let (protocol, path) = match raw.split_once("://") {
            Some((scheme, rest)) => {
                let protocol = Protocol::from_scheme(scheme)
                    .ok_or_else(|| Error::UnsupportedProtocol(scheme.to_string()))?;
                (protocol, rest.to_string())
            }
            None => (Protocol::File, raw.to_string()),
        };

        if path.is_empty() {
            return Err(Error::validation(format!("volume {raw} has no path")));
        }
        // Jobs run with the cwd inside a scratch directory, so a relative
        // root must not be resolved lazily.
        let path = if protocol.is_local() {
            std::path::absolute(&path)
                .map_err(|e| io_error("resolving", Path::new(&path), e))?
                .to_string_lossy()
                .into_owned()
        } else {
            path
        };

        Ok(Self {
            raw: raw.to_string(),
            protocol,
            path,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Filesystem root of a local volume.
    pub fn local_root(&self) -> Result<PathBuf> {
        if !self.protocol.is_local() {
            return Err(Error::UnsupportedProtocol(self.protocol.name().to_string()));
        }
        Ok(PathBuf::from(&self.path))
    }

    /// Render a path on this volume as a URL carrying the volume's protocol.
    pub fn unstrip(&self, path: &Path) -> String {
        match &self.protocol {
            Protocol::File => format!("file://{}", path.display()),
            Protocol::LocalAlias(name) => format!("{}://{}", name, path.display()),
            Protocol::ObjectStorage(name) => {
                format!("{}://{}", name, path.display().to_string().trim_start_matches('/'))
            }
        }
    }

    /// Directory new artifacts are written to at `now`.
    pub fn location(&self, depth: CacheDepth, now: DateTime<Utc>) -> Result<PathBuf> {
        let root = self.local_root()?;
        Ok(match depth.partition(now) {
            Some(partition) => root.join(partition),
            None => root,
        })
    }

    /// Existing partition directories of this volume at `depth`, oldest first.
    pub fn existing_locations(&self, depth: CacheDepth) -> Result<Vec<PathBuf>> {
        let root = self.local_root()?;
        let mut locations = vec![root];
        for level in 0..depth.levels() {
            let mut next = Vec::new();
            for dir in &locations {
                for name in sorted_subdirs(dir)? {
                    if is_partition_name(&name, level) {
                        next.push(dir.join(name));
                    }
                }
            }
            locations = next;
        }
        Ok(locations)
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Whether `name` is a partition directory at `level` (0 = day, 1 = hour).
pub fn is_partition_name(name: &str, level: usize) -> bool {
    match level {
        0 => NaiveDate::parse_from_str(name, "%Y-%m-%d").is_ok(),
        1 => name.len() == 2 && name.parse::<u8>().is_ok_and(|h| h < 24),
        _ => false,
    }
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error("listing", dir, e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_error("listing", dir, e))?;
        if entry.file_type().is_ok_and(|t| t.is_dir())
            && let Some(name) = entry.file_name().to_str()
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Date partitioning of cache locations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheDepth {
    /// Artifacts directly under the volume root.
    #[default]
    Root,
    /// `YYYY-MM-DD/`
    Day,
    /// `YYYY-MM-DD/HH/`
    Hour,
}

impl CacheDepth {
    pub fn levels(&self) -> usize {
        match self {
            Self::Root => 0,
            Self::Day => 1,
            Self::Hour => 2,
        }
    }

    pub fn partition(&self, now: DateTime<Utc>) -> Option<PathBuf> {
        match self {
            Self::Root => None,
            Self::Day => Some(PathBuf::from(now.format("%Y-%m-%d").to_string())),
            Self::Hour => Some(
                PathBuf::from(now.format("%Y-%m-%d").to_string()).join(now.format("%H").to_string()),
            ),
        }
    }
}

impl TryFrom<u8> for CacheDepth {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Root),
            1 => Ok(Self::Day),
            2 => Ok(Self::Hour),
            other => Err(Error::config(format!("CACHE_DEPTH must be 0, 1 or 2, got {other}"))),
        }
    }
}

/// Pick the volume for a cache key. Uniform over the pool and stable per key,
/// so concurrent computations of one key meet on the same claim.
pub fn select_volume<'a>(volumes: &'a [Volume], key: &str) -> Option<&'a Volume> {
    if volumes.is_empty() {
        return None;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let index = (u64::from_be_bytes(prefix) % volumes.len() as u64) as usize;
    volumes.get(index)
}

/// Expand `$NAME` and `${NAME}` references. Unknown variables are left
/// untouched.
pub fn expand_vars(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    shellexpand::env_with_context_no_errors(input, |name| lookup(name)).into_owned()
}

/// Read the data-volumes file at `path`, or at `DATA_VOLUMES_CONFIG` when no
/// path is given.
pub fn parse_data_volumes_config(
    path: Option<&Path>,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Vec<Volume>> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => lookup("DATA_VOLUMES_CONFIG")
            .map(PathBuf::from)
            .ok_or_else(|| Error::config("DATA_VOLUMES_CONFIG is not set"))?,
    };

    let content = std::fs::read_to_string(&path).map_err(|e| io_error("reading", &path, e))?;
    let volumes = content
        .lines()
        .map(|line| expand_vars(line.trim(), lookup))
        .filter(|line| !line.trim().is_empty())
        .map(|line| Volume::parse(&line))
        .collect::<Result<Vec<_>>>()?;

    if volumes.is_empty() {
        return Err(Error::config(format!(
            "no volumes configured in {}",
            path.display()
        )));
    }
    Ok(volumes)
}
