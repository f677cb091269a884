//! Pluggable sources of candidate binaries.
//!
//! The upgrade engine only needs [`Fetcher`]: given the hash of the
//! currently installed binary, produce either "no change" or a readable
//! stream of a candidate image. Transport, authentication, and
//! rate-limiting details live inside implementations; the master still
//! enforces its own fetch-interval floor externally.

use std::{
    fs::{self, File},
    io::Read,
    path::PathBuf,
    thread,
    time::Duration,
};

use tracing::debug;

use crate::{digest, error::FetchError};

/// Description of the installed binary handed to [`Fetcher::fetch`].
#[derive(Debug, Clone)]
pub struct BinStat {
    /// Content hash of the binary currently on disk.
    pub hash: String,
}

/// Strategy that produces candidate binary images.
pub trait Fetcher: Send {
    /// Called once before the first fetch. An error disables fetching
    /// for the life of the master (logged, not fatal).
    fn init(&mut self) -> Result<(), FetchError>;

    /// Checks for a new image. `Ok(None)` means "no change from
    /// `stat.hash`". Dropping the returned reader closes it.
    fn fetch(&mut self, stat: &BinStat) -> Result<Option<Box<dyn Read + Send>>, FetchError>;
}

const STABILITY_PROBE: Duration = Duration::from_millis(250);
const STABILITY_WINDOW: Duration = Duration::from_secs(5);

/// Polls a filesystem path for replacement binaries.
///
/// A missing file is not an error; the fetcher simply reports no
/// change until something appears. Once the observed content differs
/// from the installed hash, the file is re-hashed every 250ms until two
/// consecutive observations agree, so a binary still being copied into
/// place is never served mid-write.
pub struct FileFetcher {
    path: PathBuf,
    interval: Duration,
    hash: Option<String>,
    delay: bool,
}

impl FileFetcher {
    /// Creates a fetcher watching `path`, checking at most once per
    /// `interval` (floored at one second by `init`).
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            hash: None,
            delay: false,
        }
    }

    fn refresh_hash(&mut self) -> Result<(), FetchError> {
        match fs::read(&self.path) {
            Ok(data) => {
                self.hash = Some(digest::hash_bytes(&data));
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Fetcher for FileFetcher {
    fn init(&mut self) -> Result<(), FetchError> {
        if self.path.as_os_str().is_empty() {
            return Err(FetchError::Misconfigured {
                reason: "watch path required".into(),
            });
        }
        if self.interval < Duration::from_secs(1) {
            self.interval = Duration::from_secs(1);
        }
        self.refresh_hash()
    }

    fn fetch(&mut self, stat: &BinStat) -> Result<Option<Box<dyn Read + Send>>, FetchError> {
        // Only delay after the first fetch.
        if self.delay {
            thread::sleep(self.interval);
        }
        self.delay = true;

        self.refresh_hash()?;
        let Some(observed) = self.hash.clone() else {
            return Ok(None);
        };
        if observed == stat.hash {
            return Ok(None);
        }

        debug!("candidate found at {}", self.path.display());
        let file = File::open(&self.path)?;

        // Re-check until the content stops changing.
        let attempts = (STABILITY_WINDOW.as_millis() / STABILITY_PROBE.as_millis()) as u32;
        let mut last_hash = self.hash.clone();
        for attempt in 1.. {
            if attempt == attempts {
                return Err(FetchError::Unstable);
            }
            thread::sleep(STABILITY_PROBE);
            self.refresh_hash()?;
            if last_hash == self.hash {
                break;
            }
            last_hash = self.hash.clone();
        }

        Ok(Some(Box::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    use tempfile::tempdir;

    fn write_file(path: &std::path::Path, content: &[u8]) {
        let mut file = File::create(path).expect("create");
        file.write_all(content).expect("write");
    }

    #[test]
    fn init_requires_a_path_and_floors_the_interval() {
        let mut empty = FileFetcher::new("", Duration::from_secs(10));
        assert!(matches!(
            empty.init(),
            Err(FetchError::Misconfigured { .. })
        ));

        let dir = tempdir().expect("tempdir");
        let mut fetcher = FileFetcher::new(dir.path().join("app"), Duration::ZERO);
        fetcher.init().expect("init with missing file is fine");
        assert_eq!(fetcher.interval, Duration::from_secs(1));
    }

    #[test]
    fn missing_file_reports_no_change() {
        let dir = tempdir().expect("tempdir");
        let mut fetcher = FileFetcher::new(dir.path().join("app"), Duration::from_secs(1));
        fetcher.init().expect("init");

        let stat = BinStat { hash: digest::hash_bytes(b"installed") };
        assert!(fetcher.fetch(&stat).expect("fetch").is_none());
    }

    #[test]
    fn unchanged_content_reports_no_change() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("app");
        write_file(&path, b"installed");

        let mut fetcher = FileFetcher::new(&path, Duration::from_secs(1));
        fetcher.init().expect("init");

        let stat = BinStat { hash: digest::hash_bytes(b"installed") };
        assert!(fetcher.fetch(&stat).expect("fetch").is_none());
    }

    #[test]
    fn changed_content_yields_the_new_image() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("app");
        write_file(&path, b"version-b");

        let mut fetcher = FileFetcher::new(&path, Duration::from_secs(1));
        fetcher.init().expect("init");

        let stat = BinStat { hash: digest::hash_bytes(b"version-a") };
        let mut reader = fetcher
            .fetch(&stat)
            .expect("fetch")
            .expect("candidate expected");
        let mut content = Vec::new();
        reader.read_to_end(&mut content).expect("read candidate");
        assert_eq!(content, b"version-b");
    }
}
