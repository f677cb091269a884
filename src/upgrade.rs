//! Upgrade engine: fetch, verify, sanity-test, atomically install.
//!
//! The ordering here is load-bearing. The digest is compared twice
//! (against the fetcher's hint before download, against the downloaded
//! content after), the sanity self-test runs after permissions are
//! copied (the candidate must be executable) and before the overwrite
//! (a working binary is never clobbered with an unproven one), and the
//! temp file is removed on every exit path.

use std::{
    env,
    fs::{self, OpenOptions},
    io::{self, Read, Write},
    os::unix::{fs::OpenOptionsExt, process::CommandExt},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use nix::{
    sys::signal::Signal,
    unistd::{self, Gid, Pid, Uid},
};
use rand::Rng;
use tracing::{debug, warn};

use crate::{
    config::PreUpgradeFn,
    digest::Digest,
    env::ENV_BIN_CHECK,
    error::UpgradeError,
    fetcher::{BinStat, Fetcher},
    signals,
};

/// Hard deadline for the candidate's sanity self-test.
const SANITY_TIMEOUT: Duration = Duration::from_secs(5);

const COPY_BUF: usize = 32 * 1024;

/// What a single upgrade attempt concluded.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum UpgradeOutcome {
    /// The fetcher reported no change.
    NoUpdate,
    /// The fetcher returned a stream whose bytes match the installed
    /// binary.
    Identical,
    /// A verified candidate now sits at the binary path.
    Installed {
        /// Digest of the newly installed binary.
        hash: String,
    },
}

/// Owns the upgrade path for one master process.
pub(crate) struct UpgradeEngine {
    bin_path: PathBuf,
    tmp_bin_path: PathBuf,
    bin_hash: Mutex<String>,
    bin_perms: fs::Permissions,
    uid: Uid,
    gid: Gid,
    pre_upgrade: Option<PreUpgradeFn>,
}

impl UpgradeEngine {
    pub(crate) fn new(
        bin_path: PathBuf,
        tmp_bin_path: PathBuf,
        bin_hash: String,
        bin_perms: fs::Permissions,
        pre_upgrade: Option<PreUpgradeFn>,
    ) -> Self {
        Self {
            bin_path,
            tmp_bin_path,
            bin_hash: Mutex::new(bin_hash),
            bin_perms,
            uid: unistd::getuid(),
            gid: unistd::getgid(),
            pre_upgrade,
        }
    }

    /// Digest of the binary currently installed at the binary path.
    pub(crate) fn current_hash(&self) -> String {
        self.bin_hash.lock().expect("binary hash poisoned").clone()
    }

    pub(crate) fn bin_path(&self) -> &Path {
        &self.bin_path
    }

    /// Runs one fetch-verify-install attempt. Any error leaves the
    /// installed binary untouched and removes the temp file.
    pub(crate) fn apply(
        &self,
        fetcher: &mut dyn Fetcher,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        let stat = BinStat {
            hash: self.current_hash(),
        };
        let Some(mut reader) = fetcher.fetch(&stat).map_err(UpgradeError::Fetch)? else {
            return Ok(UpgradeOutcome::NoUpdate);
        };
        debug!("streaming update");

        let _cleanup = TempCleanup {
            path: &self.tmp_bin_path,
        };

        // Tee the stream through the digest while writing the temp file.
        // The handle must be closed before the candidate is executed.
        let downloaded = {
            let mut temp = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o666)
                .open(&self.tmp_bin_path)
                .map_err(UpgradeError::OpenTemp)?;
            let mut digest = Digest::new();
            let mut buf = [0u8; COPY_BUF];
            loop {
                let n = reader.read(&mut buf).map_err(UpgradeError::WriteTemp)?;
                if n == 0 {
                    break;
                }
                digest.update(&buf[..n]);
                temp.write_all(&buf[..n]).map_err(UpgradeError::WriteTemp)?;
            }
            digest.hex()
        };

        if downloaded == stat.hash {
            debug!("hash match, skipping");
            return Ok(UpgradeOutcome::Identical);
        }

        fs::set_permissions(&self.tmp_bin_path, self.bin_perms.clone())
            .map_err(UpgradeError::Chmod)?;
        unistd::chown(&self.tmp_bin_path, Some(self.uid), Some(self.gid))
            .map_err(|err| UpgradeError::Chown(err.into()))?;
        let info = fs::metadata(&self.tmp_bin_path).map_err(UpgradeError::StatTemp)?;
        if info.len() == 0 {
            return Err(UpgradeError::EmptyTemp);
        }

        if let Some(pre_upgrade) = &self.pre_upgrade {
            pre_upgrade(&self.tmp_bin_path).map_err(UpgradeError::PreUpgrade)?;
        }

        self.sanity_check()?;

        move_file(&self.bin_path, &self.tmp_bin_path).map_err(UpgradeError::Overwrite)?;
        *self.bin_hash.lock().expect("binary hash poisoned") = downloaded.clone();
        Ok(UpgradeOutcome::Installed { hash: downloaded })
    }

    /// Proves the candidate is a compatible executable: spawn it with a
    /// fresh token in the environment and require the token echoed back
    /// verbatim within the deadline.
    fn sanity_check(&self) -> Result<(), UpgradeError> {
        let token = token();
        let mut command = Command::new(&self.tmp_bin_path);
        let mut args = env::args_os();
        if let Some(argv0) = args.next() {
            command.arg0(argv0);
        }
        command
            .args(args)
            .env(ENV_BIN_CHECK, &token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = command.spawn().map_err(UpgradeError::SanitySpawn)?;
        let pid = Pid::from_raw(child.id() as i32);
        let finished = Arc::new(AtomicBool::new(false));
        let timed_out = Arc::new(AtomicBool::new(false));
        {
            let finished = Arc::clone(&finished);
            let timed_out = Arc::clone(&timed_out);
            thread::spawn(move || {
                thread::sleep(SANITY_TIMEOUT);
                if !finished.load(Ordering::SeqCst) {
                    warn!("sanity check against fetched executable timed out");
                    timed_out.store(true, Ordering::SeqCst);
                    let _ = signals::send(pid, Signal::SIGKILL);
                }
            });
        }

        let output = child.wait_with_output().map_err(UpgradeError::SanitySpawn)?;
        finished.store(true, Ordering::SeqCst);
        if timed_out.load(Ordering::SeqCst) {
            return Err(UpgradeError::SanityTimeout(SANITY_TIMEOUT));
        }

        let mut echoed = String::from_utf8_lossy(&output.stdout).into_owned();
        echoed.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(UpgradeError::SanityFailed {
                code: output.status.code().unwrap_or(1),
                output: echoed,
            });
        }
        if echoed != token {
            return Err(UpgradeError::SanityMismatch { got: echoed });
        }
        Ok(())
    }
}

/// Removes the temp binary on every exit path. After a successful
/// install the file has already moved, so the removal is a no-op.
struct TempCleanup<'a> {
    path: &'a Path,
}

impl Drop for TempCleanup<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path);
    }
}

/// Fresh 16-hex-char token.
pub(crate) fn token() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Process-unique temp path for candidate binaries.
pub(crate) fn unique_tmp_path() -> PathBuf {
    env::temp_dir().join(format!(
        "hotswap-{}{}",
        token(),
        std::env::consts::EXE_SUFFIX
    ))
}

/// Moves `src` over `dst`, replacing it. Falls back to copy-and-remove
/// when the paths live on different filesystems.
pub(crate) fn move_file(dst: &Path, src: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)?;
            Ok(())
        }
        Err(err) => Err(err),
    }
}
