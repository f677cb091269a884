#![allow(dead_code)]

use std::{
    ffi::OsStr,
    io::{BufRead, BufReader},
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

/// Path of the built demo binary.
pub fn demo_bin() -> PathBuf {
    assert_cmd::cargo::cargo_bin("hotswap-demo")
}

/// Grabs an ephemeral port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    listener.local_addr().expect("local addr").port()
}

/// A running master that is killed when the test ends.
pub struct MasterGuard {
    child: Child,
}

impl MasterGuard {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Whether the master is still running. A finished master is
    /// reaped here, so zombies do not read as alive.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn signal(&self, signal: libc::c_int) {
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, signal);
        }
    }

    /// Waits for the master to exit on its own, returning its exit
    /// code, or `None` if it is still running after `timeout`.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status.code().unwrap_or(-1));
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

impl Drop for MasterGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        // The slave notices the vanished parent within a second.
    }
}

/// Spawns `binary` as a supervising master with the given arguments.
pub fn spawn_master<I, S>(binary: &Path, args: I) -> MasterGuard
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn master");
    MasterGuard { child }
}

/// One greeting round-trip against the demo server, if it answers.
pub fn greeting(address: &str) -> Option<String> {
    let parsed = address.parse().ok()?;
    let stream =
        TcpStream::connect_timeout(&parsed, Duration::from_millis(500)).ok()?;
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .ok()?;
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).ok()?;
    if line.is_empty() { None } else { Some(line.trim_end().to_string()) }
}

/// Polls the demo server until a greeting satisfies `accept`.
pub fn wait_for_greeting(
    address: &str,
    what: &str,
    accept: impl Fn(&str) -> bool,
) -> String {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(line) = greeting(address)
            && accept(&line)
        {
            return line;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {what} on {address}");
        }

        thread::sleep(Duration::from_millis(100));
    }
}

/// Asserts the server keeps answering with the same greeting for
/// `window`, i.e. nothing restarted or died in the meantime.
pub fn assert_greeting_stable(address: &str, expected: &str, window: Duration) {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        if let Some(line) = greeting(address) {
            assert_eq!(line, expected, "server changed generations unexpectedly");
        }
        thread::sleep(Duration::from_millis(200));
    }
}
