//! Liveness probe for the process this agent runs next to, based on `/proc`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use orchestrator_client::LivenessGate;
use tracing::{debug, warn};

pub const PROC_ROOT: &str = "/proc";

/// Count processes whose name or command line contains `name`.
pub fn count_processes(name: &str) -> io::Result<usize> {
    count_processes_in(Path::new(PROC_ROOT), name)
}

pub fn count_processes_in(proc_root: &Path, name: &str) -> io::Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(proc_root)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let is_pid = file_name
            .to_str()
            .is_some_and(|pid| !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit()));
        if is_pid && process_matches(&entry.path(), name) {
            count += 1;
        }
    }
    Ok(count)
}

// A process can exit between listing and reading, so unreadable entries never match.
fn process_matches(dir: &Path, name: &str) -> bool {
    if let Ok(comm) = fs::read_to_string(dir.join("comm")) {
        if comm.trim_end().contains(name) {
            return true;
        }
    }
    match fs::read(dir.join("cmdline")) {
        Ok(raw) => String::from_utf8_lossy(&raw)
            .replace('\0', " ")
            .contains(name),
        Err(_) => false,
    }
}

/// Open while at least `min_processes` processes match `name`.
#[derive(Debug, Clone)]
pub struct ProcessGate {
    name: String,
    min_processes: usize,
    proc_root: PathBuf,
}

impl ProcessGate {
    pub fn new(name: impl Into<String>, min_processes: usize) -> Self {
        Self {
            name: name.into(),
            min_processes,
            proc_root: PathBuf::from(PROC_ROOT),
        }
    }

    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }
}

impl LivenessGate for ProcessGate {
    fn is_alive(&self) -> bool {
        match count_processes_in(&self.proc_root, &self.name) {
            Ok(count) if count >= self.min_processes => true,
            Ok(count) => {
                debug!(
                    service = %self.name,
                    count,
                    min = self.min_processes,
                    "external service not running"
                );
                false
            }
            Err(error) => {
                warn!(service = %self.name, %error, "failed to probe processes");
                false
            }
        }
    }
}
