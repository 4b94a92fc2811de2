//! Per-run memoization of `run_cmd()` invocations.
//!
//! Identical argument vectors return the cached stdout within one run. The
//! cache is keyed per calling directory unless the caller opted into the
//! run-global scope, and is instantiated per run so parallel test runs never
//! cross-contaminate.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

#[derive(Debug, Default)]
pub struct RunCmdCache {
    entries: Mutex<HashMap<String, String>>,
}

impl RunCmdCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key over the argv vector, NUL-joined so argument boundaries
    /// survive hashing. `dir` is None for run-global entries.
    pub fn key(dir: Option<&Path>, argv: &[String]) -> String {
        let mut h = Sha256::new();
        if let Some(dir) = dir {
            h.update(dir.as_os_str().as_encoded_bytes());
        }
        for arg in argv {
            h.update(b"\0");
            h.update(arg.as_bytes());
        }
        format!("{:x}", h.finalize())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("run_cmd cache lock")
            .get(key)
            .cloned()
    }

    pub fn put(&self, key: String, stdout: String) {
        self.entries
            .lock()
            .expect("run_cmd cache lock")
            .insert(key, stdout);
    }
}
