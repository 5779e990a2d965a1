//! File-system-backed session descriptors.
//!
//! One subdirectory per session under the control root:
//! `<root>/<id>/{session.json, stdout, stdin, ipc.sock}`. A top-level
//! `.version` file records the last software version that touched the root
//! and drives bulk cleanup on startup.

use crate::process;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use ttyhub_core::{HubError, HubResult};

pub const DESCRIPTOR_FILE: &str = "session.json";
pub const STDOUT_FILE: &str = "stdout";
pub const STDIN_FILE: &str = "stdin";
pub const SOCKET_FILE: &str = "ipc.sock";
const VERSION_FILE: &str = ".version";

/// Exit code recorded when the sweep finds a dead `running` session.
pub const ZOMBIE_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

/// Durable session metadata, exposed to collaborators as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: String,
    pub command: Vec<String>,
    pub name: String,
    pub working_dir: String,
    pub status: SessionStatus,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub cols: u16,
    pub rows: u16,
    /// Software version that created this session; unstamped descriptors
    /// are treated as legacy during cleanup.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub last_modified: String,
}

/// CRUD over descriptors plus naming, sweeping, and version cleanup.
#[derive(Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> HubResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Session ids are restricted to a safe filename alphabet; anything
    /// else (separators, traversal, empty) is rejected.
    pub fn validate_id(id: &str) -> HubResult<()> {
        let ok = !id.is_empty()
            && id.len() <= 64
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if ok {
            Ok(())
        } else {
            Err(HubError::InvalidSessionId(id.to_string()))
        }
    }

    pub fn session_dir(&self, id: &str) -> HubResult<PathBuf> {
        Self::validate_id(id)?;
        Ok(self.root.join(id))
    }

    pub fn descriptor_path(&self, id: &str) -> HubResult<PathBuf> {
        Ok(self.session_dir(id)?.join(DESCRIPTOR_FILE))
    }

    pub fn stdout_path(&self, id: &str) -> HubResult<PathBuf> {
        Ok(self.session_dir(id)?.join(STDOUT_FILE))
    }

    pub fn stdin_path(&self, id: &str) -> HubResult<PathBuf> {
        Ok(self.session_dir(id)?.join(STDIN_FILE))
    }

    pub fn socket_path(&self, id: &str) -> HubResult<PathBuf> {
        let path = self.session_dir(id)?.join(SOCKET_FILE);
        // sockaddr_un paths are capped around 104 bytes; ids are kept short
        // but a deeply nested control root can still blow the limit.
        if path.as_os_str().len() > 100 {
            warn!(path = %path.display(), "socket path close to platform limit");
        }
        Ok(path)
    }

    pub fn create_session_dir(&self, id: &str) -> HubResult<PathBuf> {
        let dir = self.session_dir(id)?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Persist a descriptor atomically: write a temp file, verify the
    /// session directory still exists, then rename into place. Stamps
    /// `lastModified`.
    pub fn save(&self, desc: &mut SessionDescriptor) -> HubResult<()> {
        desc.last_modified = Utc::now().to_rfc3339();
        let dir = self.session_dir(&desc.id)?;
        let tmp = dir.join(".session.json.tmp");
        let target = dir.join(DESCRIPTOR_FILE);

        let json = serde_json::to_vec_pretty(desc).map_err(|e| HubError::SaveSessionFailed {
            session_id: desc.id.clone(),
            detail: e.to_string(),
        })?;

        fs::write(&tmp, json).map_err(|e| HubError::SaveSessionFailed {
            session_id: desc.id.clone(),
            detail: e.to_string(),
        })?;

        if !dir.is_dir() {
            let _ = fs::remove_file(&tmp);
            return Err(HubError::SessionDirDeleted(desc.id.clone()));
        }

        fs::rename(&tmp, &target).map_err(|e| HubError::SaveSessionFailed {
            session_id: desc.id.clone(),
            detail: e.to_string(),
        })
    }

    pub fn load(&self, id: &str) -> HubResult<Option<SessionDescriptor>> {
        let path = self.descriptor_path(id)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let desc = serde_json::from_slice(&data)
            .map_err(|e| HubError::Other(format!("corrupt descriptor for {id}: {e}")))?;
        Ok(Some(desc))
    }

    /// All parseable descriptors under the root; malformed entries are
    /// skipped with a warning.
    pub fn list(&self) -> Vec<SessionDescriptor> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "cannot read control root");
                return out;
            }
        };
        for entry in entries.flatten() {
            let id = entry.file_name().to_string_lossy().into_owned();
            if Self::validate_id(&id).is_err() {
                continue;
            }
            match self.load(&id) {
                Ok(Some(desc)) => out.push(desc),
                Ok(None) => {}
                Err(e) => warn!(session_id = %id, error = %e, "skipping unreadable descriptor"),
            }
        }
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    pub fn remove(&self, id: &str) -> HubResult<()> {
        let dir = self.session_dir(id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Pick a display name unique among persisted sessions plus
    /// `also_taken`; collisions get a `"name (2)"`, `"name (3)"`, … suffix.
    pub fn unique_name(&self, desired: &str, also_taken: &[String]) -> String {
        let mut taken: Vec<String> = self.list().into_iter().map(|d| d.name).collect();
        taken.extend(also_taken.iter().cloned());
        Self::pick_unique(desired, &taken)
    }

    /// Suffixing logic shared with rename, where the caller excludes the
    /// session's own current name from `taken`.
    pub fn pick_unique(desired: &str, taken: &[String]) -> String {
        let taken: HashSet<&str> = taken.iter().map(String::as_str).collect();
        if !taken.contains(desired) {
            return desired.to_string();
        }
        let mut n = 2u32;
        loop {
            let candidate = format!("{desired} ({n})");
            if !taken.contains(candidate.as_str()) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Flip `running` descriptors whose pid no longer exists to `exited`
    /// with the default exit code. Returns the ids that were flipped.
    pub fn reap_zombies(&self) -> Vec<String> {
        let mut reaped = Vec::new();
        for mut desc in self.list() {
            if desc.status != SessionStatus::Running {
                continue;
            }
            let alive = desc.pid.map(process::process_alive).unwrap_or(false);
            if alive {
                continue;
            }
            info!(session_id = %desc.id, pid = ?desc.pid, "reaping zombie session");
            desc.status = SessionStatus::Exited;
            desc.exit_code = Some(ZOMBIE_EXIT_CODE);
            if let Err(e) = self.save(&mut desc) {
                warn!(session_id = %desc.id, error = %e, "failed to persist zombie reap");
            }
            reaped.push(desc.id);
        }
        reaped
    }

    /// Remove sessions stamped with a different software version (legacy
    /// unstamped sessions included), then record `current` in the control
    /// file. Returns the removed ids.
    pub fn cleanup_stale_versions(&self, current: &str) -> Vec<String> {
        let mut removed = Vec::new();
        for desc in self.list() {
            if desc.version == current {
                continue;
            }
            if desc.status == SessionStatus::Running {
                if let Some(pid) = desc.pid {
                    let _ = process::send_signal(pid, process::SIGTERM);
                }
            }
            info!(
                session_id = %desc.id,
                session_version = %desc.version,
                "removing session from different software version"
            );
            if let Err(e) = self.remove(&desc.id) {
                warn!(session_id = %desc.id, error = %e, "stale-version cleanup failed");
            } else {
                removed.push(desc.id);
            }
        }
        if let Err(e) = fs::write(self.root.join(VERSION_FILE), current) {
            warn!(error = %e, "cannot write control version file");
        } else {
            debug!(version = current, "control root stamped");
        }
        removed
    }

    /// Last version recorded in the control file, if any.
    pub fn recorded_version(&self) -> Option<String> {
        fs::read_to_string(self.root.join(VERSION_FILE))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, name: &str) -> SessionDescriptor {
        SessionDescriptor {
            id: id.into(),
            command: vec!["sleep".into(), "1".into()],
            name: name.into(),
            working_dir: "/tmp".into(),
            status: SessionStatus::Running,
            started_at: Utc::now().to_rfc3339(),
            pid: Some(std::process::id()),
            exit_code: None,
            cols: 80,
            rows: 24,
            version: "0.1.0".into(),
            last_modified: String::new(),
        }
    }

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("control")).unwrap();
        (dir, store)
    }

    #[test]
    fn id_validation_rejects_traversal() {
        assert!(SessionStore::validate_id("abc-123_X").is_ok());
        assert!(SessionStore::validate_id("").is_err());
        assert!(SessionStore::validate_id("../etc").is_err());
        assert!(SessionStore::validate_id("a/b").is_err());
        assert!(SessionStore::validate_id("a b").is_err());
    }

    #[test]
    fn save_load_round_trip() {
        let (_tmp, store) = store();
        store.create_session_dir("s1").unwrap();
        let mut desc = descriptor("s1", "demo");
        store.save(&mut desc).unwrap();
        assert!(!desc.last_modified.is_empty());

        let loaded = store.load("s1").unwrap().unwrap();
        assert_eq!(loaded.name, "demo");
        assert_eq!(loaded.status, SessionStatus::Running);
        assert_eq!(loaded.cols, 80);
    }

    #[test]
    fn descriptor_json_uses_camel_case() {
        let (_tmp, store) = store();
        store.create_session_dir("s1").unwrap();
        let mut desc = descriptor("s1", "demo");
        desc.exit_code = Some(0);
        store.save(&mut desc).unwrap();

        let raw = fs::read_to_string(store.descriptor_path("s1").unwrap()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(json.get("workingDir").is_some());
        assert!(json.get("startedAt").is_some());
        assert!(json.get("exitCode").is_some());
        assert!(json.get("lastModified").is_some());
    }

    #[test]
    fn save_into_deleted_dir_fails_cleanly() {
        let (_tmp, store) = store();
        store.create_session_dir("gone").unwrap();
        let mut desc = descriptor("gone", "x");
        store.save(&mut desc).unwrap();

        fs::remove_dir_all(store.session_dir("gone").unwrap()).unwrap();
        let err = store.save(&mut desc).unwrap_err();
        // Either the temp write or the directory check catches it.
        assert!(matches!(
            err,
            HubError::SessionDirDeleted(_) | HubError::SaveSessionFailed { .. }
        ));
    }

    #[test]
    fn unique_names_get_suffixes() {
        let (_tmp, store) = store();
        for (i, expected) in ["build", "build (2)", "build (3)"].iter().enumerate() {
            let id = format!("s{i}");
            store.create_session_dir(&id).unwrap();
            let name = store.unique_name("build", &[]);
            assert_eq!(&name, expected);
            let mut desc = descriptor(&id, &name);
            store.save(&mut desc).unwrap();
        }
    }

    #[test]
    fn unique_name_considers_live_names() {
        let (_tmp, store) = store();
        let name = store.unique_name("work", &["work".to_string()]);
        assert_eq!(name, "work (2)");
    }

    #[test]
    fn zombie_sweep_flips_dead_running_sessions() {
        let (_tmp, store) = store();
        store.create_session_dir("dead").unwrap();
        let mut desc = descriptor("dead", "dead");
        desc.pid = Some(0x7fff_f000);
        store.save(&mut desc).unwrap();

        store.create_session_dir("live").unwrap();
        let mut desc = descriptor("live", "live");
        store.save(&mut desc).unwrap();

        let reaped = store.reap_zombies();
        assert_eq!(reaped, vec!["dead".to_string()]);

        let dead = store.load("dead").unwrap().unwrap();
        assert_eq!(dead.status, SessionStatus::Exited);
        assert_eq!(dead.exit_code, Some(ZOMBIE_EXIT_CODE));
        let live = store.load("live").unwrap().unwrap();
        assert_eq!(live.status, SessionStatus::Running);
    }

    #[test]
    fn version_cleanup_removes_foreign_and_legacy_sessions() {
        let (_tmp, store) = store();

        store.create_session_dir("old").unwrap();
        let mut old = descriptor("old", "old");
        old.status = SessionStatus::Exited;
        old.version = "0.0.9".into();
        store.save(&mut old).unwrap();

        store.create_session_dir("legacy").unwrap();
        let mut legacy = descriptor("legacy", "legacy");
        legacy.status = SessionStatus::Exited;
        legacy.version = String::new();
        store.save(&mut legacy).unwrap();

        store.create_session_dir("cur").unwrap();
        let mut cur = descriptor("cur", "cur");
        cur.version = "0.1.0".into();
        store.save(&mut cur).unwrap();

        let mut removed = store.cleanup_stale_versions("0.1.0");
        removed.sort();
        assert_eq!(removed, vec!["legacy".to_string(), "old".to_string()]);
        assert!(store.load("old").unwrap().is_none());
        assert!(store.load("cur").unwrap().is_some());
        assert_eq!(store.recorded_version().as_deref(), Some("0.1.0"));
    }
}
