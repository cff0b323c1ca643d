//! Local shared-storage path to cluster mount mapping.
//!
//! The workstation sees the shared volume under a drive letter or mount point
//! (`J:\Cluster\Simulation`), the cluster sees it under its own prefix
//! (`/work/user/Work`). Only the prefix is rewritten; the remainder keeps its
//! components and is emitted with `/` separators.

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTranslator {
    pub local_prefix: String,
    pub remote_prefix: String,
}

impl PathTranslator {
    pub fn new(local_prefix: impl Into<String>, remote_prefix: impl Into<String>) -> Self {
        Self {
            local_prefix: local_prefix.into(),
            remote_prefix: remote_prefix.into(),
        }
    }

    /// Maps a local path to the remote mount. Paths outside the local prefix
    /// keep their components and only get their separators normalised.
    pub fn to_remote(&self, local: &str) -> String {
        let local_norm = to_posix(local);
        let prefix = to_posix(&self.local_prefix);
        let prefix = prefix.trim_end_matches('/');
        let remote = match strip_prefix_components(&local_norm, prefix) {
            Some(rest) => join_posix(self.remote_prefix.trim_end_matches('/'), rest),
            None => local_norm.clone(),
        };
        debug!(local = %local, remote = %remote, "translated path");
        remote
    }

    pub fn covers(&self, local: &str) -> bool {
        let prefix = to_posix(&self.local_prefix);
        strip_prefix_components(&to_posix(local), prefix.trim_end_matches('/')).is_some()
    }
}

fn to_posix(p: &str) -> String {
    let replaced = p.replace('\\', "/");
    let mut out = String::with_capacity(replaced.len());
    let mut prev_slash = false;
    for c in replaced.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

// Prefix match on whole components: `J:/Sim` covers `J:/Sim/a` but not `J:/Simulation`.
fn strip_prefix_components<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return None;
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some("")
    } else if let Some(stripped) = rest.strip_prefix('/') {
        Some(stripped)
    } else {
        None
    }
}

fn join_posix(base: &str, rest: &str) -> String {
    if rest.is_empty() {
        base.to_string()
    } else if base.is_empty() {
        format!("/{}", rest)
    } else {
        format!("{}/{}", base, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> PathTranslator {
        PathTranslator::new(r"J:\Cluster\Simulation", "/work/alice/Work")
    }

    #[test]
    fn maps_windows_prefix_to_remote_mount() {
        let t = translator();
        assert_eq!(
            t.to_remote(r"J:\Cluster\Simulation\d0816\opt_g5\optimizationg5_1.fsp"),
            "/work/alice/Work/d0816/opt_g5/optimizationg5_1.fsp"
        );
    }

    #[test]
    fn accepts_forward_slash_local_paths() {
        let t = translator();
        assert_eq!(
            t.to_remote("J:/Cluster/Simulation/run/sweep_1.fsp"),
            "/work/alice/Work/run/sweep_1.fsp"
        );
    }

    #[test]
    fn prefix_itself_maps_to_remote_root() {
        let t = translator();
        assert_eq!(t.to_remote(r"J:\Cluster\Simulation\"), "/work/alice/Work");
    }

    #[test]
    fn partial_component_is_not_a_prefix_match() {
        let t = PathTranslator::new("J:/Cluster/Sim", "/work");
        assert!(!t.covers("J:/Cluster/Simulation/a.fsp"));
        assert_eq!(
            t.to_remote(r"J:\Cluster\Simulation\a.fsp"),
            "J:/Cluster/Simulation/a.fsp"
        );
    }

    #[test]
    fn unix_prefixes_work_too() {
        let t = PathTranslator::new("/mnt/shared/", "/home/alice/shared");
        assert_eq!(
            t.to_remote("/mnt/shared//jobs/x.lms"),
            "/home/alice/shared/jobs/x.lms"
        );
    }
}
