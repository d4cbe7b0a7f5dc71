//! Stable per-workspace loopback addresses.
//!
//! Every workspace gets an address in `127.18.0.0/16`, derived from its name alone so that
//! the network shim inside the sandbox and the ingress router outside it agree without
//! talking to each other.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Names the workspace explicitly. Takes precedence over the working directory.
pub const WORKSPACE_ENV: &str = "FABRIC_WORKSPACE_ID";
/// When set to `1` the preload shim stays inert.
pub const DISABLE_ENV: &str = "FABRIC_PRELOAD_DISABLE";
/// When set to a non-empty value the preload shim writes diagnostics to stderr.
pub const DEBUG_LOG_ENV: &str = "FABRIC_PRELOAD_LOG";
/// Working directories whose last component starts with this prefix name a workspace.
pub const WORKSPACE_DIR_PREFIX: &str = "workspace-";

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Last `/`-separated component of a workspace name.
fn base_component(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// FNV-1a over the lowercased input, folded into 16 bits.
pub fn fnv1a16_lower(input: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in input.bytes() {
        hash ^= u32::from(byte.to_ascii_lowercase());
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash & 0xFFFF
}

/// Sequence number for a workspace name.
///
/// A trailing decimal suffix (`workspace-300` -> 300) is used verbatim when it fits in a
/// `u32`. Names without one, or whose suffix overflows, fall back to the 16-bit hash of the
/// lowercased base component.
pub fn workspace_sequence(name: &str) -> u32 {
    let base = base_component(name);
    let digits_start = base
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(idx, _)| idx);

    if let Some(start) = digits_start {
        if let Ok(n) = base[start..].parse::<u32>() {
            return n;
        }
    }
    fnv1a16_lower(base)
}

/// Address for a sequence number. Only the low 16 bits contribute.
pub fn address_for_sequence(sequence: u32) -> Ipv4Addr {
    Ipv4Addr::new(127, 18, ((sequence >> 8) & 0xFF) as u8, (sequence & 0xFF) as u8)
}

/// Compute the workspace's IPv4 address in `127.18.0.0/16`. Returns `None` for an empty name.
pub fn workspace_ip_from_name(name: &str) -> Option<Ipv4Addr> {
    let trimmed = name.trim();
    if base_component(trimmed).is_empty() {
        return None;
    }
    Some(address_for_sequence(workspace_sequence(trimmed)))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceIdentity {
    pub name: String,
    pub sequence: u32,
    pub address: Ipv4Addr,
}

impl WorkspaceIdentity {
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        let address = workspace_ip_from_name(name)?;
        Some(Self {
            name: name.to_string(),
            sequence: workspace_sequence(name),
            address,
        })
    }
}

impl fmt::Display for WorkspaceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Where a detected identity came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionSource {
    Environment,
    WorkingDirectory,
}

/// Resolve the workspace for a process.
///
/// The explicit environment value wins when non-empty; otherwise the working directory is
/// used if its last component starts with `workspace-`. Anything else yields `None` and the
/// caller should stay inert.
pub fn detect_workspace(
    env_value: Option<&str>,
    cwd: Option<&Path>,
) -> Option<(WorkspaceIdentity, DetectionSource)> {
    if let Some(value) = env_value.map(str::trim).filter(|v| !v.is_empty()) {
        return WorkspaceIdentity::from_name(value).map(|id| (id, DetectionSource::Environment));
    }

    let dir_name = cwd?.file_name()?.to_str()?;
    if !dir_name.starts_with(WORKSPACE_DIR_PREFIX) {
        return None;
    }
    WorkspaceIdentity::from_name(dir_name).map(|id| (id, DetectionSource::WorkingDirectory))
}

/// True when the disable flag is exactly `1`.
pub fn is_disabled(value: Option<&str>) -> bool {
    value == Some("1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn numeric_suffix_maps_to_sequence() {
        assert_eq!(workspace_sequence("workspace-300"), 300);
        assert_eq!(
            workspace_ip_from_name("workspace-300"),
            Some(Ipv4Addr::new(127, 18, 1, 44))
        );
        assert_eq!(
            workspace_ip_from_name("workspace-1"),
            Some(Ipv4Addr::new(127, 18, 0, 1))
        );
    }

    #[test]
    fn uses_last_path_component() {
        assert_eq!(
            workspace_ip_from_name("/root/workspaces/workspace-2"),
            workspace_ip_from_name("workspace-2")
        );
    }

    #[test]
    fn distinct_suffixes_get_distinct_addresses() {
        let mut seen = std::collections::HashSet::new();
        for n in 0..65536u32 {
            let ip = workspace_ip_from_name(&format!("workspace-{n}")).unwrap();
            assert!(seen.insert(ip), "collision at {n}");
        }
    }

    #[test]
    fn hash_fallback_is_deterministic_and_case_insensitive() {
        let a = workspace_ip_from_name("Feature-Branch").unwrap();
        let b = workspace_ip_from_name("feature-branch").unwrap();
        assert_eq!(a, b);
        assert_eq!(workspace_ip_from_name("feature-branch"), Some(a));
        assert_eq!(a.octets()[0..2], [127, 18]);
        assert_eq!(
            workspace_sequence("feature-branch"),
            fnv1a16_lower("feature-branch")
        );
    }

    #[test]
    fn overflowing_suffix_falls_back_to_hash() {
        let name = "workspace-99999999999";
        assert_eq!(workspace_sequence(name), fnv1a16_lower(name));
        assert!(workspace_ip_from_name(name).is_some());
    }

    #[test]
    fn empty_name_has_no_identity() {
        assert_eq!(workspace_ip_from_name(""), None);
        assert_eq!(workspace_ip_from_name("a/"), None);
        assert!(WorkspaceIdentity::from_name("  ").is_none());
    }

    #[test]
    fn env_value_wins_over_cwd() {
        let cwd = PathBuf::from("/tmp/workspace-9");
        let (id, source) = detect_workspace(Some("workspace-4"), Some(&cwd)).unwrap();
        assert_eq!(source, DetectionSource::Environment);
        assert_eq!(id.address, Ipv4Addr::new(127, 18, 0, 4));
    }

    #[test]
    fn cwd_detection_requires_prefix() {
        let cwd = PathBuf::from("/tmp/workspace-9");
        let (id, source) = detect_workspace(Some(""), Some(&cwd)).unwrap();
        assert_eq!(source, DetectionSource::WorkingDirectory);
        assert_eq!(id.name, "workspace-9");
        assert_eq!(id.sequence, 9);

        let other = PathBuf::from("/home/user/project");
        assert!(detect_workspace(None, Some(&other)).is_none());
        assert!(detect_workspace(None, None).is_none());
    }

    #[test]
    fn disable_flag_is_exact() {
        assert!(is_disabled(Some("1")));
        assert!(!is_disabled(Some("true")));
        assert!(!is_disabled(None));
    }

    #[test]
    fn identity_serializes_address_as_string() {
        let id = WorkspaceIdentity::from_name("workspace-300").unwrap();
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["address"], "127.18.1.44");
        assert_eq!(id.to_string(), "workspace-300 (127.18.1.44)");
    }
}
