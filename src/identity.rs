//! Machine identity — a deterministic fingerprint for an agent host, used
//! to recognize the same physical node across re-installs and token
//! rotations.

use sha2::{Digest, Sha256};

const VIRTUAL_IFACE_PREFIXES: &[&str] = &["lo", "docker", "br-", "veth", "virbr", "vmnet", "tun", "tap"];

/// Compute the stable machine identity: `sha256(hostname|mac|os|arch)` as
/// lowercase hex. `hostname` and `macs` are supplied by the caller so this
/// function stays a pure, testable transform rather than reaching into the
/// OS itself.
pub fn compute(hostname: &str, macs: &[String], os: &str, arch: &str) -> String {
    let mac = primary_mac(macs).unwrap_or_default();
    let joined = format!("{hostname}|{mac}|{os}|{arch}");
    let digest = Sha256::digest(joined.as_bytes());
    hex::encode(digest)
}

/// Pick the lexicographically smallest MAC address after filtering out
/// loopback/virtual/bridge/container interfaces.
fn primary_mac(macs: &[String]) -> Option<String> {
    macs.iter()
        .filter(|m| !m.is_empty() && *m != "00:00:00:00:00:00")
        .cloned()
        .min()
}

/// Enumerate this host's network interface MAC addresses, excluding
/// loopback and virtual/bridge/container interfaces by name prefix.
/// Only implemented for Linux, the only platform the agent currently ships
/// for; other targets get an empty list and fall back to hostname/os/arch
/// alone, which is still internally consistent (stable, just coarser).
#[cfg(target_os = "linux")]
pub fn local_macs() -> Vec<String> {
    let mut macs = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return macs;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if VIRTUAL_IFACE_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        let addr_path = entry.path().join("address");
        if let Ok(addr) = std::fs::read_to_string(addr_path) {
            let addr = addr.trim().to_lowercase();
            if !addr.is_empty() {
                macs.push(addr);
            }
        }
    }
    macs
}

#[cfg(not(target_os = "linux"))]
pub fn local_macs() -> Vec<String> {
    Vec::new()
}

/// Compute this host's machine identity using live system facts.
pub fn current() -> String {
    let hostname = hostname_string();
    let macs = local_macs();
    compute(&hostname, &macs, std::env::consts::OS, std::env::consts::ARCH)
}

fn hostname_string() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix_gethostname() {
            return name;
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(unix)]
fn nix_gethostname() -> std::io::Result<String> {
    let mut buf = vec![0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_for_fixed_inputs() {
        let macs = vec!["aa:bb:cc:dd:ee:ff".to_string()];
        let a = compute("host1", &macs, "linux", "x86_64");
        let b = compute("host1", &macs, "linux", "x86_64");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn different_hostnames_do_not_collide() {
        let macs = vec!["aa:bb:cc:dd:ee:ff".to_string()];
        let a = compute("host-a", &macs, "linux", "x86_64");
        let b = compute("host-b", &macs, "linux", "x86_64");
        assert_ne!(a, b);
    }

    #[test]
    fn primary_mac_picks_smallest_and_skips_zero() {
        let macs = vec![
            "00:00:00:00:00:00".to_string(),
            "ff:ee:dd:cc:bb:aa".to_string(),
            "02:00:00:00:00:01".to_string(),
        ];
        assert_eq!(primary_mac(&macs), Some("02:00:00:00:00:01".to_string()));
    }

    #[test]
    fn identity_ignores_mac_ordering() {
        let macs_a = vec!["bb:bb:bb:bb:bb:bb".to_string(), "aa:aa:aa:aa:aa:aa".to_string()];
        let macs_b = vec!["aa:aa:aa:aa:aa:aa".to_string(), "bb:bb:bb:bb:bb:bb".to_string()];
        assert_eq!(
            compute("host1", &macs_a, "linux", "x86_64"),
            compute("host1", &macs_b, "linux", "x86_64")
        );
    }
}
