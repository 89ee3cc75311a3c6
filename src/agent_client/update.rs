//! Self-update — download the matching release bundle, swap the running
//! binary atomically, and re-exec.
//!
//! Swap sequence: rename the current binary to `<path>.bak`, copy the new
//! binary into `<path>`, then re-exec under the canonical path. If the
//! currently running image is itself a `.bak` path (recovering from a
//! prior update whose re-exec never completed), the old backup is removed
//! outright instead of creating a second-generation backup.

use std::path::{Path, PathBuf};

use anyhow::Context;

/// Download the bundle matching `os`/`arch`, unpack it, swap the running
/// binary, and re-exec. On success this function does not return — the
/// process image has been replaced in place.
pub async fn perform_update(server_url: &str, token: &str, machine_id: &str, os: &str, arch: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{server_url}/api/agent/download?os={os}&arch={arch}");
    let bytes = client
        .get(&url)
        .bearer_auth(token)
        .header("X-Machine-ID", machine_id)
        .send()
        .await
        .context("update-failure: download request failed")?
        .error_for_status()
        .context("update-failure: server rejected download request")?
        .bytes()
        .await
        .context("update-failure: reading download body")?;

    let tmp_dir = tempfile::tempdir().context("update-failure: creating scratch directory")?;
    {
        let gz = flate2::read::GzDecoder::new(&bytes[..]);
        let mut archive = tar::Archive::new(gz);
        archive
            .unpack(tmp_dir.path())
            .context("update-failure: unpacking bundle")?;
    }

    let bin_name = if cfg!(windows) { "baihu-agent.exe" } else { "baihu-agent" };
    let new_binary = tmp_dir.path().join(bin_name);
    if !new_binary.exists() {
        anyhow::bail!("update-failure: bundle did not contain {bin_name}");
    }

    swap_and_reexec(&new_binary)
}

fn swap_and_reexec(new_binary: &Path) -> anyhow::Result<()> {
    let current = std::env::current_exe().context("update-failure: resolving current executable")?;
    let current_str = current.to_string_lossy().to_string();

    let canonical = if let Some(stripped) = current_str.strip_suffix(".bak") {
        let canonical = PathBuf::from(stripped);
        std::fs::copy(new_binary, &canonical).context("update-failure: installing new binary")?;
        let _ = std::fs::remove_file(&current);
        canonical
    } else {
        let backup = PathBuf::from(format!("{current_str}.bak"));
        std::fs::rename(&current, &backup).context("update-failure: backing up current binary")?;
        std::fs::copy(new_binary, &current).context("update-failure: installing new binary")?;
        current
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perm = std::fs::metadata(&canonical)?.permissions();
        perm.set_mode(0o755);
        std::fs::set_permissions(&canonical, perm)?;
    }

    tracing::info!(path = %canonical.display(), "update applied, re-executing");
    reexec(&canonical)
}

#[cfg(unix)]
fn reexec(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;
    let err = std::process::Command::new(path)
        .args(std::env::args().skip(1))
        .exec();
    Err(anyhow::anyhow!("update-failure: re-exec failed: {err}"))
}

#[cfg(not(unix))]
fn reexec(path: &Path) -> anyhow::Result<()> {
    std::process::Command::new(path).args(std::env::args().skip(1)).spawn()?;
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bak_suffix_is_stripped_for_canonical_path() {
        let p = "/opt/baihu/baihu-agent.bak";
        assert_eq!(p.strip_suffix(".bak"), Some("/opt/baihu/baihu-agent"));
    }
}
