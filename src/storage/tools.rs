//! Host block-device tooling: losetup, blockdev, dmsetup and e2fsprogs.

use anyhow::{bail, Context, Result};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Operations the snapshot chain needs from the host
#[async_trait::async_trait]
pub trait DeviceTools: Send + Sync {
    /// Attach `file` to a free loop device, returning its node
    async fn attach_loop(&self, file: &Path, read_only: bool) -> Result<PathBuf>;

    async fn detach_loop(&self, device: &Path) -> Result<()>;

    /// Size in 512-byte sectors
    async fn size_sectors(&self, device: &Path) -> Result<u64>;

    async fn dm_create(&self, name: &str, table: &str) -> Result<()>;

    /// Whether device-mapper knows a device called `name`
    async fn dm_exists(&self, name: &str) -> bool;

    async fn dm_remove(&self, names: &[String]) -> Result<()>;

    /// Preen-mode fsck; "errors corrected" counts as success
    async fn fsck(&self, device: &Path) -> Result<()>;

    /// Grow the filesystem to fill `device`
    async fn resize_fs(&self, device: &Path) -> Result<()>;

    async fn device_exists(&self, device: &Path) -> bool;

    /// Whether `path` is a block device node rather than a regular file
    async fn is_block_device(&self, path: &Path) -> bool;
}

/// [`DeviceTools`] backed by the host's util-linux, lvm2 and e2fsprogs
#[derive(Debug, Clone, Default)]
pub struct HostTools;

async fn output(program: &str, args: &[&str]) -> Result<Output> {
    debug!(target: "storage", "{} {}", program, args.join(" "));
    Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("executing {} {}", program, args.join(" ")))
}

async fn run(program: &str, args: &[&str]) -> Result<String> {
    let out = output(program, args).await?;
    if !out.status.success() {
        bail!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("non UTF-8 path: {}", path.display()))
}

/// dmsetup stderr meaning the device is already gone
pub fn is_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such device or address") || stderr.contains("not found")
}

#[async_trait::async_trait]
impl DeviceTools for HostTools {
    async fn attach_loop(&self, file: &Path, read_only: bool) -> Result<PathBuf> {
        let file = path_arg(file)?;
        let mut args = vec!["--find", "--show"];
        if read_only {
            args.push("--read-only");
        }
        args.push(file);
        let device = run("losetup", &args).await?;
        if device.is_empty() {
            bail!("losetup printed no device for {}", file);
        }
        Ok(PathBuf::from(device))
    }

    async fn detach_loop(&self, device: &Path) -> Result<()> {
        run("losetup", &["--detach", path_arg(device)?]).await?;
        Ok(())
    }

    async fn size_sectors(&self, device: &Path) -> Result<u64> {
        let out = run("blockdev", &["--getsz", path_arg(device)?]).await?;
        out.parse()
            .with_context(|| format!("parsing size of {}: {:?}", device.display(), out))
    }

    async fn dm_create(&self, name: &str, table: &str) -> Result<()> {
        debug!(target: "storage", name, table, "dmsetup create");
        let mut child = Command::new("dmsetup")
            .args(["create", name, "--verifyudev"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning dmsetup create")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(table.as_bytes())
                .await
                .context("writing device-mapper table")?;
        }

        let out = child
            .wait_with_output()
            .await
            .context("waiting for dmsetup create")?;
        if !out.status.success() {
            bail!(
                "dmsetup create {} failed: {}",
                name,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }

    async fn dm_exists(&self, name: &str) -> bool {
        matches!(output("dmsetup", &["info", name]).await, Ok(out) if out.status.success())
    }

    async fn dm_remove(&self, names: &[String]) -> Result<()> {
        let mut args = vec!["remove", "--verifyudev"];
        args.extend(names.iter().map(String::as_str));
        let out = output("dmsetup", &args).await?;
        if !out.status.success() {
            bail!(
                "dmsetup remove {} failed: {}",
                names.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }

    async fn fsck(&self, device: &Path) -> Result<()> {
        let out = output("e2fsck", &["-p", "-f", path_arg(device)?]).await?;
        match out.status.code() {
            Some(0) => Ok(()),
            Some(1) => {
                warn!(
                    target: "storage",
                    device = %device.display(),
                    "e2fsck corrected filesystem errors"
                );
                Ok(())
            }
            code => bail!(
                "e2fsck {} exited with {:?}: {}",
                device.display(),
                code,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        }
    }

    async fn resize_fs(&self, device: &Path) -> Result<()> {
        run("resize2fs", &[path_arg(device)?]).await?;
        Ok(())
    }

    async fn device_exists(&self, device: &Path) -> bool {
        tokio::fs::metadata(device).await.is_ok()
    }

    async fn is_block_device(&self, path: &Path) -> bool {
        matches!(
            tokio::fs::metadata(path).await,
            Ok(meta) if meta.file_type().is_block_device()
        )
    }
}
