use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs::OpenOptions;
use tracing::{debug, info};

use super::tools::DeviceTools;

/// Size in bytes of the base image, which is either a regular file or a
/// block device whose metadata length reads as zero
pub async fn base_image_size(tools: &dyn DeviceTools, base_image: &Path) -> Result<u64> {
    if tools.is_block_device(base_image).await {
        let sectors = tools
            .size_sectors(base_image)
            .await
            .with_context(|| format!("reading base device {}", base_image.display()))?;
        return Ok(sectors * 512);
    }
    let meta = tokio::fs::metadata(base_image)
        .await
        .with_context(|| format!("reading base image {}", base_image.display()))?;
    Ok(meta.len())
}

/// Make sure the writable overlay at `path` exists and can hold a full copy
/// of a `base_size` byte base image plus growth up to `disk_size` bytes.
///
/// The file is sparse. It is grown when too small and never shrunk, since
/// shrinking would cut off chunks the snapshot already wrote. Returns the
/// resulting size in bytes.
pub async fn ensure_overlay(path: &Path, disk_size: u64, base_size: u64) -> Result<u64> {
    let wanted = disk_size.max(base_size);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .with_context(|| format!("opening overlay {}", path.display()))?;
    let current = file.metadata().await.context("reading overlay size")?.len();

    if current >= wanted {
        debug!(
            target: "storage",
            overlay = %path.display(),
            size = current,
            "overlay already large enough"
        );
        return Ok(current);
    }

    file.set_len(wanted)
        .await
        .with_context(|| format!("resizing overlay {}", path.display()))?;
    info!(
        target: "storage",
        overlay = %path.display(),
        from = current,
        to = wanted,
        base = base_size,
        "sized overlay file"
    );
    Ok(wanted)
}
