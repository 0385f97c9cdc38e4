use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::tools::DeviceTools;
use crate::paths;

/// A block device the snapshot chain can stack on
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync {
    /// Device node; None until the device has been activated
    fn path(&self) -> Option<&Path>;

    async fn is_active(&self, tools: &dyn DeviceTools) -> bool;

    async fn activate(&mut self, tools: &dyn DeviceTools) -> Result<()>;

    /// Drop whatever `activate` attached that the kernel no longer needs
    /// once a dm device is stacked on top
    async fn release(&mut self, _tools: &dyn DeviceTools) -> Result<()> {
        Ok(())
    }

    /// Device node, failing when inactive
    fn require_path(&self) -> Result<&Path> {
        self.path().context("block device is not active")
    }
}

/// Loop device over a regular file
#[derive(Debug)]
pub struct LoopDevice {
    backing: PathBuf,
    read_only: bool,
    device: Option<PathBuf>,
}

impl LoopDevice {
    pub fn new(backing: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            backing: backing.into(),
            read_only,
            device: None,
        }
    }
}

#[async_trait::async_trait]
impl BlockDevice for LoopDevice {
    fn path(&self) -> Option<&Path> {
        self.device.as_deref()
    }

    async fn is_active(&self, tools: &dyn DeviceTools) -> bool {
        match &self.device {
            Some(device) => tools.device_exists(device).await,
            None => false,
        }
    }

    async fn activate(&mut self, tools: &dyn DeviceTools) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }
        let device = tools
            .attach_loop(&self.backing, self.read_only)
            .await
            .with_context(|| format!("attaching {} to a loop device", self.backing.display()))?;
        debug!(
            target: "storage",
            backing = %self.backing.display(),
            device = %device.display(),
            read_only = self.read_only,
            "attached loop device"
        );
        self.device = Some(device);
        Ok(())
    }

    /// Existing dm mappings keep the loop device referenced after detach
    async fn release(&mut self, tools: &dyn DeviceTools) -> Result<()> {
        if let Some(device) = self.device.take() {
            tools
                .detach_loop(&device)
                .await
                .with_context(|| format!("detaching {}", device.display()))?;
        }
        Ok(())
    }
}

/// Block device node that already exists on the host
#[derive(Debug)]
pub struct PhysicalDevice {
    path: PathBuf,
}

impl PhysicalDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl BlockDevice for PhysicalDevice {
    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    async fn is_active(&self, tools: &dyn DeviceTools) -> bool {
        tools.device_exists(&self.path).await
    }

    async fn activate(&mut self, tools: &dyn DeviceTools) -> Result<()> {
        if !self.is_active(tools).await {
            bail!("block device {} does not exist", self.path.display());
        }
        Ok(())
    }
}

/// Device-mapper device with a fixed table
#[derive(Debug)]
pub struct MapperDevice {
    name: String,
    table: String,
    path: PathBuf,
}

impl MapperDevice {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        let name = name.into();
        let path = paths::mapper_path(&name);
        Self {
            name,
            table: table.into(),
            path,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait::async_trait]
impl BlockDevice for MapperDevice {
    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    async fn is_active(&self, tools: &dyn DeviceTools) -> bool {
        tools.device_exists(&self.path).await
    }

    async fn activate(&mut self, tools: &dyn DeviceTools) -> Result<()> {
        tools
            .dm_create(&self.name, &self.table)
            .await
            .with_context(|| format!("creating device-mapper device {}", self.name))?;
        debug!(target: "storage", name = %self.name, table = %self.table, "created dm device");
        Ok(())
    }
}
