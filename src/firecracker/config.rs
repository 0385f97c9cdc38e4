//! Boot configuration handed to Firecracker over its API socket.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::api::{self, FirecrackerClient};
use crate::network::GuestNic;

/// Boot arguments used when the VM spec leaves the command line empty
pub const DEFAULT_CMD_LINE: &str = "console=ttyS0 reboot=k panic=1 pci=off ip=dhcp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub kernel_image: PathBuf,
    pub cmd_line: String,
    pub root_device: PathBuf,
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    /// Guest NICs in `eth0, eth1, ...` order
    pub nics: Vec<GuestNic>,
}

impl BootConfig {
    pub fn new(
        kernel_image: &Path,
        cmd_line: &str,
        root_device: &Path,
        vcpu_count: u8,
        mem_size_mib: u32,
        nics: Vec<GuestNic>,
    ) -> Self {
        let cmd_line = if cmd_line.trim().is_empty() {
            DEFAULT_CMD_LINE.to_string()
        } else {
            cmd_line.trim().to_string()
        };
        Self {
            kernel_image: kernel_image.to_path_buf(),
            cmd_line,
            root_device: root_device.to_path_buf(),
            vcpu_count,
            mem_size_mib,
            nics,
        }
    }

    pub fn boot_source(&self) -> api::BootSource {
        api::BootSource {
            kernel_image_path: self.kernel_image.display().to_string(),
            boot_args: Some(self.cmd_line.clone()),
        }
    }

    pub fn machine_config(&self) -> api::MachineConfig {
        api::MachineConfig {
            vcpu_count: self.vcpu_count,
            mem_size_mib: self.mem_size_mib,
        }
    }

    pub fn root_drive(&self) -> api::Drive {
        api::Drive {
            drive_id: "rootfs".to_string(),
            path_on_host: self.root_device.display().to_string(),
            is_root_device: true,
            is_read_only: false,
        }
    }

    pub fn network_interfaces(&self) -> Vec<api::NetworkInterface> {
        self.nics
            .iter()
            .enumerate()
            .map(|(i, nic)| api::NetworkInterface {
                iface_id: format!("eth{}", i),
                host_dev_name: nic.tap.clone(),
                guest_mac: nic.mac.to_string(),
            })
            .collect()
    }

    /// Push the whole configuration to a freshly started hypervisor
    pub async fn apply(&self, client: &FirecrackerClient) -> Result<()> {
        client
            .set_boot_source(&self.boot_source())
            .await
            .context("configuring boot source")?;
        client
            .set_machine_config(&self.machine_config())
            .await
            .context("configuring machine")?;
        client
            .add_drive(&self.root_drive())
            .await
            .context("attaching root drive")?;
        for iface in self.network_interfaces() {
            client
                .add_network_interface(&iface)
                .await
                .with_context(|| format!("attaching {} to {}", iface.host_dev_name, iface.iface_id))?;
        }
        Ok(())
    }
}
