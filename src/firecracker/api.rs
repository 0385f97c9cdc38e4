use anyhow::{bail, Context, Result};
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, Uri as UnixUri};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Local calls over the control socket answer in milliseconds; anything
/// this slow means the hypervisor is wedged
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the Firecracker API socket
#[derive(Debug, Clone)]
pub struct FirecrackerClient {
    socket_path: PathBuf,
    client: Client<hyperlocal::UnixConnector>,
}

impl FirecrackerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
        }
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let json = serde_json::to_string(body)?;
        let req = Request::builder()
            .method(Method::PUT)
            .uri(hyper::Uri::from(UnixUri::new(&self.socket_path, path)))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(json))?;

        let resp = tokio::time::timeout(REQUEST_TIMEOUT, self.client.request(req))
            .await
            .with_context(|| format!("PUT {} timed out after {:?}", path, REQUEST_TIMEOUT))?
            .with_context(|| format!("PUT {}", path))?;

        let status = resp.status();
        if status != StatusCode::NO_CONTENT && status != StatusCode::OK {
            let body = hyper::body::to_bytes(resp.into_body()).await?;
            bail!(
                "PUT {} returned {}: {}",
                path,
                status,
                String::from_utf8_lossy(&body)
            );
        }
        Ok(())
    }

    pub async fn set_boot_source(&self, config: &BootSource) -> Result<()> {
        self.put("/boot-source", config).await
    }

    pub async fn set_machine_config(&self, config: &MachineConfig) -> Result<()> {
        self.put("/machine-config", config).await
    }

    pub async fn add_drive(&self, drive: &Drive) -> Result<()> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    pub async fn add_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        self.put(&format!("/network-interfaces/{}", iface.iface_id), iface)
            .await
    }

    pub async fn put_action(&self, action: InstanceAction) -> Result<()> {
        self.put("/actions", &action).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action_type")]
pub enum InstanceAction {
    InstanceStart,
    /// Power-button press; the guest decides how to shut down
    SendCtrlAltDel,
}
