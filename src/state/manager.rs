use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tokio::fs;

use super::types::VmRecord;
use super::utils::validate_uid;

/// Load/save seam onto the metadata store.
///
/// The coordinator loads once at startup and saves exactly twice.
#[async_trait::async_trait]
pub trait VmStore: Send + Sync {
    async fn load(&self, vm_id: &str) -> Result<VmRecord>;
    async fn save(&self, record: &VmRecord) -> Result<()>;
}

/// JSON-file metadata store, one `<uid>.json` per VM
pub struct StateManager {
    state_dir: PathBuf,
}

impl StateManager {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    /// Initialize state directory
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir)
            .await
            .context("creating state directory")?;
        Ok(())
    }

    /// Path of the record for `uid`; anything that is not a plain uid is
    /// refused so the path stays inside the state dir
    fn record_path(&self, uid: &str) -> Result<PathBuf> {
        validate_uid(uid)?;
        Ok(self.state_dir.join(format!("{}.json", uid)))
    }

    /// Save a record atomically (temp file + rename), owner-only permissions
    pub async fn save_record(&self, record: &VmRecord) -> Result<()> {
        let path = self.record_path(record.uid())?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;

        fs::write(&tmp, json).await.context("writing VM record")?;
        fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .await
            .context("restricting VM record permissions")?;
        fs::rename(&tmp, &path)
            .await
            .context("renaming VM record into place")?;
        Ok(())
    }

    /// Load a record by uid
    pub async fn load_record(&self, uid: &str) -> Result<VmRecord> {
        let json = fs::read_to_string(self.record_path(uid)?)
            .await
            .with_context(|| format!("reading VM record {}", uid))?;
        let record: VmRecord = serde_json::from_str(&json).context("parsing VM record")?;
        Ok(record)
    }

    /// Load a record by name
    pub async fn load_record_by_name(&self, name: &str) -> Result<VmRecord> {
        let vms = self.list_records().await?;
        vms.into_iter()
            .find(|vm| vm.name() == name)
            .ok_or_else(|| anyhow::anyhow!("VM not found: {}", name))
    }

    /// List all records, skipping unreadable files
    pub async fn list_records(&self) -> Result<Vec<VmRecord>> {
        let mut vms = Vec::new();

        if !self.state_dir.exists() {
            return Ok(vms);
        }

        let mut entries = fs::read_dir(&self.state_dir)
            .await
            .context("reading state directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Ok(json) = fs::read_to_string(&path).await {
                    if let Ok(record) = serde_json::from_str::<VmRecord>(&json) {
                        vms.push(record);
                    }
                }
            }
        }

        Ok(vms)
    }
}

#[async_trait::async_trait]
impl VmStore for StateManager {
    /// Uid first, then name
    async fn load(&self, vm_id: &str) -> Result<VmRecord> {
        if matches!(self.record_path(vm_id), Ok(path) if path.exists()) {
            return self.load_record(vm_id).await;
        }
        self.load_record_by_name(vm_id)
            .await
            .with_context(|| format!("looking up VM {}", vm_id))
    }

    async fn save(&self, record: &VmRecord) -> Result<()> {
        self.save_record(record).await
    }
}
