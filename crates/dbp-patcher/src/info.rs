use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatcherInfo {
    pub version: String,
    pub devices: Vec<Device>,
    pub partconfigs: Vec<PartitionConfig>,
    pub autopatchers: Vec<String>,
    pub patchinfos: Vec<PatchInfo>,
    pub inits: Vec<String>,
    pub ramdisks: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub codename: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// A preset. `path` is what gets passed to `--preset`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchInfo {
    pub path: String,
    pub name: String,
}

impl PatcherInfo {
    pub fn from_json(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload.trim())
    }

    pub fn device(&self, codename: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.codename == codename)
    }

    pub fn partconfig(&self, id: &str) -> Option<&PartitionConfig> {
        self.partconfigs.iter().find(|p| p.id == id)
    }

    pub fn patchinfo(&self, path: &str) -> Option<&PatchInfo> {
        self.patchinfos.iter().find(|p| p.path == path)
    }
}
