use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// On-disk layout of the catalog file (`ln_info.json`).
///
/// Unknown keys are kept in `extra` at every level so files written by other
/// versions survive a round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub ln_list: Vec<CatalogEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub ln_name: String,
    #[serde(default)]
    pub ln_url: String,
    #[serde(default)]
    pub num_vol: usize,
    #[serde(default)]
    pub vol_list: Vec<CatalogVolume>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogVolume {
    #[serde(default)]
    pub vol_name: String,
    #[serde(default)]
    pub num_chapter: usize,
    #[serde(default)]
    pub chapter_list: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CatalogEntry {
    pub fn volume_names(&self) -> Vec<&str> {
        self.vol_list.iter().map(|v| v.vol_name.as_str()).collect()
    }

    pub fn volume(&self, name: &str) -> Option<&CatalogVolume> {
        self.vol_list.iter().find(|v| v.vol_name == name)
    }
}
