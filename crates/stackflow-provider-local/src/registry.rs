//! On-disk object registry
//!
//! Every object the provider manages has a record at
//! `<dir>/<type>/<id>.json` holding its last written attributes.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stackflow_engine::Attributes;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    pub id: String,
    pub resource_type: String,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    pub fn new(resource_type: &str, id: &str, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            attributes,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectRegistry {
    dir: PathBuf,
}

impl ObjectRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, resource_type: &str, id: &str) -> PathBuf {
        self.dir.join(resource_type).join(format!("{}.json", id))
    }

    pub async fn load(&self, resource_type: &str, id: &str) -> Result<Option<ObjectRecord>> {
        let path = self.record_path(resource_type, id);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temporary file so a crash never leaves half a record.
    pub async fn save(&self, record: &ObjectRecord) -> Result<()> {
        let path = self.record_path(&record.resource_type, &record.id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        fs::rename(&tmp, &path).await?;
        tracing::debug!(resource_type = %record.resource_type, id = %record.id, "Saved object record");
        Ok(())
    }

    /// Returns whether a record existed.
    pub async fn remove(&self, resource_type: &str, id: &str) -> Result<bool> {
        match fs::remove_file(self.record_path(resource_type, id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of every record of a type, sorted
    pub async fn list(&self, resource_type: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(self.dir.join(resource_type)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
