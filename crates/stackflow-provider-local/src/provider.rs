//! Local provider implementation

use crate::error::{LocalError, Result};
use crate::registry::{ObjectRecord, ObjectRegistry};
use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use stackflow_engine::{
    AttributeDelta, AttributeSchema, Attributes, CreatedResource, Provider, ProviderError,
    ProviderResult, ResourceSchema, RetryConfig, retry_transient,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const LOCAL_FILE: &str = "local_file";
pub const LOCAL_DIRECTORY: &str = "local_directory";
pub const RANDOM_ID: &str = "random_id";

const DEFAULT_BYTE_LENGTH: u64 = 8;
const MAX_BYTE_LENGTH: u64 = 64;

/// Manages files, directories and random ids below a base directory.
///
/// Relative paths resolve against the base directory. Object records live in
/// the registry directory, `<base>/.stackflow/objects` unless overridden.
pub struct LocalProvider {
    base_dir: PathBuf,
    registry: ObjectRegistry,
    retry: RetryConfig,
}

impl LocalProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let registry = ObjectRegistry::new(base_dir.join(".stackflow").join("objects"));
        Self {
            base_dir,
            registry,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(1),
                backoff_multiplier: 2.0,
            },
        }
    }

    pub fn with_registry_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.registry = ObjectRegistry::new(dir);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    async fn create_object(&self, resource_type: &str, attributes: &Attributes) -> Result<CreatedResource> {
        let (id, attributes) = match resource_type {
            LOCAL_FILE => {
                let path = required_str(resource_type, attributes, "path")?;
                let content = optional_str(attributes, "content")?.unwrap_or_default();
                self.write_file(&path, &content).await?;
                let mut attributes = attributes.clone();
                file_attributes(&mut attributes, &content);
                (path_id(&self.resolve(&path)), attributes)
            }
            LOCAL_DIRECTORY => {
                let path = required_str(resource_type, attributes, "path")?;
                fs::create_dir_all(self.resolve(&path)).await?;
                (path_id(&self.resolve(&path)), attributes.clone())
            }
            RANDOM_ID => {
                let length = byte_length(attributes)?;
                let bytes = random_bytes(length);
                let hex_value = hex::encode(&bytes);
                let mut attributes = attributes.clone();
                attributes.insert("hex".to_string(), json!(hex_value));
                attributes.insert("dec".to_string(), json!(leading_u64(&bytes)));
                (hex_value, attributes)
            }
            other => return Err(LocalError::UnsupportedType(other.to_string())),
        };

        let mut attributes = attributes;
        attributes.insert("id".to_string(), json!(id));
        self.registry
            .save(&ObjectRecord::new(resource_type, &id, attributes.clone()))
            .await?;
        Ok(CreatedResource {
            id,
            attributes,
            private: None,
        })
    }

    async fn read_object(&self, resource_type: &str, id: &str) -> Result<Option<Attributes>> {
        let Some(record) = self.registry.load(resource_type, id).await? else {
            return Ok(None);
        };
        let mut attributes = record.attributes;

        match resource_type {
            LOCAL_FILE => {
                let path = required_str(resource_type, &attributes, "path")?;
                match fs::read_to_string(self.resolve(&path)).await {
                    Ok(content) => {
                        // Undeclared content is tracked through sha256 only
                        if attributes.contains_key("content") {
                            attributes.insert("content".to_string(), json!(content));
                        }
                        file_attributes(&mut attributes, &content);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
            }
            LOCAL_DIRECTORY => {
                let path = required_str(resource_type, &attributes, "path")?;
                if !fs::metadata(self.resolve(&path)).await.is_ok_and(|m| m.is_dir()) {
                    return Ok(None);
                }
            }
            RANDOM_ID => {}
            other => return Err(LocalError::UnsupportedType(other.to_string())),
        }
        Ok(Some(attributes))
    }

    async fn update_object(&self, resource_type: &str, id: &str, delta: &AttributeDelta) -> Result<Attributes> {
        let Some(mut record) = self.registry.load(resource_type, id).await? else {
            return Err(LocalError::NotFound(format!("{}/{}", resource_type, id)));
        };

        // Computed attributes carry over from the prior record
        let mut attributes = record.attributes.clone();
        for (key, value) in &delta.desired {
            attributes.insert(key.clone(), value.clone());
        }

        match resource_type {
            LOCAL_FILE => {
                let path = required_str(resource_type, &attributes, "path")?;
                let content = optional_str(&attributes, "content")?.unwrap_or_default();
                self.write_file(&path, &content).await?;
                file_attributes(&mut attributes, &content);
            }
            LOCAL_DIRECTORY | RANDOM_ID => {}
            other => return Err(LocalError::UnsupportedType(other.to_string())),
        }

        attributes.insert("id".to_string(), json!(id));
        record.attributes = attributes.clone();
        record.updated_at = Utc::now();
        self.registry.save(&record).await?;
        Ok(attributes)
    }

    async fn delete_object(&self, resource_type: &str, id: &str) -> Result<()> {
        let Some(record) = self.registry.load(resource_type, id).await? else {
            return Err(LocalError::NotFound(format!("{}/{}", resource_type, id)));
        };

        match resource_type {
            LOCAL_FILE => {
                let path = required_str(resource_type, &record.attributes, "path")?;
                match fs::remove_file(self.resolve(&path)).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            LOCAL_DIRECTORY => {
                let path = required_str(resource_type, &record.attributes, "path")?;
                let dir = self.resolve(&path);
                match fs::remove_dir(&dir).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(_) if fs::read_dir(&dir).await.is_ok() => {
                        return Err(LocalError::DirectoryNotEmpty(path));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            RANDOM_ID => {}
            other => return Err(LocalError::UnsupportedType(other.to_string())),
        }

        self.registry.remove(resource_type, id).await?;
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, content).await?;
        tracing::debug!(path = %target.display(), bytes = content.len(), "Wrote file");
        Ok(())
    }

    async fn read_file_data(&self, query: &Attributes) -> Result<Attributes> {
        let path = required_str(LOCAL_FILE, query, "path")?;
        let content = match fs::read_to_string(self.resolve(&path)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LocalError::NotFound(path));
            }
            Err(e) => return Err(e.into()),
        };
        let mut attributes = query.clone();
        attributes.insert("content".to_string(), json!(content));
        file_attributes(&mut attributes, &content);
        Ok(attributes)
    }
}

fn required_str(resource_type: &str, attributes: &Attributes, name: &str) -> Result<String> {
    match attributes.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | None | Some(Value::Null) => Err(LocalError::MissingAttribute {
            resource_type: resource_type.to_string(),
            attribute: name.to_string(),
        }),
        Some(other) => Err(LocalError::InvalidAttribute {
            attribute: name.to_string(),
            message: format!("expected a string, got {}", other),
        }),
    }
}

fn optional_str(attributes: &Attributes, name: &str) -> Result<Option<String>> {
    match attributes.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        // Scalars are written as their JSON text
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(LocalError::InvalidAttribute {
            attribute: name.to_string(),
            message: format!("expected a string, got {}", other),
        }),
    }
}

fn byte_length(attributes: &Attributes) -> Result<usize> {
    let length = match attributes.get("byte_length") {
        None | Some(Value::Null) => DEFAULT_BYTE_LENGTH,
        Some(value) => value.as_u64().ok_or_else(|| LocalError::InvalidAttribute {
            attribute: "byte_length".to_string(),
            message: format!("expected a positive integer, got {}", value),
        })?,
    };
    if length == 0 || length > MAX_BYTE_LENGTH {
        return Err(LocalError::InvalidAttribute {
            attribute: "byte_length".to_string(),
            message: format!("must be between 1 and {}", MAX_BYTE_LENGTH),
        });
    }
    Ok(length as usize)
}

fn random_bytes(length: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn leading_u64(bytes: &[u8]) -> u64 {
    bytes.iter().take(8).fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn sha256_hex(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn path_id(path: &Path) -> String {
    sha256_hex(&path.to_string_lossy())[..16].to_string()
}

fn file_attributes(attributes: &mut Attributes, content: &str) {
    attributes.insert("sha256".to_string(), json!(sha256_hex(content)));
    attributes.insert("size".to_string(), json!(content.len()));
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn schema(&self, resource_type: &str) -> Option<ResourceSchema> {
        match resource_type {
            LOCAL_FILE => Some(
                ResourceSchema::new(1)
                    .attribute("path", AttributeSchema::forces_replacement())
                    .attribute("content", AttributeSchema::in_place())
                    .attribute("id", AttributeSchema::computed())
                    .attribute("sha256", AttributeSchema::computed())
                    .attribute("size", AttributeSchema::computed()),
            ),
            LOCAL_DIRECTORY => Some(
                ResourceSchema::new(1)
                    .attribute("path", AttributeSchema::forces_replacement())
                    .attribute("id", AttributeSchema::computed()),
            ),
            RANDOM_ID => Some(
                ResourceSchema::new(1)
                    .attribute("byte_length", AttributeSchema::forces_replacement())
                    .attribute("keepers", AttributeSchema::forces_replacement())
                    .attribute("id", AttributeSchema::computed())
                    .attribute("hex", AttributeSchema::computed())
                    .attribute("dec", AttributeSchema::computed()),
            ),
            _ => None,
        }
    }

    #[tracing::instrument(skip(self, attributes))]
    async fn create(&self, resource_type: &str, attributes: &Attributes) -> ProviderResult<CreatedResource> {
        let created = retry_transient(&self.retry, "create", || async {
            self.create_object(resource_type, attributes)
                .await
                .map_err(ProviderError::from)
        })
        .await?;
        tracing::info!(resource_type, id = %created.id, "Created object");
        Ok(created)
    }

    #[tracing::instrument(skip(self))]
    async fn read(&self, resource_type: &str, id: &str) -> ProviderResult<Option<Attributes>> {
        retry_transient(&self.retry, "read", || async {
            self.read_object(resource_type, id)
                .await
                .map_err(ProviderError::from)
        })
        .await
    }

    #[tracing::instrument(skip(self, delta), fields(changed = ?delta.changed))]
    async fn update(&self, resource_type: &str, id: &str, delta: &AttributeDelta) -> ProviderResult<Attributes> {
        let attributes = retry_transient(&self.retry, "update", || async {
            self.update_object(resource_type, id, delta)
                .await
                .map_err(ProviderError::from)
        })
        .await?;
        tracing::info!(resource_type, id, "Updated object");
        Ok(attributes)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, resource_type: &str, id: &str) -> ProviderResult<()> {
        retry_transient(&self.retry, "delete", || async {
            self.delete_object(resource_type, id)
                .await
                .map_err(ProviderError::from)
        })
        .await?;
        tracing::info!(resource_type, id, "Deleted object");
        Ok(())
    }

    async fn read_data(&self, data_type: &str, query: &Attributes) -> ProviderResult<Attributes> {
        match data_type {
            LOCAL_FILE => Ok(self.read_file_data(query).await?),
            other => Err(ProviderError::permanent(format!(
                "provider 'local' has no data source '{}'",
                other
            ))),
        }
    }
}
