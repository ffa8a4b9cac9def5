//! Probes: adapters that read an external data source into mesh objects
//!
//! A probe is looked up through the [`ProbeDirectory`], a static table keyed
//! by exact source id or by URL scheme. The built-in [`JsonFileProbe`] serves
//! `file://` sources holding a JSON document of the form
//!
//! ```json
//! { "home": { "title": "Feed" }, "objects": { "a": { "n": 1 } } }
//! ```

use crate::identifier::MeshBaseId;
use crate::mesh::object::{Change, Properties, PropertyValue};
use crate::store::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("No probe for data source {0}")]
    UnknownSource(MeshBaseId),
    #[error("Probe {0} cannot write")]
    Unsupported(String),
    #[error("Adapter failure: {0}")]
    Adapter(String),
    #[error("Schedule storage error: {0}")]
    Store(String),
}

impl From<StoreError> for ProbeError {
    fn from(e: StoreError) -> Self {
        ProbeError::Store(e.to_string())
    }
}

/// What one probe run read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutput {
    /// Properties of the home object
    pub home: Properties,
    /// Other objects by local name
    pub objects: BTreeMap<String, Properties>,
}

impl ProbeOutput {
    /// blake3 digest (hex) of the content, stable across runs
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        match bincode::serialize(self) {
            Ok(bytes) => {
                hasher.update(&bytes);
            }
            Err(e) => {
                hasher.update(e.to_string().as_bytes());
            }
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Add an object with the given properties
    pub fn object<'a>(
        mut self,
        local: &str,
        properties: impl IntoIterator<Item = (&'a str, PropertyValue)>,
    ) -> Self {
        self.objects.insert(
            local.to_string(),
            properties
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        );
        self
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.home.is_empty() && self.objects.is_empty()
    }
}

/// Run information handed to a probe
#[derive(Debug, Clone)]
pub struct ProbeContext {
    /// Runs completed before this one
    pub run: u64,
    /// Digest of the last successful output, if any
    pub last_digest: Option<String>,
}

#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &str;

    /// Whether [`Probe::write`] is supported
    fn is_writable(&self) -> bool {
        false
    }

    async fn read(&self, source: &MeshBaseId, ctx: &ProbeContext) -> Result<ProbeOutput, ProbeError>;

    /// Write changes made by a lock holder back to the source
    async fn write(&self, source: &MeshBaseId, changes: &[Change]) -> Result<(), ProbeError> {
        let _ = (source, changes);
        Err(ProbeError::Unsupported(self.name().to_string()))
    }
}

/// Probe lookup by exact source id, then by URL scheme
#[derive(Clone, Default)]
pub struct ProbeDirectory {
    by_id: HashMap<MeshBaseId, Arc<dyn Probe>>,
    by_scheme: HashMap<String, Arc<dyn Probe>>,
}

impl ProbeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut directory = Self::new();
        directory.register_scheme("file", Arc::new(JsonFileProbe::new()));
        directory
    }

    pub fn register_id(&mut self, id: MeshBaseId, probe: Arc<dyn Probe>) {
        self.by_id.insert(id, probe);
    }

    pub fn register_scheme(&mut self, scheme: &str, probe: Arc<dyn Probe>) {
        self.by_scheme.insert(scheme.to_ascii_lowercase(), probe);
    }

    pub fn find(&self, source: &MeshBaseId) -> Option<Arc<dyn Probe>> {
        if let Some(probe) = self.by_id.get(source) {
            return Some(probe.clone());
        }
        let scheme = source.scheme()?.to_ascii_lowercase();
        self.by_scheme.get(&scheme).cloned()
    }

    pub fn resolve(&self, source: &MeshBaseId) -> Result<Arc<dyn Probe>, ProbeError> {
        self.find(source)
            .ok_or_else(|| ProbeError::UnknownSource(source.clone()))
    }
}

// ============================================================================
// JSON FILE PROBE
// ============================================================================

/// Reads and writes `file://` JSON documents
#[derive(Debug, Clone)]
pub struct JsonFileProbe {
    writable: bool,
}

impl JsonFileProbe {
    pub fn new() -> Self {
        Self { writable: true }
    }

    pub fn read_only() -> Self {
        Self { writable: false }
    }

    fn path(source: &MeshBaseId) -> Result<&str, ProbeError> {
        source
            .as_str()
            .strip_prefix("file://")
            .filter(|path| !path.is_empty())
            .ok_or_else(|| ProbeError::UnknownSource(source.clone()))
    }

    fn properties(value: &Value, what: &str) -> Result<Properties, ProbeError> {
        match value {
            Value::Object(map) => Ok(map
                .iter()
                .map(|(name, value)| (name.clone(), PropertyValue::from(value.clone())))
                .collect()),
            Value::Null => Ok(Properties::new()),
            _ => Err(ProbeError::Parse(format!("{} is not an object", what))),
        }
    }

    /// Parse a document into a probe output
    pub fn parse(text: &str) -> Result<ProbeOutput, ProbeError> {
        let document: Value = serde_json::from_str(text).map_err(|e| ProbeError::Parse(e.to_string()))?;
        let Value::Object(root) = document else {
            return Err(ProbeError::Parse("document is not an object".to_string()));
        };

        let mut output = ProbeOutput::default();
        if let Some(home) = root.get("home") {
            output.home = Self::properties(home, "home")?;
        }
        match root.get("objects") {
            Some(Value::Object(objects)) => {
                for (local, value) in objects {
                    if local.is_empty() {
                        return Err(ProbeError::Parse("object with an empty name".to_string()));
                    }
                    output
                        .objects
                        .insert(local.clone(), Self::properties(value, local)?);
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => return Err(ProbeError::Parse("objects is not an object".to_string())),
        }
        Ok(output)
    }

    /// Apply changes to a parsed document
    fn apply(root: &mut Map<String, Value>, changes: &[Change]) {
        for change in changes {
            let local = change.object().local.clone();
            let target = if local.is_empty() {
                root.entry("home").or_insert_with(|| Value::Object(Map::new()))
            } else {
                let objects = root
                    .entry("objects")
                    .or_insert_with(|| Value::Object(Map::new()));
                if !objects.is_object() {
                    *objects = Value::Object(Map::new());
                }
                match objects {
                    Value::Object(objects) => {
                        if matches!(change, Change::Deleted { .. }) {
                            objects.remove(&local);
                            continue;
                        }
                        objects.entry(local).or_insert_with(|| Value::Object(Map::new()))
                    }
                    _ => continue,
                }
            };
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let Value::Object(properties) = target else {
                continue;
            };
            match change {
                Change::Created(payload) => {
                    for (name, value) in &payload.properties {
                        properties.insert(name.clone(), json_value(value));
                    }
                }
                Change::PropertySet { name, value, .. } => match value {
                    Some(value) => {
                        properties.insert(name.clone(), json_value(value));
                    }
                    None => {
                        properties.remove(name);
                    }
                },
                // the home object is never deleted
                Change::Deleted { .. } => {}
            }
        }
    }
}

impl Default for JsonFileProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for JsonFileProbe {
    fn name(&self) -> &str {
        "json-file"
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    async fn read(&self, source: &MeshBaseId, ctx: &ProbeContext) -> Result<ProbeOutput, ProbeError> {
        let path = Self::path(source)?;
        debug!("Reading {} (run {})", path, ctx.run + 1);
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ProbeError::Io(format!("{}: {}", path, e)))?;
        Self::parse(&text)
    }

    async fn write(&self, source: &MeshBaseId, changes: &[Change]) -> Result<(), ProbeError> {
        if !self.writable {
            return Err(ProbeError::Unsupported(self.name().to_string()));
        }
        let path = Self::path(source)?;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ProbeError::Io(format!("{}: {}", path, e)))?;
        let mut root = match serde_json::from_str(&text).map_err(|e| ProbeError::Parse(e.to_string()))? {
            Value::Object(root) => root,
            _ => return Err(ProbeError::Parse("document is not an object".to_string())),
        };
        Self::apply(&mut root, changes);
        let text = serde_json::to_string_pretty(&Value::Object(root))
            .map_err(|e| ProbeError::Parse(e.to_string()))?;
        tokio::fs::write(path, text)
            .await
            .map_err(|e| ProbeError::Io(format!("{}: {}", path, e)))?;
        debug!("Wrote {} changes to {}", changes.len(), path);
        Ok(())
    }
}

// ============================================================================
// MEMORY PROBE
// ============================================================================

/// Serves content held in memory, set by the application
pub struct MemoryProbe {
    content: Mutex<Result<ProbeOutput, ProbeError>>,
    latency: Mutex<Duration>,
    reads: AtomicU64,
}

impl MemoryProbe {
    pub fn new(output: ProbeOutput) -> Self {
        Self {
            content: Mutex::new(Ok(output)),
            latency: Mutex::new(Duration::ZERO),
            reads: AtomicU64::new(0),
        }
    }

    /// A probe whose every read fails with `error`
    pub fn failing(error: ProbeError) -> Self {
        let probe = Self::new(ProbeOutput::default());
        probe.set_error(error);
        probe
    }

    pub fn set_output(&self, output: ProbeOutput) {
        *self.content.lock() = Ok(output);
    }

    pub fn set_error(&self, error: ProbeError) {
        *self.content.lock() = Err(error);
    }

    /// Time each read takes
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Probe for MemoryProbe {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, _source: &MeshBaseId, _ctx: &ProbeContext) -> Result<ProbeOutput, ProbeError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.content.lock().clone()
    }
}

/// JSON form of a property value; blobs become hex strings
pub fn json_value(value: &PropertyValue) -> Value {
    match value {
        PropertyValue::Null => Value::Null,
        PropertyValue::Bool(b) => Value::Bool(*b),
        PropertyValue::Integer(i) => Value::from(*i),
        PropertyValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        PropertyValue::Text(s) => Value::String(s.clone()),
        PropertyValue::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::MeshObjectId;

    fn source(path: &std::path::Path) -> MeshBaseId {
        MeshBaseId::new(format!("file://{}", path.display())).unwrap()
    }

    fn ctx() -> ProbeContext {
        ProbeContext {
            run: 0,
            last_digest: None,
        }
    }

    #[test]
    fn test_parse_document() {
        let output = JsonFileProbe::parse(
            r#"{"home": {"title": "Feed"}, "objects": {"a": {"n": 1, "ok": true}, "b": null}}"#,
        )
        .unwrap();
        assert_eq!(output.home.get("title"), Some(&PropertyValue::from("Feed")));
        assert_eq!(output.len(), 2);
        assert_eq!(output.objects["a"].get("n"), Some(&PropertyValue::Integer(1)));
        assert!(output.objects["b"].is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(matches!(JsonFileProbe::parse("[1, 2]"), Err(ProbeError::Parse(_))));
        assert!(matches!(
            JsonFileProbe::parse(r#"{"objects": {"a": 3}}"#),
            Err(ProbeError::Parse(_))
        ));
        assert!(matches!(JsonFileProbe::parse("{not json"), Err(ProbeError::Parse(_))));
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = JsonFileProbe::parse(r#"{"objects": {"a": {"n": 1}}}"#).unwrap();
        let b = JsonFileProbe::parse(r#"{"objects": {"a": {"n": 1}}}"#).unwrap();
        let c = JsonFileProbe::parse(r#"{"objects": {"a": {"n": 2}}}"#).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_directory_lookup() {
        let directory = ProbeDirectory::builtin();
        let file = MeshBaseId::new("file:///tmp/x.json").unwrap();
        let web = MeshBaseId::new("https://example.com/feed").unwrap();
        assert_eq!(directory.resolve(&file).unwrap().name(), "json-file");
        assert_eq!(
            directory.resolve(&web).err(),
            Some(ProbeError::UnknownSource(web.clone()))
        );

        let mut directory = directory;
        directory.register_id(web.clone(), Arc::new(JsonFileProbe::read_only()));
        assert!(!directory.resolve(&web).unwrap().is_writable());
    }

    #[tokio::test]
    async fn test_memory_probe_serves_current_content() {
        let source = MeshBaseId::new("memory:feed").unwrap();
        let probe = MemoryProbe::new(ProbeOutput::default().object("a", [("n", PropertyValue::Integer(1))]));
        let output = probe.read(&source, &ctx()).await.unwrap();
        assert_eq!(output.objects["a"].get("n"), Some(&PropertyValue::Integer(1)));

        probe.set_error(ProbeError::Adapter("down".to_string()));
        assert_eq!(
            probe.read(&source, &ctx()).await,
            Err(ProbeError::Adapter("down".to_string()))
        );
        assert_eq!(probe.reads(), 2);
        assert!(!probe.is_writable());
    }

    #[tokio::test]
    async fn test_read_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = JsonFileProbe::new()
            .read(&source(&dir.path().join("absent.json")), &ctx())
            .await;
        assert!(matches!(result, Err(ProbeError::Io(_))));
    }

    #[tokio::test]
    async fn test_write_back_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(&path, r#"{"home": {}, "objects": {"a": {"n": 1}, "b": {"n": 2}}}"#).unwrap();
        let source = source(&path);
        let probe = JsonFileProbe::new();

        let changes = vec![
            Change::PropertySet {
                object: MeshObjectId::new(source.clone(), "a"),
                name: "n".to_string(),
                value: Some(PropertyValue::Integer(5)),
                time_updated: 1,
            },
            Change::Deleted {
                object: MeshObjectId::new(source.clone(), "b"),
            },
            Change::PropertySet {
                object: MeshObjectId::home(&source),
                name: "title".to_string(),
                value: Some(PropertyValue::from("x")),
                time_updated: 1,
            },
        ];
        probe.write(&source, &changes).await.unwrap();

        let output = probe.read(&source, &ctx()).await.unwrap();
        assert_eq!(output.objects["a"].get("n"), Some(&PropertyValue::Integer(5)));
        assert!(!output.objects.contains_key("b"));
        assert_eq!(output.home.get("title"), Some(&PropertyValue::from("x")));

        let result = JsonFileProbe::read_only().write(&source, &changes).await;
        assert_eq!(result, Err(ProbeError::Unsupported("json-file".to_string())));
    }
}
