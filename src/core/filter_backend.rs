//! Access to the hypervisor's network filters
//!
//! [`VirshFilters`] drives `virsh nwfilter-*`. [`MemoryFilters`] keeps the
//! definitions in memory and enforces the same contract libvirt does: a name
//! keeps its uuid, references must already exist, and a referenced filter
//! cannot be undefined.

use crate::core::error::{Error, Result};
use crate::core::nwfilter::{BASE_FILTERS, FilterDocument};
use crate::core::table_backend::decode_stdout;
use crate::elevation::{ElevatedProgram, create_elevated_command};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Define, lookup and undefine of named filter documents
pub trait FilterBackend: Send + Sync {
    /// Creates or replaces `doc`; the uuid must match an existing definition
    fn define(&self, doc: &FilterDocument) -> impl Future<Output = Result<()>> + Send;

    /// Current definition, `None` when the name is unknown
    fn lookup(&self, name: &str) -> impl Future<Output = Result<Option<FilterDocument>>> + Send;

    fn undefine(&self, name: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Runs `virsh` through [`crate::elevation`]
#[derive(Debug, Clone, Default)]
pub struct VirshFilters {
    connect: Option<String>,
}

impl VirshFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Talks to a specific libvirt URI (`virsh -c <uri>`)
    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            connect: Some(uri.into()),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 2);
        if let Some(uri) = &self.connect {
            full.extend(["-c", uri.as_str()]);
        }
        full.extend_from_slice(args);

        create_elevated_command(ElevatedProgram::Virsh, &full)?
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                error!("Failed to spawn virsh: {e}");
                Error::Internal(format!("Failed to spawn virsh: {e}"))
            })
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("network filter not found") || lower.contains("no nwfilter with matching")
}

/// Extracts the uuid from "... already exists with uuid <uuid>"
fn conflicting_uuid(stderr: &str) -> Option<Uuid> {
    let (_, rest) = stderr.split_once("already exists with uuid")?;
    let token = rest.split_whitespace().next()?;
    Uuid::parse_str(token.trim_matches(|c: char| !c.is_ascii_hexdigit() && c != '-')).ok()
}

fn virsh_error(output: &std::process::Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Error::Tool {
        tool: ElevatedProgram::Virsh.to_string(),
        message: if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr.clone()
        },
        stderr: Some(stderr),
        exit_code: output.status.code(),
    }
}

impl FilterBackend for VirshFilters {
    async fn define(&self, doc: &FilterDocument) -> Result<()> {
        use std::io::Write;

        let mut temp = tempfile::NamedTempFile::new()?;
        temp.write_all(doc.to_xml().as_bytes())?;
        temp.flush()?;
        let path = temp
            .path()
            .to_str()
            .ok_or_else(|| Error::Internal("Invalid temp path".to_string()))?
            .to_string();

        let output = self.run(&["nwfilter-define", &path]).await?;
        if output.status.success() {
            debug!(filter = %doc.name, "virsh nwfilter-define successful");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already exists with uuid") {
            return Err(Error::FilterConflict {
                name: doc.name.clone(),
                existing: conflicting_uuid(&stderr).unwrap_or_else(Uuid::nil),
                requested: doc.uuid.unwrap_or_else(Uuid::nil),
            });
        }
        if stderr.contains("referenced filter") || stderr.contains("filter not found") {
            error!(filter = %doc.name, "virsh rejected a dangling reference: {}", stderr.trim());
        }
        Err(virsh_error(&output))
    }

    async fn lookup(&self, name: &str) -> Result<Option<FilterDocument>> {
        let output = self.run(&["nwfilter-dumpxml", name]).await?;
        if output.status.success() {
            let xml = decode_stdout(ElevatedProgram::Virsh, output.stdout)?;
            return FilterDocument::from_xml(&xml).map(Some);
        }
        if is_not_found(&String::from_utf8_lossy(&output.stderr)) {
            return Ok(None);
        }
        Err(virsh_error(&output))
    }

    async fn undefine(&self, name: &str) -> Result<()> {
        let output = self.run(&["nwfilter-undefine", name]).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("in use") {
            return Err(Error::FilterInUse(name.to_string()));
        }
        if is_not_found(&stderr) {
            return Err(Error::FilterNotFound(name.to_string()));
        }
        Err(virsh_error(&output))
    }
}

/// In-memory hypervisor filter store
#[derive(Debug, Default)]
pub struct MemoryFilters {
    filters: Mutex<BTreeMap<String, FilterDocument>>,
    busy: Mutex<HashMap<String, u32>>,
    defined: Mutex<Vec<String>>,
}

impl MemoryFilters {
    /// Empty store, as if libvirt shipped no filters
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding the filters libvirt ships
    pub fn with_base_filters() -> Self {
        let store = Self::default();
        if let Ok(mut filters) = store.filters.lock() {
            for name in BASE_FILTERS {
                let mut doc = FilterDocument::new(name);
                doc.uuid = Some(Uuid::new_v4());
                filters.insert(name.to_string(), doc);
            }
        }
        store
    }

    pub fn get(&self, name: &str) -> Option<FilterDocument> {
        self.filters.lock().ok()?.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.filters.lock().map(|f| f.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.filters
            .lock()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every successful define, in call order
    pub fn define_log(&self) -> Vec<String> {
        self.defined.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Next `times` undefines of `name` fail with [`Error::FilterInUse`]
    pub fn mark_busy(&self, name: &str, times: u32) {
        if let Ok(mut busy) = self.busy.lock() {
            busy.insert(name.to_string(), times);
        }
    }

    fn lock_err() -> Error {
        Error::Internal("memory filter lock poisoned".to_string())
    }
}

impl FilterBackend for MemoryFilters {
    async fn define(&self, doc: &FilterDocument) -> Result<()> {
        let mut filters = self.filters.lock().map_err(|_| Self::lock_err())?;

        let mut doc = doc.clone();
        match (filters.get(&doc.name).and_then(|e| e.uuid), doc.uuid) {
            (Some(existing), Some(requested)) if existing != requested => {
                return Err(Error::FilterConflict {
                    name: doc.name,
                    existing,
                    requested,
                });
            }
            (Some(existing), None) => doc.uuid = Some(existing),
            (None, None) => doc.uuid = Some(Uuid::new_v4()),
            _ => {}
        }

        if let Some(missing) = doc.referenced().find(|r| !filters.contains_key(*r)) {
            return Err(Error::UndefinedDependency {
                filter: doc.name.clone(),
                reference: missing.to_string(),
            });
        }

        self.defined
            .lock()
            .map_err(|_| Self::lock_err())?
            .push(doc.name.clone());
        filters.insert(doc.name.clone(), doc);
        Ok(())
    }

    async fn lookup(&self, name: &str) -> Result<Option<FilterDocument>> {
        Ok(self
            .filters
            .lock()
            .map_err(|_| Self::lock_err())?
            .get(name)
            .cloned())
    }

    async fn undefine(&self, name: &str) -> Result<()> {
        let mut filters = self.filters.lock().map_err(|_| Self::lock_err())?;
        if !filters.contains_key(name) {
            return Err(Error::FilterNotFound(name.to_string()));
        }

        {
            let mut busy = self.busy.lock().map_err(|_| Self::lock_err())?;
            if let Some(remaining) = busy.get_mut(name)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(Error::FilterInUse(name.to_string()));
            }
        }

        if filters
            .values()
            .any(|doc| doc.name != name && doc.referenced().any(|r| r == name))
        {
            return Err(Error::FilterInUse(name.to_string()));
        }

        filters.remove(name);
        Ok(())
    }
}
