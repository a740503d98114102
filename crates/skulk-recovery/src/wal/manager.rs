//! Registry of log nodes keyed by logical name.

use crate::error::Result;
use crate::wal::buffer::BufferSet;
use crate::wal::node::{LogNode, LogNodeConfig};
use crate::wal::{LogNodeRegistry, LogReplaySource};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Owns every log node below a root directory.
///
/// At most one node exists per logical name; concurrent callers asking for
/// the same name share it.
#[derive(Debug)]
pub struct LogNodeManager {
    root: PathBuf,
    config: LogNodeConfig,
    nodes: RwLock<HashMap<String, Arc<LogNode>>>,
}

impl LogNodeManager {
    /// Creates a manager storing node directories below `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be created.
    pub fn new(root: impl AsRef<Path>, config: LogNodeConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            config,
            nodes: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the node called `name`.
    ///
    /// Every node lives directly below the root, and distinct names never
    /// share a directory.
    pub fn node_dir(&self, name: &str) -> PathBuf {
        self.root.join(encode_node_name(name))
    }

    /// Returns the live node called `name`, if one is registered.
    pub fn node(&self, name: &str) -> Option<Arc<LogNode>> {
        let nodes = self.nodes.read().unwrap_or_else(|err| err.into_inner());
        nodes
            .get(name)
            .filter(|node| !node.is_deleted())
            .cloned()
    }

    /// Returns the node called `name`, opening it if absent.
    ///
    /// `supplier` provides the staging buffers of a newly opened node and is
    /// not called when the node already exists. A node whose storage was
    /// deleted is replaced by a fresh one.
    pub fn get_or_create(
        &self,
        name: &str,
        supplier: &mut dyn FnMut() -> BufferSet,
    ) -> Result<Arc<LogNode>> {
        if let Some(node) = self.node(name) {
            return Ok(node);
        }

        let mut nodes = self.nodes.write().unwrap_or_else(|err| err.into_inner());
        // Re-check: another caller may have created it meanwhile
        if let Some(node) = nodes.get(name).filter(|node| !node.is_deleted()) {
            return Ok(Arc::clone(node));
        }

        let node = Arc::new(LogNode::open(
            self.node_dir(name),
            name,
            self.config.clone(),
            supplier(),
        )?);
        nodes.insert(name.to_string(), Arc::clone(&node));
        debug!("Registered log node {}", name);
        Ok(node)
    }

    /// Deletes the node called `name` and unregisters it.
    ///
    /// Returns the node's staging buffers, or `None` if no node was registered.
    pub fn delete_node(&self, name: &str) -> Result<Option<BufferSet>> {
        let removed = {
            let mut nodes = self.nodes.write().unwrap_or_else(|err| err.into_inner());
            nodes.remove(name)
        };
        match removed {
            Some(node) => Ok(Some(node.delete()?)),
            None => Ok(None),
        }
    }

    /// Names of the registered, not deleted nodes in sorted order.
    pub fn node_names(&self) -> Vec<String> {
        let nodes = self.nodes.read().unwrap_or_else(|err| err.into_inner());
        let mut names: Vec<_> = nodes
            .iter()
            .filter(|(_, node)| !node.is_deleted())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Percent-encodes every byte outside `[A-Za-z0-9.-]` and a leading dot.
///
/// The encoding is injective and never yields an empty name, `.` or `..`.
fn encode_node_name(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    let mut encoded = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && i > 0);
        if plain {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

impl LogNodeRegistry for LogNodeManager {
    fn get_or_create_node(
        &self,
        name: &str,
        supplier: &mut dyn FnMut() -> BufferSet,
    ) -> Result<Arc<dyn LogReplaySource>> {
        let node: Arc<dyn LogReplaySource> = self.get_or_create(name, supplier)?;
        Ok(node)
    }
}
