use crate::blob::Memory;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub node: String,
    pub port: usize,
}

impl PortRef {
    pub fn new(node: &str, port: usize) -> Self {
        Self {
            node: node.to_string(),
            port,
        }
    }
}

/// Connection from a producer's output port to a consumer's input port.
/// Both ends hold the same `Arc<Edge>`; the memory lives as long as either does.
#[derive(Debug)]
pub struct Edge {
    parent: PortRef,
    child: PortRef,
    memory: RwLock<Option<Memory>>,
}

impl Edge {
    pub fn new(parent: PortRef, child: PortRef) -> Arc<Self> {
        Arc::new(Self {
            parent,
            child,
            memory: RwLock::new(None),
        })
    }

    pub fn with_memory(parent: PortRef, child: PortRef, memory: Memory) -> Arc<Self> {
        let edge = Self::new(parent, child);
        edge.set_memory(memory);
        edge
    }

    pub fn parent(&self) -> &PortRef {
        &self.parent
    }

    pub fn child(&self) -> &PortRef {
        &self.child
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Option<Memory>> {
        self.memory.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Option<Memory>> {
        self.memory.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_memory(&self, memory: Memory) {
        *self.write() = Some(memory);
    }

    pub fn take_memory(&self) -> Option<Memory> {
        self.write().take()
    }

    pub fn memory(&self) -> Option<Memory> {
        self.read().clone()
    }

    pub fn is_allocated(&self) -> bool {
        self.read().is_some()
    }
}
