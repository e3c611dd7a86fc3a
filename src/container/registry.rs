use super::ContainerHandler;
use crate::error::{Result, SigningError};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Ordered set of container handlers, queried through `can_handle`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn ContainerHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. Names must be unique.
    pub fn register(&self, handler: Arc<dyn ContainerHandler>) -> Result<()> {
        let mut handlers = self.handlers.write();
        if handlers.iter().any(|h| h.name() == handler.name()) {
            return Err(SigningError::DuplicateHandler(handler.name().to_string()));
        }
        debug!(handler = handler.name(), "Registered container handler");
        handlers.push(handler);
        Ok(())
    }

    /// The handler for `path`, `None` for plain files.
    ///
    /// More than one match is an `AmbiguousHandler` error.
    pub fn find_handler(&self, path: &Path) -> Result<Option<Arc<dyn ContainerHandler>>> {
        let handlers = self.handlers.read();
        let mut matches = handlers.iter().filter(|h| h.can_handle(path));
        let first = match matches.next() {
            Some(h) => h.clone(),
            None => return Ok(None),
        };
        let rest: Vec<String> = matches.map(|h| h.name().to_string()).collect();
        if rest.is_empty() {
            return Ok(Some(first));
        }
        let mut names = vec![first.name().to_string()];
        names.extend(rest);
        Err(SigningError::AmbiguousHandler {
            path: path.to_path_buf(),
            handlers: names,
        })
    }

    pub fn handler_named(&self, name: &str) -> Result<Arc<dyn ContainerHandler>> {
        self.handlers
            .read()
            .iter()
            .find(|h| h.name() == name)
            .cloned()
            .ok_or_else(|| SigningError::UnknownHandler(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
