//! HandlerRegistry - handler の登録と管理
//!
//! 起動時に組み立て、以後は読み取り専用です。キーは `HandlerName`。

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use crate::domain::envelope::HandlerName;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler '{0}' is already registered")]
    AlreadyRegistered(HandlerName),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerName, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: Handler>(&mut self, handler: H) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&H::NAME) {
            return Err(RegistryError::AlreadyRegistered(H::NAME));
        }
        self.handlers
            .insert(H::NAME, Arc::new(TypedHandler::new(handler)));
        Ok(())
    }

    pub fn get(&self, name: HandlerName) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(&name).cloned()
    }

    /// Registered names in a stable order.
    pub fn registered(&self) -> Vec<HandlerName> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort();
        names
    }
}
