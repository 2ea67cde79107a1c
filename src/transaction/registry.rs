use super::holder::SessionResourceHolder;
use crate::core::{FactoryKey, Result, TxError};
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

tokio::task_local! {
    static CURRENT_REGISTRY: ResourceRegistry;
}

/// Holders bound for one logical call chain, keyed by factory identity.
///
/// At most one holder per key is bound at a time; `bind` and `unbind` are the
/// only ways in and out.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    resources: Arc<Mutex<HashMap<FactoryKey, Arc<SessionResourceHolder>>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of the calling chain, if one is installed.
    pub fn current() -> Option<ResourceRegistry> {
        CURRENT_REGISTRY.try_with(|registry| registry.clone()).ok()
    }

    /// Runs `future` with this registry installed for the calling chain.
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_REGISTRY.scope(self, future).await
    }

    pub fn get(&self, key: &FactoryKey) -> Result<Option<Arc<SessionResourceHolder>>> {
        let resources = self.resources.lock()?;
        Ok(resources.get(key).cloned())
    }

    pub fn has(&self, key: &FactoryKey) -> Result<bool> {
        Ok(self.resources.lock()?.contains_key(key))
    }

    pub fn bind(&self, key: FactoryKey, holder: Arc<SessionResourceHolder>) -> Result<()> {
        let mut resources = self.resources.lock()?;
        if resources.contains_key(&key) {
            return Err(TxError::illegal_state(format!(
                "a session is already bound for {}",
                key
            )));
        }
        debug!("Bound {} for {}", holder.session().id(), key);
        resources.insert(key, holder);
        Ok(())
    }

    pub fn unbind(&self, key: &FactoryKey) -> Result<Arc<SessionResourceHolder>> {
        self.unbind_if_possible(key)?
            .ok_or_else(|| TxError::illegal_state(format!("no session bound for {}", key)))
    }

    pub fn unbind_if_possible(&self, key: &FactoryKey) -> Result<Option<Arc<SessionResourceHolder>>> {
        let mut resources = self.resources.lock()?;
        let holder = resources.remove(key);
        if let Some(holder) = &holder {
            debug!("Unbound {} for {}", holder.session().id(), key);
        }
        Ok(holder)
    }

    pub fn len(&self) -> usize {
        self.resources.lock().map(|resources| resources.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("bound", &self.len())
            .finish()
    }
}
