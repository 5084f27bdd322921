//! Typed key/value configuration registry
//!
//! A passive registry: code declares the variables it consumes with
//! `lookup` (name, default, description), holds the returned handle, and
//! reads it when needed. Whatever drives configuration (a file loader, a
//! test) pushes new values with `set`; change listeners fire on every
//! effective change.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use tracing::{error, info};

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// One typed configuration variable
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn new(name: &str, default: T, description: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            description: description.to_string(),
            value: RwLock::new(default),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Snapshot of the current value
    pub fn value(&self) -> T {
        self.value.read().unwrap().clone()
    }

    /// Replace the value; listeners observe `(old, new)` on change
    pub fn set(&self, new: T) {
        let old = {
            let mut w = self.value.write().unwrap();
            if *w == new {
                return;
            }
            std::mem::replace(&mut *w, new.clone())
        };
        info!(target: "system", name = %self.name, ?old, ?new, "config changed");
        // Listeners run outside the value lock so they may read the var
        let listeners = self.listeners.lock().unwrap();
        for l in listeners.iter() {
            l(&old, &new);
        }
    }

    /// Attach a change listener
    pub fn on_change(&self, listener: impl Fn(&T, &T) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }
}

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>> = OnceLock::new();

/// Look up a variable, declaring it with `default` on first use
///
/// Later lookups of the same name must use the same type: a mismatch logs
/// an error and yields a detached variable that is not in the registry.
pub fn lookup<T>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>>
where
    T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().unwrap();

    if let Some(existing) = map.get(name) {
        match Arc::downcast::<ConfigVar<T>>(existing.clone()) {
            Ok(var) => return var,
            Err(_) => {
                error!(
                    target: "system",
                    name,
                    requested = std::any::type_name::<T>(),
                    "config lookup type mismatch, returning detached var"
                );
                return ConfigVar::new(name, default, description);
            }
        }
    }

    let var = ConfigVar::new(name, default, description);
    map.insert(name.to_string(), var.clone() as Arc<dyn Any + Send + Sync>);
    var
}
