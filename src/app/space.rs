//! Space - the per-Point service locator.
//!
//! Applications (dispatcher, outbound manager, transport registry) are
//! bound by id during construction; handlers look them up at creation
//! time. The table is written only while the Point is being assembled and
//! is read-only after `initialize`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Identifier of a bound application.
pub type AppId = &'static str;

/// An application living in a Space. `initialize` runs once, after every
/// handler has been bound, and may perform cross-handler wiring.
pub trait Application: Any + Send + Sync {
    fn initialize(&self) -> Result<()> {
        Ok(())
    }
}

struct AppEntry {
    any: Arc<dyn Any + Send + Sync>,
    app: Arc<dyn Application>,
}

/// Service locator owning the applications of one Point.
pub struct Space {
    apps: Mutex<HashMap<AppId, AppEntry>>,
    initialized: AtomicBool,
}

impl Space {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            apps: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        })
    }

    /// Bind an application. Only valid during construction.
    pub fn bind_app<T: Application>(&self, id: AppId, app: Arc<T>) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(Error::Config(format!(
                "cannot bind app {} after initialization",
                id
            )));
        }
        let entry = AppEntry {
            any: app.clone(),
            app,
        };
        self.apps.lock().insert(id, entry);
        Ok(())
    }

    pub fn has_app(&self, id: AppId) -> bool {
        self.apps.lock().contains_key(id)
    }

    /// Look up an application by id and concrete type.
    pub fn get_app<T: Application>(&self, id: AppId) -> Option<Arc<T>> {
        let apps = self.apps.lock();
        apps.get(id)
            .and_then(|entry| Arc::downcast::<T>(entry.any.clone()).ok())
    }

    /// Run every application's initialization hook. Called once after all
    /// handlers are bound.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let apps: Vec<Arc<dyn Application>> =
            self.apps.lock().values().map(|e| e.app.clone()).collect();
        for app in apps {
            app.initialize()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        value: u32,
    }

    impl Application for Dummy {}

    #[test]
    fn test_bind_and_get() {
        let space = Space::new();
        space
            .bind_app("dummy", Arc::new(Dummy { value: 7 }))
            .unwrap();
        assert!(space.has_app("dummy"));
        let app = space.get_app::<Dummy>("dummy").unwrap();
        assert_eq!(app.value, 7);
    }

    #[test]
    fn test_missing_app() {
        let space = Space::new();
        assert!(!space.has_app("nope"));
        assert!(space.get_app::<Dummy>("nope").is_none());
    }

    #[test]
    fn test_bind_after_initialize_fails() {
        let space = Space::new();
        space.initialize().unwrap();
        let result = space.bind_app("late", Arc::new(Dummy { value: 1 }));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
