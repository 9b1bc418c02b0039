use std::{collections::HashMap, fmt, io::Write, sync::Arc};

use serde_json::Value;

/// In-process job body.
///
/// Receives the job's stdout destination as a writer. The job succeeds only
/// if it returns exactly `Value::Bool(true)`; any other value or an error
/// is reported as a failure.
pub type HandlerFn = dyn Fn(&mut dyn Write) -> anyhow::Result<Value> + Send + Sync;

/// String-keyed table of in-process handlers.
///
/// Handler jobs refer to their body by name so that the job description stays
/// serializable; a detached executor resolves the name in its own registry.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<HandlerFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut dyn Write) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<HandlerFn>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_replaces_and_resolves() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("report", |_out| Ok(Value::Bool(false)))
            .register("report", |out| {
                out.write_all(b"sent")?;
                Ok(Value::Bool(true))
            });
        assert!(registry.contains("report"));
        assert!(!registry.contains("missing"));
        assert_eq!(format!("{registry:?}"), r#"HandlerRegistry { handlers: ["report"] }"#);
        assert!(registry.get("missing").is_none());

        let handler = registry.get("report").unwrap();
        let mut buf = Vec::new();
        assert_eq!(handler(&mut buf as &mut dyn Write).unwrap(), Value::Bool(true));
        assert_eq!(buf, b"sent");
    }

    #[test]
    fn debug_lists_sorted_names() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("b", |_out| Ok(Value::Null))
            .register("a", |_out| Ok(Value::Null));
        assert_eq!(
            format!("{registry:?}"),
            r#"HandlerRegistry { handlers: ["a", "b"] }"#
        );
    }
}
