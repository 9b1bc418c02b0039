use std::sync::Arc;

use crate::{
    handler::HandlerRegistry,
    launcher::{platform_launcher, Launcher},
    notify::{MailTransport, Notifier},
};

/// Collaborators shared by every executor of one process.
///
/// Cheap to clone; each dispatched job receives its own copy.
#[derive(Clone)]
pub struct ExecEnv {
    pub launcher: Arc<dyn Launcher>,
    pub notifier: Notifier,
    pub handlers: Arc<HandlerRegistry>,
    /// Name compared against `run_on_host` and used in notifications.
    pub hostname: String,
}

impl ExecEnv {
    /// Environment for the current machine: platform launcher, configured
    /// mail transports and the local hostname.
    pub fn new(handlers: HandlerRegistry) -> Self {
        let hostname = current_hostname();
        Self {
            launcher: platform_launcher(),
            notifier: Notifier::new(hostname.clone()),
            handlers: Arc::new(handlers),
            hostname,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Route every notification through `transport`.
    pub fn with_transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.notifier = self.notifier.with_transport(transport);
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier.with_hostname(self.hostname.clone());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self.notifier = self.notifier.with_hostname(self.hostname.clone());
        self
    }
}

impl Default for ExecEnv {
    fn default() -> Self {
        Self::new(HandlerRegistry::new())
    }
}

impl std::fmt::Debug for ExecEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecEnv")
            .field("notifier", &self.notifier)
            .field("handlers", &self.handlers)
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

/// Hostname of this machine, or `localhost` when it cannot be determined.
pub fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
