//! A thin, named wrapper over the `log` facade.
//!
//! Each long-lived component (`UploadEngine`, `Supervisor`, `MetaStore`,
//! `TransportClient`) holds its own `Logger` instead of calling `log::debug!`
//! directly, so every line it emits carries the component's name as the
//! `log` target without the caller having to repeat it.

use std::fmt;

#[derive(Clone, Debug)]
pub struct Logger {
    name: &'static str,
}

impl Logger {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn debug(&self, message: impl fmt::Display) {
        log::debug!(target: self.name, "{message}");
    }

    pub fn info(&self, message: impl fmt::Display) {
        log::info!(target: self.name, "{message}");
    }

    pub fn warn(&self, message: impl fmt::Display) {
        log::warn!(target: self.name, "{message}");
    }

    pub fn error(&self, message: impl fmt::Display) {
        log::error!(target: self.name, "{message}");
    }
}
