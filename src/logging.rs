//! Leveled, context-tagged logging for the pipeline.
//!
//! The pipeline never talks to a logging backend directly; it emits through
//! the `log` facade and lets the host application install whatever sink it
//! wants. What this module adds on top of the facade:
//!
//! - a per-logger level gate (including `Silent`, which the facade lacks),
//! - a context map rendered as `k=v` pairs in front of every message,
//! - cheap child loggers that merge additional context while sharing the
//!   parent's level cell, so `set_level` on any member affects the family.
//!
//! Loggers are acquired by value and never stored back into shared state, so
//! there are no reference cycles between components and their loggers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const LOG_TARGET: &str = "clearstream";

/// Severity levels, ordered. `Silent` suppresses everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Silent = 5,
}

impl LogLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::Silent,
        }
    }
}

/// Context-carrying logger handle. Cloning is cheap; clones share the level.
#[derive(Clone)]
pub struct ContextLogger {
    level: Arc<AtomicU8>,
    context: Arc<BTreeMap<String, String>>,
}

impl ContextLogger {
    pub fn new(component: &str) -> Self {
        let mut context = BTreeMap::new();
        context.insert("component".to_string(), component.to_string());
        Self {
            level: Arc::new(AtomicU8::new(LogLevel::Info as u8)),
            context: Arc::new(context),
        }
    }

    /// Child logger with merged context. Later keys overwrite earlier ones.
    /// The child shares this logger's level cell.
    pub fn child(&self, extra: &[(&str, &str)]) -> Self {
        let mut context = (*self.context).clone();
        for (k, v) in extra {
            context.insert((*k).to_string(), (*v).to_string());
        }
        Self {
            level: Arc::clone(&self.level),
            context: Arc::new(context),
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    #[inline]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Silent && level >= self.level()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if !self.enabled(level) {
            return;
        }
        let facade_level = match level {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
            LogLevel::Silent => return,
        };
        let mut prefix = String::new();
        for (k, v) in self.context.iter() {
            prefix.push_str(k);
            prefix.push('=');
            prefix.push_str(v);
            prefix.push(' ');
        }
        log::log!(target: LOG_TARGET, facade_level, "{prefix}{message}");
    }

    pub fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

impl std::fmt::Debug for ContextLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLogger")
            .field("level", &self.level())
            .field("context", &self.context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_merges_and_overrides_context() {
        let root = ContextLogger::new("pipeline");
        let child = root.child(&[("session", "s1"), ("component", "denoiser")]);

        assert_eq!(child.context().get("session").unwrap(), "s1");
        assert_eq!(child.context().get("component").unwrap(), "denoiser");
        // Parent untouched
        assert_eq!(root.context().get("component").unwrap(), "pipeline");
        assert!(root.context().get("session").is_none());
    }

    #[test]
    fn level_is_shared_across_family() {
        let root = ContextLogger::new("pipeline");
        let child = root.child(&[("session", "s1")]);

        child.set_level(LogLevel::Error);
        assert_eq!(root.level(), LogLevel::Error);
        assert!(!root.enabled(LogLevel::Warn));
        assert!(root.enabled(LogLevel::Error));
    }

    #[test]
    fn silent_suppresses_everything() {
        let logger = ContextLogger::new("pipeline");
        logger.set_level(LogLevel::Silent);
        assert!(!logger.enabled(LogLevel::Error));
        // Does not panic or emit
        logger.error("ignored");
    }
}
