//! Denoiser registry and factory.
//!
//! Maps a `DenoiserType` tag to a constructor and a capability predicate.
//! The process-wide registry is populated with the built-in algorithms on
//! first use and is effectively immutable afterwards; tests construct their
//! own instances and inject them through the factory functions.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::config::DenoiserOptions;
use crate::denoiser::{Denoiser, DenoiserType, NeuralDenoiser, SpectralDenoiser};
use crate::error::{PipelineError, PipelineResult};
use crate::logging::ContextLogger;

/// Selection order used when the caller does not supply a priority list.
pub const DEFAULT_PRIORITY: [DenoiserType; 2] = [DenoiserType::Neural, DenoiserType::Spectral];

pub struct RegistryEntry {
    pub denoiser_type: DenoiserType,
    pub constructor: fn(&DenoiserOptions) -> PipelineResult<Box<dyn Denoiser>>,
    pub is_supported: fn() -> bool,
}

struct RegistryInner {
    entries: HashMap<DenoiserType, RegistryEntry>,
    /// Registration order, for deterministic fallback scans.
    order: Vec<DenoiserType>,
}

pub struct DenoiserRegistry {
    inner: RwLock<RegistryInner>,
    log: ContextLogger,
}

impl DenoiserRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            log: ContextLogger::new("denoiser-registry"),
        }
    }

    /// Registry pre-populated with the built-in algorithms.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(RegistryEntry {
            denoiser_type: DenoiserType::Spectral,
            constructor: |options| Ok(Box::new(SpectralDenoiser::new(options))),
            is_supported: spectral_supported,
        });
        registry.register(RegistryEntry {
            denoiser_type: DenoiserType::Neural,
            constructor: |options| Ok(Box::new(NeuralDenoiser::new(options))),
            is_supported: neural_supported,
        });
        registry
    }

    /// Register or replace an entry. Replacement is legal but noisy.
    pub fn register(&self, entry: RegistryEntry) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ty = entry.denoiser_type;
        if inner.entries.insert(ty, entry).is_some() {
            self.log
                .warn(&format!("overwriting registry entry for {ty:?}"));
        } else {
            inner.order.push(ty);
        }
    }

    /// Instantiate a denoiser. Supplied options merge over the algorithm's
    /// defaults inside the constructor.
    pub fn create(
        &self,
        ty: DenoiserType,
        options: &DenoiserOptions,
    ) -> PipelineResult<Box<dyn Denoiser>> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = inner
            .entries
            .get(&ty)
            .ok_or(PipelineError::UnknownDenoiserType(ty))?;
        if !(entry.is_supported)() {
            return Err(PipelineError::UnsupportedDenoiserType(ty));
        }
        (entry.constructor)(options)
    }

    pub fn is_supported(&self, ty: DenoiserType) -> bool {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner
            .entries
            .get(&ty)
            .map(|entry| (entry.is_supported)())
            .unwrap_or(false)
    }

    pub fn supported_types(&self) -> Vec<DenoiserType> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner
            .order
            .iter()
            .copied()
            .filter(|ty| {
                inner
                    .entries
                    .get(ty)
                    .map(|entry| (entry.is_supported)())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// First supported type from the priority list, else the first
    /// registered-and-supported type, else none.
    pub fn best_available(&self, priority: Option<&[DenoiserType]>) -> Option<DenoiserType> {
        let priority = priority.unwrap_or(&DEFAULT_PRIORITY);
        for &ty in priority {
            if self.is_supported(ty) {
                return Some(ty);
            }
        }
        self.supported_types().first().copied()
    }
}

/// The process-wide registry, built-ins registered on first use.
pub fn global_registry() -> &'static DenoiserRegistry {
    static REGISTRY: OnceLock<DenoiserRegistry> = OnceLock::new();
    REGISTRY.get_or_init(DenoiserRegistry::with_builtins)
}

fn spectral_supported() -> bool {
    // The spectral kernel is statically linked.
    true
}

fn neural_supported() -> bool {
    // A transport can always be constructed natively; asset availability is
    // surfaced at initialize time.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsupported() -> bool {
        false
    }

    #[test]
    fn create_unknown_type_fails() {
        let registry = DenoiserRegistry::new();
        let err = registry
            .create(DenoiserType::Spectral, &DenoiserOptions::default())
            .err()
            .unwrap();
        assert_eq!(err, PipelineError::UnknownDenoiserType(DenoiserType::Spectral));
    }

    #[test]
    fn create_unsupported_type_fails() {
        let registry = DenoiserRegistry::new();
        registry.register(RegistryEntry {
            denoiser_type: DenoiserType::Neural,
            constructor: |options| Ok(Box::new(NeuralDenoiser::new(options))),
            is_supported: unsupported,
        });
        let err = registry
            .create(DenoiserType::Neural, &DenoiserOptions::default())
            .err()
            .unwrap();
        assert_eq!(
            err,
            PipelineError::UnsupportedDenoiserType(DenoiserType::Neural)
        );
        assert!(!registry.is_supported(DenoiserType::Neural));
    }

    #[test]
    fn builtins_are_supported_and_creatable() {
        let registry = DenoiserRegistry::with_builtins();
        assert!(registry.is_supported(DenoiserType::Spectral));
        assert!(registry.is_supported(DenoiserType::Neural));

        let denoiser = registry
            .create(DenoiserType::Spectral, &DenoiserOptions::default())
            .unwrap();
        assert_eq!(denoiser.denoiser_type(), DenoiserType::Spectral);
    }

    #[test]
    fn best_available_walks_priority_then_registration_order() {
        let registry = DenoiserRegistry::with_builtins();
        assert_eq!(registry.best_available(None), Some(DenoiserType::Neural));
        assert_eq!(
            registry.best_available(Some(&[DenoiserType::Spectral])),
            Some(DenoiserType::Spectral)
        );

        // Priority list entirely unsupported: falls back to the first
        // registered-and-supported entry.
        let registry = DenoiserRegistry::new();
        registry.register(RegistryEntry {
            denoiser_type: DenoiserType::Spectral,
            constructor: |options| Ok(Box::new(SpectralDenoiser::new(options))),
            is_supported: || true,
        });
        registry.register(RegistryEntry {
            denoiser_type: DenoiserType::Neural,
            constructor: |options| Ok(Box::new(NeuralDenoiser::new(options))),
            is_supported: unsupported,
        });
        assert_eq!(
            registry.best_available(Some(&[DenoiserType::Neural])),
            Some(DenoiserType::Spectral)
        );

        let empty = DenoiserRegistry::new();
        assert_eq!(empty.best_available(None), None);
    }

    #[test]
    fn reregistration_replaces_entry() {
        let registry = DenoiserRegistry::with_builtins();
        registry.register(RegistryEntry {
            denoiser_type: DenoiserType::Neural,
            constructor: |options| Ok(Box::new(NeuralDenoiser::new(options))),
            is_supported: unsupported,
        });
        assert!(!registry.is_supported(DenoiserType::Neural));
        // Order is preserved, not duplicated.
        assert_eq!(registry.supported_types(), vec![DenoiserType::Spectral]);
    }
}
