//! Process-wide extractor registry.

use std::sync::Arc;

use crate::config::ExtractorsConfig;
use crate::extract::{
    DoclingExtractor, Extractor, ExtractorInfo, MinerUExtractor, RemoteOcrExtractor,
};

/// Fixed set of extractors known to this process. Built once at startup and
/// immutable afterwards; availability is a runtime predicate re-checked on
/// selection, not a type distinction.
#[derive(Clone)]
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// Register the built-in extractors from deployment configuration.
    pub fn builtin(config: &ExtractorsConfig) -> Self {
        let mut extractors: Vec<Arc<dyn Extractor>> = vec![
            Arc::new(DoclingExtractor::new(&config.docling_binary)),
            Arc::new(MinerUExtractor::new(&config.mineru_binary)),
        ];
        if let Some(endpoint) = config.remote_endpoint.clone() {
            extractors.push(Arc::new(RemoteOcrExtractor::new(
                endpoint,
                config.remote_model.clone(),
                config.remote_api_key_env.clone(),
            )));
        }
        let registry = Self { extractors };
        for info in registry.all_info() {
            tracing::info!(
                name = %info.name,
                version = %info.version,
                priority = info.priority,
                available = info.available,
                "registered extractor"
            );
        }
        registry
    }

    /// Registry over explicit implementations (tests, embedders).
    pub fn with_extractors(extractors: Vec<Arc<dyn Extractor>>) -> Self {
        Self { extractors }
    }

    pub fn count(&self) -> usize {
        self.extractors.len()
    }

    /// Every registered extractor, available or not.
    pub fn all_info(&self) -> Vec<ExtractorInfo> {
        self.extractors.iter().map(|e| e.info()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Extractor>> {
        self.extractors
            .iter()
            .find(|e| e.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Available extractors in priority order (ties by name).
    pub fn ordered_available(&self) -> Vec<Arc<dyn Extractor>> {
        let mut out: Vec<Arc<dyn Extractor>> = self
            .extractors
            .iter()
            .filter(|e| e.is_available())
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        out
    }

    /// Available local extractors in priority order.
    pub fn ordered_available_local(&self) -> Vec<Arc<dyn Extractor>> {
        self.ordered_available()
            .into_iter()
            .filter(|e| e.is_local())
            .collect()
    }

    /// The highest-priority available remote extractor, if any.
    pub fn available_remote(&self) -> Option<Arc<dyn Extractor>> {
        self.ordered_available().into_iter().find(|e| !e.is_local())
    }

    /// Resolve an explicit request list, preserving request order. Unknown
    /// or unavailable names come back in the second slot.
    pub fn resolve_requested(
        &self,
        names: &[String],
    ) -> (Vec<Arc<dyn Extractor>>, Vec<String>) {
        let mut resolved = Vec::new();
        let mut missing = Vec::new();
        for name in names {
            match self.get(name) {
                Some(extractor) if extractor.is_available() => resolved.push(extractor),
                _ => missing.push(name.clone()),
            }
        }
        (resolved, missing)
    }
}
