//! In-memory emulation backend and artifact sink

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::emulation::{EmulationBackend, ProvisionError};
use crate::publish::{ArtifactSink, BundleFile, SinkError};

/// Emulation backend that only counts calls
#[derive(Debug, Clone, Default)]
pub struct MockEmulation {
    calls: Arc<AtomicUsize>,
    failure: Option<String>,
}

impl MockEmulation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose registration always fails with `message`
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            calls: Arc::default(),
            failure: Some(message.into()),
        }
    }

    pub fn register_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmulationBackend for MockEmulation {
    fn name(&self) -> &str {
        "mock"
    }

    fn register(&self) -> Result<(), ProvisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(message) => Err(ProvisionError::Backend(message.clone())),
            None => Ok(()),
        }
    }
}

/// A bundle as the sink received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedBundle {
    pub name: String,
    /// Bundle path -> contents
    pub files: BTreeMap<String, Vec<u8>>,
}

/// Sink that keeps bundles in memory
#[derive(Debug, Clone, Default)]
pub struct MockSink {
    published: Arc<Mutex<Vec<PublishedBundle>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any publish of `bundle_name`
    pub fn fail_bundle(self, bundle_name: impl Into<String>) -> Self {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(bundle_name.into());
        }
        self
    }

    /// Accepted bundles, in publish order
    pub fn published(&self) -> Vec<PublishedBundle> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.published().into_iter().map(|b| b.name).collect()
    }
}

impl ArtifactSink for MockSink {
    fn name(&self) -> &str {
        "mock"
    }

    fn publish(&self, bundle_name: &str, files: &[BundleFile]) -> Result<String, SinkError> {
        let rejected = self
            .failing
            .lock()
            .map(|f| f.contains(bundle_name))
            .unwrap_or(false);
        if rejected {
            return Err(SinkError::Rejected(format!("{} refused by mock sink", bundle_name)));
        }

        let mut contents = BTreeMap::new();
        for file in files {
            let bytes = fs::read(&file.source).map_err(|source| SinkError::Io {
                path: file.source.clone(),
                source,
            })?;
            contents.insert(file.relative_path.clone(), bytes);
        }

        if let Ok(mut published) = self.published.lock() {
            published.push(PublishedBundle {
                name: bundle_name.to_string(),
                files: contents,
            });
        }
        Ok(format!("mock://{}", bundle_name))
    }
}
