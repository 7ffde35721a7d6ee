use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::config::SchedulingConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::time::{Clock, SystemClock};

/// Per-practice engines. Each practice gets its own Engine + WAL + compactor.
/// Practice = database name from the pgwire connection.
pub struct PracticeManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    config: SchedulingConfig,
    clock: Arc<dyn Clock>,
}

impl PracticeManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, config: SchedulingConfig) -> Self {
        Self::with_clock(data_dir, compact_threshold, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        data_dir: PathBuf,
        compact_threshold: u64,
        config: SchedulingConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            config,
            clock,
        }
    }

    /// Get or lazily load the engine of a practice.
    pub fn get_or_create(&self, practice: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(practice) {
            return Ok(engine.value().clone());
        }
        if practice.len() > MAX_PRACTICE_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "practice name too long"));
        }

        // Keep the WAL inside data_dir whatever the client sends.
        let safe_name: String = practice
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty practice name"));
        }

        // The entry lock serialises concurrent first connections to one practice.
        let entry = self.engines.entry(practice.to_string());
        if let dashmap::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }
        if self.engines.len() >= MAX_PRACTICES {
            return Err(io::Error::other("too many practices"));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            Arc::new(NotifyHub::new()),
            self.config.clone(),
            self.clock.clone(),
        )?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        entry.or_insert(engine.clone());
        metrics::gauge!(observability::PRACTICES_ACTIVE).set(self.engines.len() as f64);
        info!("loaded practice {practice:?}");
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}
