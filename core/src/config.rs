use crate::types::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Page sizing. Bounds memory per page and the length of each write transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub page_size: usize,
    /// Hard cap on records pulled per entity type in one run.
    pub max_rows_per_entity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    /// Look-back window per entity source name ("payments", "tickets", ...).
    /// Missing entry means no time bound, only the row cap.
    #[serde(default)]
    pub window_days: HashMap<String, u32>,
}

impl FetchConfig {
    pub fn window_for(&self, kind: EntityKind) -> Option<u32> {
        self.window_days.get(kind.source_name()).copied()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SyncConfigFile {
    batch: BatchConfig,
    fetch: FetchConfig,
}

/// Extra source column names, keyed by "entity.field" (e.g. "customer.name").
/// Probed after the built-in candidates.
#[derive(Debug, Clone, Default, Deserialize)]
struct FieldAliasFile {
    #[serde(default)]
    aliases: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub batch: BatchConfig,
    pub fetch: FetchConfig,
    pub field_aliases: HashMap<String, Vec<String>>,
}

impl SyncConfig {
    /// Load from the data/ directory.
    /// In tests, use SyncConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/sync/sync_config.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let file: SyncConfigFile = serde_json::from_str(&content)?;

        if file.batch.page_size == 0 {
            anyhow::bail!("{path}: batch.page_size must be > 0");
        }

        // Aliases are optional; a tenant with a well-known schema needs none.
        let alias_path = format!("{data_dir}/mapping/field_aliases.json");
        let aliases = match std::fs::read_to_string(&alias_path) {
            Ok(content) => serde_json::from_str::<FieldAliasFile>(&content)?.aliases,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => anyhow::bail!("Cannot read {alias_path}: {e}"),
        };

        Ok(Self {
            batch: file.batch,
            fetch: file.fetch,
            field_aliases: aliases,
        })
    }

    /// Config with hardcoded defaults for use in tests.
    /// Small pages so multi-page behaviour shows up with a handful of records.
    pub fn default_test() -> Self {
        Self {
            batch: BatchConfig {
                page_size: 2,
                max_rows_per_entity: 1_000,
            },
            fetch: FetchConfig {
                timeout_secs: 5,
                window_days: HashMap::new(),
            },
            field_aliases: HashMap::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig {
                page_size: 500,
                max_rows_per_entity: 10_000,
            },
            fetch: FetchConfig {
                timeout_secs: 30,
                window_days: HashMap::from([
                    ("tickets".to_string(), 30),
                    ("usage".to_string(), 90),
                ]),
            },
            field_aliases: HashMap::new(),
        }
    }
}
