//! # hindsight-core
//!
//! Long-term agentic memory engine: a content-addressed knowledge store with
//! hybrid retrieval, write-time reconsolidation, and background
//! consolidation into durable observations.
//!
//! The crate is an embeddable library, not a service: a host process injects
//! an [`Embedder`], an [`LlmAdapter`], and optionally a [`Reranker`], and
//! drives one [`Engine`] per bank-scoped database. There is no network
//! server, agent loop, or chat UI here — see the component table in each
//! module for what each piece is responsible for.
//!
//! ## Components
//!
//! | # | Component | Module |
//! |---|---|---|
//! | C1 | Storage | [`storage`] |
//! | C2 | Embedding store | [`embeddings`] |
//! | C3 | Hybrid search primitives | [`search`] |
//! | C4 | Entity resolution | [`entity`] |
//! | C5 | Write-time router | [`router`] |
//! | C6 | Link builder | [`links`] |
//! | C7 | Episode tracker | [`episodes`] |
//! | C8 | Retain pipeline | [`retain`] |
//! | C9 | Recall engine | [`recall`] |
//! | C10 | Consolidation engine | [`consolidation`] |
//! | C11 | Reflect agent | [`reflect`] |
//! | C12 | Async operation queue | [`asyncops`] |
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use hindsight_core::{Engine, HindsightConfig};
//!
//! let engine = Engine::open(config)?;
//! engine.create_bank(&bank)?;
//! let result = engine.retain("bank-1", "Alice lives in Paris.", Default::default()).await?;
//! let (hits, _trace) = engine.recall("bank-1", "where does Alice live?", Default::default()).await?;
//! ```

pub mod asyncops;
pub mod config;
pub mod consolidation;
pub mod embeddings;
pub mod entity;
pub mod episodes;
pub mod error;
pub mod extract;
pub mod links;
pub mod llm;
pub mod model;
pub mod recall;
pub mod reflect;
pub mod retain;
pub mod router;
pub mod search;
pub mod storage;
pub mod util;

use std::sync::Arc;

pub use config::{EngineDefaults, HindsightConfig};
pub use embeddings::{EmbeddingStore, Embedder};
pub use error::{HindsightError, Result};
pub use llm::LlmAdapter;
pub use model::*;
pub use search::Reranker;
pub use storage::Storage;

use asyncops::EnqueueResult;
use consolidation::{ConsolidationOptions, ConsolidationReport};
use recall::{RecallHit, RecallOptions, Trace};
use reflect::{ReflectOptions, ReflectResult};
use retain::{RetainOptions, RetainResult};

/// A single bank-scoped memory engine: owns the storage file, the embedding
/// indices, and the injected collaborators, and is the entry point for every
/// component (`spec.md` §6 "Top-level API surface").
pub struct Engine {
    storage: Arc<Storage>,
    embeddings: Arc<EmbeddingStore>,
    llm: Option<Arc<dyn LlmAdapter>>,
    rerank: Option<Arc<dyn Reranker>>,
    defaults: EngineDefaults,
    enable_consolidation: bool,
}

impl Engine {
    /// Open (creating if absent) the database named in `config` and apply
    /// pending migrations.
    pub fn open(config: HindsightConfig) -> Result<Self> {
        let storage = Storage::open(config.db_path).map_err(HindsightError::from)?;
        Ok(Self {
            storage: Arc::new(storage),
            embeddings: Arc::new(EmbeddingStore::new(config.embed)),
            llm: config.llm,
            rerank: config.rerank,
            defaults: config.defaults,
            enable_consolidation: config.enable_consolidation,
        })
    }

    /// In-memory engine for tests and short-lived hosts.
    pub fn open_in_memory(embed: Arc<dyn Embedder>, llm: Option<Arc<dyn LlmAdapter>>) -> Result<Self> {
        let storage = Storage::open_in_memory().map_err(HindsightError::from)?;
        Ok(Self {
            storage: Arc::new(storage),
            embeddings: Arc::new(EmbeddingStore::new(embed)),
            llm,
            rerank: None,
            defaults: EngineDefaults::default(),
            enable_consolidation: true,
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Swap the injected LLM adapter, keeping the same storage and embedding
    /// index. Useful for hosts that rotate providers, or tests that need a
    /// different scripted response per call than the one retain consumed.
    pub fn with_llm(mut self, llm: Arc<dyn LlmAdapter>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn embeddings(&self) -> &EmbeddingStore {
        &self.embeddings
    }

    pub fn create_bank(&self, bank: &Bank) -> Result<()> {
        self.storage.create_bank(bank).map_err(HindsightError::from)
    }

    pub fn get_bank(&self, bank_id: &str) -> Result<Option<Bank>> {
        self.storage.get_bank(bank_id).map_err(HindsightError::from)
    }

    pub fn list_banks(&self) -> Result<Vec<Bank>> {
        self.storage.list_banks().map_err(HindsightError::from)
    }

    pub fn update_bank_config(&self, bank_id: &str, config: &BankConfig) -> Result<()> {
        self.storage.update_bank_config(bank_id, config).map_err(HindsightError::from)
    }

    pub fn delete_bank(&self, bank_id: &str) -> Result<()> {
        self.storage.delete_bank(bank_id).map_err(HindsightError::from)
    }

    fn bank_config(&self, bank_id: &str) -> Result<BankConfig> {
        Ok(self.storage.get_bank(bank_id).map_err(HindsightError::from)?.map(|b| b.config).unwrap_or_default())
    }

    /// Run the write path (C8) for one piece of content (`spec.md` §4.7).
    pub async fn retain(&self, bank_id: &str, content: &str, options: RetainOptions) -> Result<RetainResult> {
        let bank_config = self.bank_config(bank_id)?;
        retain::retain(
            self.storage.clone(),
            self.embeddings.clone(),
            self.llm.clone(),
            &self.defaults,
            &bank_config,
            bank_id,
            content,
            options,
        )
        .await
    }

    /// Batch form of [`Engine::retain`]: one result per input item (`spec.md` §4.7).
    pub async fn retain_batch(
        &self,
        bank_id: &str,
        items: Vec<retain::RetainBatchItem>,
        options: RetainOptions,
    ) -> Result<Vec<RetainResult>> {
        let bank_config = self.bank_config(bank_id)?;
        retain::retain_batch(
            self.storage.clone(),
            self.embeddings.clone(),
            self.llm.clone(),
            &self.defaults,
            &bank_config,
            bank_id,
            items,
            options,
        )
        .await
    }

    /// Run hybrid retrieval (C9) for `query` (`spec.md` §4.8).
    pub async fn recall(
        &self,
        bank_id: &str,
        query: &str,
        options: &RecallOptions,
    ) -> Result<(Vec<RecallHit>, Trace)> {
        recall::recall(&self.storage, &self.embeddings, self.rerank.as_ref(), &self.defaults, bank_id, query, options)
            .await
    }

    /// Review unconsolidated memories and distill observations (C10).
    /// Returns `Ok(default())` if no LLM adapter was injected.
    pub async fn consolidate(&self, bank_id: &str, options: ConsolidationOptions) -> Result<ConsolidationReport> {
        let Some(llm) = &self.llm else {
            return Ok(ConsolidationReport::default());
        };
        consolidation::consolidate(&self.storage, &self.embeddings, llm.as_ref(), bank_id, options).await
    }

    /// Run the bounded tool-use reflect loop over the bank's memory hierarchy (C11).
    pub async fn reflect(&self, bank_id: &str, question: &str, options: &ReflectOptions) -> Result<ReflectResult> {
        let Some(llm) = &self.llm else {
            return Err(HindsightError::Input("reflect requires an llm adapter".to_string()));
        };
        reflect::reflect(&self.storage, &self.embeddings, llm.as_ref(), &self.defaults, bank_id, question, options).await
    }

    // ------------------------------------------------------------------
    // Introspection surface (`spec.md` §6)
    // ------------------------------------------------------------------

    pub fn list_memory_units(
        &self,
        bank_id: &str,
        before: Option<(i64, &str)>,
        limit: usize,
    ) -> Result<Vec<MemoryUnit>> {
        self.storage.list_memory_units(bank_id, before, limit).map_err(HindsightError::from)
    }

    pub fn get_memory_unit(&self, bank_id: &str, memory_id: &str) -> Result<Option<MemoryUnit>> {
        self.storage.get_memory(bank_id, memory_id).map_err(HindsightError::from)
    }

    pub fn list_entities(&self, bank_id: &str) -> Result<Vec<Entity>> {
        self.storage.entities_by_bank(bank_id).map_err(HindsightError::from)
    }

    pub fn get_entity(&self, bank_id: &str, entity_id: &str) -> Result<Option<Entity>> {
        self.storage.get_entity(bank_id, entity_id).map_err(HindsightError::from)
    }

    pub fn list_tags(&self, bank_id: &str) -> Result<Vec<String>> {
        self.storage.list_tags(bank_id).map_err(HindsightError::from)
    }

    pub fn list_episodes(&self, bank_id: &str, before_ms: Option<i64>, limit: usize) -> Result<Vec<Episode>> {
        self.storage.list_episodes(bank_id, before_ms, limit).map_err(HindsightError::from)
    }

    /// Walk the episode chain around `anchor_memory_id` (`spec.md` §4.6).
    pub fn narrative(
        &self,
        bank_id: &str,
        anchor_memory_id: &str,
        direction: episodes::NarrativeDirection,
        steps: Option<usize>,
    ) -> Result<Vec<episodes::NarrativeEvent>> {
        episodes::narrative(&self.storage, bank_id, anchor_memory_id, direction, steps).map_err(HindsightError::from)
    }

    pub fn bank_stats(&self, bank_id: &str) -> Result<storage::BankStats> {
        self.storage.bank_stats(bank_id).map_err(HindsightError::from)
    }

    // ------------------------------------------------------------------
    // Mental model CRUD (`spec.md` §6)
    // ------------------------------------------------------------------

    /// Create or update a mental model. `refreshMentalModel` (the content
    /// regeneration flow) is driven by [`Engine::enqueue_refresh_mental_model`];
    /// this is the plain upsert for caller-supplied content.
    pub fn upsert_mental_model(&self, mental_model: &MentalModel) -> Result<()> {
        self.storage.upsert_mental_model(mental_model).map_err(HindsightError::from)
    }

    pub fn get_mental_model(&self, bank_id: &str, mental_model_id: &str) -> Result<Option<MentalModel>> {
        self.storage.get_mental_model(bank_id, mental_model_id).map_err(HindsightError::from)
    }

    pub fn list_mental_models(&self, bank_id: &str) -> Result<Vec<MentalModel>> {
        self.storage.mental_models_by_bank(bank_id).map_err(HindsightError::from)
    }

    pub fn delete_mental_model(&self, bank_id: &str, mental_model_id: &str) -> Result<()> {
        self.storage.delete_mental_model(bank_id, mental_model_id).map_err(HindsightError::from)
    }

    // ------------------------------------------------------------------
    // Directive CRUD (`spec.md` §6)
    // ------------------------------------------------------------------

    pub fn create_directive(&self, directive: &Directive) -> Result<()> {
        self.storage.create_directive(directive).map_err(HindsightError::from)
    }

    pub fn update_directive(&self, directive: &Directive) -> Result<()> {
        self.storage.update_directive(directive).map_err(HindsightError::from)
    }

    pub fn delete_directive(&self, bank_id: &str, directive_id: &str) -> Result<()> {
        self.storage.delete_directive(bank_id, directive_id).map_err(HindsightError::from)
    }

    pub fn get_directive(&self, bank_id: &str, directive_id: &str) -> Result<Option<Directive>> {
        self.storage.get_directive(bank_id, directive_id).map_err(HindsightError::from)
    }

    /// All directives in the bank, active or not. Use [`Engine::active_directives`]
    /// for the filtered set the reflect/consolidation loops actually assemble.
    pub fn list_directives(&self, bank_id: &str) -> Result<Vec<Directive>> {
        self.storage.directives_by_bank(bank_id).map_err(HindsightError::from)
    }

    pub fn active_directives(&self, bank_id: &str) -> Result<Vec<Directive>> {
        self.storage.active_directives(bank_id).map_err(HindsightError::from)
    }

    /// Enqueue a background retain (C12); useful for large documents a host
    /// doesn't want to block on.
    pub fn enqueue_retain(&self, bank_id: &str, content: &str, options: &RetainOptions) -> Result<EnqueueResult> {
        asyncops::enqueue_retain(&self.storage, bank_id, content, options)
    }

    pub fn enqueue_consolidation(&self, bank_id: &str) -> Result<EnqueueResult> {
        asyncops::enqueue_consolidation(&self.storage, bank_id)
    }

    pub fn enqueue_refresh_mental_model(&self, bank_id: &str, mental_model_id: &str) -> Result<EnqueueResult> {
        asyncops::enqueue_refresh_mental_model(&self.storage, bank_id, mental_model_id)
    }

    pub fn get_operation(&self, operation_id: &str) -> Result<Option<AsyncOperation>> {
        asyncops::get(&self.storage, operation_id)
    }

    pub fn cancel_operation(&self, operation_id: &str) -> Result<()> {
        asyncops::cancel(&self.storage, operation_id)
    }

    pub fn list_operations(
        &self,
        bank_id: &str,
        status: Option<OpStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AsyncOperation>> {
        asyncops::list(&self.storage, bank_id, status, offset, limit)
    }

    /// Drain up to `max_ops` pending operations for `bank_id` in-process.
    /// Hosts with their own worker pool can instead poll `list_operations`
    /// and dispatch independently.
    pub async fn run_pending_operations(&self, bank_id: &str, max_ops: usize) -> Result<usize> {
        let bank_config = self.bank_config(bank_id)?;
        asyncops::run_pending(
            self.storage.clone(),
            self.embeddings.clone(),
            self.llm.clone(),
            &self.defaults,
            &bank_config,
            bank_id,
            max_ops,
        )
        .await
    }

    /// Schedule consolidation the same way `retain` does internally, without
    /// going through a full retain call — for hosts that want to trigger it
    /// on their own cadence.
    pub fn trigger_consolidation(&self, bank_id: &str) -> Result<EnqueueResult> {
        if !self.enable_consolidation {
            return Err(HindsightError::Input("consolidation disabled for this engine".to_string()));
        }
        self.enqueue_consolidation(bank_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use error::EmbeddingError;

    struct FakeEmbedder;

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            let mut v = vec![0.0_f32; 8];
            for (i, b) in text.bytes().enumerate() {
                v[i % 8] += b as f32;
            }
            Ok(v)
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    #[tokio::test]
    async fn open_in_memory_applies_migrations_and_accepts_a_bank() {
        let engine = Engine::open_in_memory(Arc::new(FakeEmbedder), None).unwrap();
        let now = chrono::Utc::now();
        let bank = Bank {
            id: "bank-1".into(),
            name: "test".into(),
            description: None,
            config: BankConfig::default(),
            disposition: [3, 3, 3],
            mission: None,
            created_at: now,
            updated_at: now,
        };
        engine.create_bank(&bank).unwrap();
        assert_eq!(engine.get_bank("bank-1").unwrap().unwrap().name, "test");
    }

    #[tokio::test]
    async fn retain_without_an_llm_degrades_to_an_empty_result() {
        let engine = Engine::open_in_memory(Arc::new(FakeEmbedder), None).unwrap();
        let now = chrono::Utc::now();
        let bank = Bank {
            id: "bank-1".into(),
            name: "test".into(),
            description: None,
            config: BankConfig::default(),
            disposition: [3, 3, 3],
            mission: None,
            created_at: now,
            updated_at: now,
        };
        engine.create_bank(&bank).unwrap();
        let result = engine.retain("bank-1", "Alice lives in Paris.", RetainOptions::default()).await.unwrap();
        assert!(result.memories.is_empty());
    }
}
