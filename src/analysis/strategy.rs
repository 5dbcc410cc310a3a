use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::prompt::build_prompt;
use super::{parse_analysis, AnalysisMode, AnalysisResult};
use crate::config::{AdvisorConfig, TimeoutConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::inference::InferenceGateway;
use crate::retrieval::{RetrievalEngine, RetrievedContext};

/// Progress sink for one running job.
///
/// An `Err` from either method means the job is no longer ours to work on
/// and the analysis must stop.
pub trait StepObserver: Send + Sync {
    fn step(&self, label: &str, progress: u8) -> Result<()>;

    /// Called right before the inference call; the job enters `processing`.
    fn inference_started(&self, label: &str, progress: u8) -> Result<()>;
}

pub struct AnalysisInput {
    pub job_id: String,
    pub advisor: AdvisorConfig,
    pub image: Arc<Vec<u8>>,
}

/// Everything needed for the inference call.
pub struct PreparedAnalysis {
    pub prompt: String,
    pub model_override: Option<String>,
    pub context: Option<RetrievedContext>,
}

pub struct AnalysisOutcome {
    pub result: AnalysisResult,
    /// `None` unless retrieval ran.
    pub retrieved_profile_ids: Option<Vec<i64>>,
}

#[async_trait]
pub trait AnalysisStrategy: Send + Sync {
    fn mode(&self) -> AnalysisMode;

    async fn prepare(
        &self,
        input: &AnalysisInput,
        observer: &dyn StepObserver,
    ) -> Result<PreparedAnalysis>;
}

/// One plain call: persona prompt, base model.
pub struct BaselineStrategy;

#[async_trait]
impl AnalysisStrategy for BaselineStrategy {
    fn mode(&self) -> AnalysisMode {
        AnalysisMode::Baseline
    }

    async fn prepare(
        &self,
        input: &AnalysisInput,
        observer: &dyn StepObserver,
    ) -> Result<PreparedAnalysis> {
        observer.step("building prompt", 45)?;
        Ok(PreparedAnalysis {
            prompt: build_prompt(&input.advisor, None),
            model_override: None,
            context: None,
        })
    }
}

/// Persona prompt sent to the advisor's fine-tuned model.
pub struct AdapterStrategy {
    db: Arc<Database>,
}

impl AdapterStrategy {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn adapter_model(&self, advisor_id: &str) -> Result<String> {
        self.db
            .adapter_model(advisor_id)?
            .ok_or_else(|| Error::AdapterUnavailable(advisor_id.to_string()))
    }
}

#[async_trait]
impl AnalysisStrategy for AdapterStrategy {
    fn mode(&self) -> AnalysisMode {
        AnalysisMode::Adapter
    }

    async fn prepare(
        &self,
        input: &AnalysisInput,
        observer: &dyn StepObserver,
    ) -> Result<PreparedAnalysis> {
        let model = self.adapter_model(&input.advisor.id)?;
        observer.step("building prompt", 45)?;
        Ok(PreparedAnalysis {
            prompt: build_prompt(&input.advisor, None),
            model_override: Some(model),
            context: None,
        })
    }
}

/// Retrieve references first and put them in the prompt.
pub struct RagStrategy {
    retrieval: Arc<RetrievalEngine>,
}

impl RagStrategy {
    pub fn new(retrieval: Arc<RetrievalEngine>) -> Self {
        Self { retrieval }
    }
}

#[async_trait]
impl AnalysisStrategy for RagStrategy {
    fn mode(&self) -> AnalysisMode {
        AnalysisMode::Rag
    }

    async fn prepare(
        &self,
        input: &AnalysisInput,
        observer: &dyn StepObserver,
    ) -> Result<PreparedAnalysis> {
        observer.step("retrieving references", 35)?;
        let context = self
            .retrieval
            .retrieve(&input.advisor.id, Arc::clone(&input.image))
            .await?;
        if context.is_empty() {
            info!(
                job_id = %input.job_id,
                advisor = %input.advisor.id,
                "No reference material indexed; continuing without context"
            );
        }

        observer.step("building prompt", 45)?;
        let rendered = context.render(self.retrieval.config().context_passages);
        Ok(PreparedAnalysis {
            prompt: build_prompt(&input.advisor, Some(&rendered)),
            model_override: None,
            context: Some(context),
        })
    }
}

/// Retrieval context sent to the fine-tuned model.
pub struct RagAdapterStrategy {
    rag: RagStrategy,
    adapter: AdapterStrategy,
}

impl RagAdapterStrategy {
    pub fn new(retrieval: Arc<RetrievalEngine>, db: Arc<Database>) -> Self {
        Self {
            rag: RagStrategy::new(retrieval),
            adapter: AdapterStrategy::new(db),
        }
    }
}

#[async_trait]
impl AnalysisStrategy for RagAdapterStrategy {
    fn mode(&self) -> AnalysisMode {
        AnalysisMode::RagAdapter
    }

    async fn prepare(
        &self,
        input: &AnalysisInput,
        observer: &dyn StepObserver,
    ) -> Result<PreparedAnalysis> {
        let model = self.adapter.adapter_model(&input.advisor.id)?;
        let mut prepared = self.rag.prepare(input, observer).await?;
        prepared.model_override = Some(model);
        Ok(prepared)
    }
}

/// Maps a mode to its strategy and drives one analysis end to end.
pub struct StrategyDispatcher {
    gateway: InferenceGateway,
    retrieval: Arc<RetrievalEngine>,
    timeouts: TimeoutConfig,
    baseline: BaselineStrategy,
    adapter: AdapterStrategy,
    rag: RagStrategy,
    rag_adapter: RagAdapterStrategy,
}

impl StrategyDispatcher {
    pub fn new(
        gateway: InferenceGateway,
        retrieval: Arc<RetrievalEngine>,
        db: Arc<Database>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            gateway,
            baseline: BaselineStrategy,
            adapter: AdapterStrategy::new(Arc::clone(&db)),
            rag: RagStrategy::new(Arc::clone(&retrieval)),
            rag_adapter: RagAdapterStrategy::new(Arc::clone(&retrieval), db),
            retrieval,
            timeouts,
        }
    }

    pub fn strategy(&self, mode: AnalysisMode) -> &dyn AnalysisStrategy {
        match mode {
            AnalysisMode::Baseline => &self.baseline,
            AnalysisMode::Adapter => &self.adapter,
            AnalysisMode::Rag => &self.rag,
            AnalysisMode::RagAdapter => &self.rag_adapter,
        }
    }

    pub fn gateway(&self) -> &InferenceGateway {
        &self.gateway
    }

    pub async fn analyze(
        &self,
        mode: AnalysisMode,
        input: AnalysisInput,
        observer: &dyn StepObserver,
    ) -> Result<AnalysisOutcome> {
        let strategy = self.strategy(mode);
        let prepared = strategy.prepare(&input, observer).await?;
        let timeout = self.timeouts.for_mode(strategy.mode());

        observer.inference_started("awaiting inference", 50)?;
        debug!(job_id = %input.job_id, mode = %mode, ?timeout, "Calling inference engine");
        let raw = self
            .gateway
            .analyze(&input.image, prepared.prompt, prepared.model_override, timeout)
            .await?;

        observer.step("parsing result", 85)?;
        let mut result = parse_analysis(&raw)?;

        let retrieved_profile_ids = match prepared.context {
            Some(context) => {
                observer.step("selecting citations", 90)?;
                let selections = self.retrieval.select_citations(&result, &context);
                self.retrieval.apply_citations(&mut result, &selections)?;
                Some(context.profile_ids())
            }
            None => None,
        };

        Ok(AnalysisOutcome {
            result,
            retrieved_profile_ids,
        })
    }
}
