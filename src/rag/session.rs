use crate::{
    engine::RetrievalEngine,
    error::Result,
    rag::{
        history::ChatHistory,
        prompt::{Persona, build_system_prompt},
        provider::{CompletionProvider, RetryPolicy, SamplingParams},
    },
    search::{DEFAULT_K, SearchParams},
};

/// Retrieval-augmented question answering over one index.
pub struct RagSession {
    engine: RetrievalEngine,
    provider: Box<dyn CompletionProvider>,
    persona: Persona,
    retry: RetryPolicy,
    sampling: SamplingParams,
    history: ChatHistory,
    k: usize,
}

impl RagSession {
    pub fn new(
        engine: RetrievalEngine,
        provider: Box<dyn CompletionProvider>,
        history: ChatHistory,
    ) -> Self {
        Self {
            engine,
            provider,
            persona: Persona::default(),
            retry: RetryPolicy::default(),
            sampling: SamplingParams::default(),
            history,
            k: DEFAULT_K,
        }
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.persona = persona;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Documents retrieved per question.
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn engine(&self) -> &RetrievalEngine {
        &self.engine
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    /// Answer `query` from the best ranked chunks and record the exchange.
    pub async fn ask(&mut self, query: &str) -> Result<String> {
        let results = self.engine.search_and_rank(&SearchParams::new(query, self.k))?;
        let chunks: Vec<&str> = results.iter().map(|r| r.chunk.as_str()).collect();
        let system = build_system_prompt(&self.persona, &chunks, query);
        tracing::debug!(chunks = chunks.len(), provider = self.provider.name(), "generating answer");

        let provider = self.provider.as_ref();
        let sampling = &self.sampling;
        let system = system.as_str();
        let answer = self
            .retry
            .run(move || provider.generate(system, query, sampling))
            .await?;

        self.history.record_exchange(query, &answer)?;
        Ok(answer)
    }
}
