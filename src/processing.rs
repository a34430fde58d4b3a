//! Processing orchestrator.
//!
//! A run drives one document through the three phases in order:
//!
//! ```text
//! IDLE → DOMAIN_CLASSIFICATION → KNOWLEDGE_EXTRACTION → CHUNKING → DONE
//!              │                        │                  │
//!              └────────────────────────┴──────────────────┴──▶ ERROR
//! ```
//!
//! The run executes on its own tokio task and reports progress as
//! [`ProcessingEvent`]s over a bounded channel. Each extracted item is
//! written to the staging store before its `item_extracted` event is
//! sent, so event order is persistence order.
//!
//! Dropping the receiver (see [`ProcessingRun::stop`]) only stops event
//! delivery. The run itself keeps going until it finishes or fails.
//!
//! A run never returns an error to its caller. Failures become a terminal
//! `error` (transient, document left as it was) or `fatal_error` event
//! (document marked FAILED with the message).

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::chunk::Chunker;
use crate::config::Config;
use crate::documents;
use crate::domains;
use crate::errors::{ErrorClass, ErrorClassifier, PipelineError};
use crate::extraction::{CodeContext, DomainClassifier, KnowledgeExtractor, PromptInfo, TokenSink};
use crate::knowledge;
use crate::models::{ItemType, ParseStatus, Phase, StagedPayload, TextChunk};
use crate::provider::AiProvider;
use crate::staging;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingEvent {
    PhaseStart {
        phase: Phase,
    },
    Prompt {
        phase: Phase,
        description: String,
        technical: String,
    },
    Token {
        phase: Phase,
        text: String,
    },
    ItemExtracted {
        phase: Phase,
        id: String,
        payload: StagedPayload,
    },
    PhaseComplete {
        phase: Phase,
        count: usize,
        questions_for_human: Vec<String>,
    },
    Error {
        phase: Option<Phase>,
        message: String,
    },
    FatalError {
        phase: Option<Phase>,
        message: String,
    },
    Complete {
        document_id: String,
        counts: RunCounts,
    },
}

/// Staged items per type for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounts {
    pub domain_assignments: usize,
    pub domain_suggestions: usize,
    pub rules: usize,
    pub qa_pairs: usize,
    pub uncertainties: usize,
    pub chunks: usize,
}

impl RunCounts {
    fn record(&mut self, item_type: ItemType) {
        match item_type {
            ItemType::DomainAssignment => self.domain_assignments += 1,
            ItemType::DomainSuggestion => self.domain_suggestions += 1,
            ItemType::Rule => self.rules += 1,
            ItemType::QaPair => self.qa_pairs += 1,
            ItemType::Uncertainty => self.uncertainties += 1,
            ItemType::Chunk => self.chunks += 1,
        }
    }
}

/// Event as sent to clients: `{type, phase?, data?}`.
#[derive(Debug, Clone, Serialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ProcessingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingEvent::PhaseStart { .. } => "phase_start",
            ProcessingEvent::Prompt { .. } => "prompt",
            ProcessingEvent::Token { .. } => "token",
            ProcessingEvent::ItemExtracted { .. } => "item_extracted",
            ProcessingEvent::PhaseComplete { .. } => "phase_complete",
            ProcessingEvent::Error { .. } => "error",
            ProcessingEvent::FatalError { .. } => "fatal_error",
            ProcessingEvent::Complete { .. } => "complete",
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            ProcessingEvent::PhaseStart { phase }
            | ProcessingEvent::Prompt { phase, .. }
            | ProcessingEvent::Token { phase, .. }
            | ProcessingEvent::ItemExtracted { phase, .. }
            | ProcessingEvent::PhaseComplete { phase, .. } => Some(*phase),
            ProcessingEvent::Error { phase, .. } | ProcessingEvent::FatalError { phase, .. } => {
                *phase
            }
            ProcessingEvent::Complete { .. } => None,
        }
    }

    /// Whether the event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingEvent::Complete { .. }
                | ProcessingEvent::Error { .. }
                | ProcessingEvent::FatalError { .. }
        )
    }

    pub fn to_wire(&self) -> WireEvent {
        let data = match self {
            ProcessingEvent::PhaseStart { .. } => None,
            ProcessingEvent::Prompt {
                description,
                technical,
                ..
            } => Some(serde_json::json!({
                "description": description,
                "technical": technical,
            })),
            ProcessingEvent::Token { text, .. } => Some(serde_json::json!({ "text": text })),
            ProcessingEvent::ItemExtracted { id, payload, .. } => Some(serde_json::json!({
                "id": id,
                "itemType": payload.item_type(),
                "preview": payload.preview(),
                "payload": payload.data(),
            })),
            ProcessingEvent::PhaseComplete {
                count,
                questions_for_human,
                ..
            } => {
                let mut data = serde_json::json!({ "count": count });
                if !questions_for_human.is_empty() {
                    data["questionsForHuman"] = serde_json::json!(questions_for_human);
                }
                Some(data)
            }
            ProcessingEvent::Error { message, .. } | ProcessingEvent::FatalError { message, .. } => {
                Some(serde_json::json!({ "message": message }))
            }
            ProcessingEvent::Complete {
                document_id,
                counts,
            } => Some(serde_json::json!({
                "documentId": document_id,
                "counts": counts,
            })),
        };
        WireEvent {
            kind: self.kind(),
            phase: self.phase(),
            data,
        }
    }

    /// The wire event as a single JSON line.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.to_wire()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Where a run is in the phase sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    InProgress(Phase),
    Complete(Phase),
    Done,
    Error,
}

impl RunState {
    fn start(self, phase: Phase) -> Result<RunState, PipelineError> {
        let allowed = match (self, phase) {
            (RunState::Idle, Phase::DomainClassification) => true,
            (RunState::Complete(Phase::DomainClassification), Phase::KnowledgeExtraction) => true,
            (RunState::Complete(Phase::KnowledgeExtraction), Phase::Chunking) => true,
            _ => false,
        };
        if !allowed {
            return Err(invalid_transition(self, &format!("start {}", phase)));
        }
        Ok(RunState::InProgress(phase))
    }

    fn finish(self, phase: Phase) -> Result<RunState, PipelineError> {
        if self != RunState::InProgress(phase) {
            return Err(invalid_transition(self, &format!("finish {}", phase)));
        }
        Ok(RunState::Complete(phase))
    }

    fn done(self) -> Result<RunState, PipelineError> {
        if self != RunState::Complete(Phase::Chunking) {
            return Err(invalid_transition(self, "done"));
        }
        Ok(RunState::Done)
    }

    /// The phase this state belongs to, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            RunState::InProgress(p) | RunState::Complete(p) => Some(*p),
            _ => None,
        }
    }
}

fn invalid_transition(from: RunState, to: &str) -> PipelineError {
    PipelineError::Internal(anyhow::anyhow!(
        "invalid processing transition from {:?}: {}",
        from,
        to
    ))
}

/// Sending half of a run: the event channel plus the run state.
struct Emitter {
    tx: mpsc::Sender<ProcessingEvent>,
    state: RunState,
    receiver_gone: bool,
}

impl Emitter {
    fn new(tx: mpsc::Sender<ProcessingEvent>) -> Self {
        Self {
            tx,
            state: RunState::Idle,
            receiver_gone: false,
        }
    }

    async fn emit(&mut self, event: ProcessingEvent) {
        if self.receiver_gone {
            return;
        }
        if self.tx.send(event).await.is_err() {
            self.receiver_gone = true;
            tracing::debug!("event receiver dropped, run continues without a listener");
        }
    }

    async fn begin(&mut self, phase: Phase, prompt: PromptInfo) -> Result<(), PipelineError> {
        self.state = self.state.start(phase)?;
        tracing::info!(phase = %phase, "phase started");
        self.emit(ProcessingEvent::PhaseStart { phase }).await;
        self.emit(ProcessingEvent::Prompt {
            phase,
            description: prompt.description,
            technical: prompt.technical,
        })
        .await;
        Ok(())
    }

    async fn end(
        &mut self,
        phase: Phase,
        count: usize,
        questions_for_human: Vec<String>,
    ) -> Result<(), PipelineError> {
        self.state = self.state.finish(phase)?;
        tracing::info!(phase = %phase, count, "phase complete");
        self.emit(ProcessingEvent::PhaseComplete {
            phase,
            count,
            questions_for_human,
        })
        .await;
        Ok(())
    }
}

/// Forwards adapter tokens as `token` events of one phase.
struct PhaseTokens<'e> {
    emitter: &'e mut Emitter,
    phase: Phase,
}

#[async_trait]
impl TokenSink for PhaseTokens<'_> {
    async fn token(&mut self, text: &str) {
        let event = ProcessingEvent::Token {
            phase: self.phase,
            text: text.to_string(),
        };
        self.emitter.emit(event).await;
    }
}

/// Receiving half of a run.
pub struct ProcessingRun {
    events: mpsc::Receiver<ProcessingEvent>,
    task: JoinHandle<()>,
}

impl ProcessingRun {
    pub async fn next_event(&mut self) -> Option<ProcessingEvent> {
        self.events.recv().await
    }

    /// Stop listening. The returned handle resolves when the run itself ends.
    pub fn stop(self) -> JoinHandle<()> {
        drop(self.events);
        self.task
    }

    pub fn into_stream(self) -> ReceiverStream<ProcessingEvent> {
        ReceiverStream::new(self.events)
    }

    /// Drain every event until the run ends.
    pub async fn collect(mut self) -> Vec<ProcessingEvent> {
        let mut all = Vec::new();
        while let Some(event) = self.events.recv().await {
            all.push(event);
        }
        all
    }
}

#[derive(Clone)]
pub struct Processor {
    pool: SqlitePool,
    provider: Arc<dyn AiProvider>,
    config: Arc<Config>,
    classifier: ErrorClassifier,
}

impl Processor {
    pub fn new(pool: SqlitePool, provider: Arc<dyn AiProvider>, config: Arc<Config>) -> Self {
        let classifier = ErrorClassifier::new(&config.errors);
        Self {
            pool,
            provider,
            config,
            classifier,
        }
    }

    /// Start a run for `document_id` on a background task.
    pub fn start(&self, document_id: &str) -> ProcessingRun {
        let (tx, rx) = mpsc::channel(self.config.extraction.channel_capacity);
        let processor = self.clone();
        let document_id = document_id.to_string();
        let task = tokio::spawn(async move {
            processor.run(&document_id, tx).await;
        });
        ProcessingRun { events: rx, task }
    }

    /// Run all phases for a document, reporting through `tx`.
    pub async fn run(&self, document_id: &str, tx: mpsc::Sender<ProcessingEvent>) {
        let mut out = Emitter::new(tx);
        let previous = documents::get_document(&self.pool, document_id)
            .await
            .ok()
            .map(|d| (d.parse_status, d.parse_error));

        match self.run_phases(document_id, &mut out).await {
            Ok(counts) => {
                tracing::info!(document_id, ?counts, "processing complete");
                out.emit(ProcessingEvent::Complete {
                    document_id: document_id.to_string(),
                    counts,
                })
                .await;
            }
            Err(err) => {
                let phase = out.state.phase();
                out.state = RunState::Error;
                let message = err.to_string();
                match self.classifier.classify(&err) {
                    ErrorClass::Fatal => {
                        tracing::error!(document_id, ?phase, error = %message, "fatal processing error");
                        if let Err(e) = documents::set_status(
                            &self.pool,
                            document_id,
                            ParseStatus::Failed,
                            Some(&message),
                        )
                        .await
                        {
                            tracing::error!(document_id, error = %e, "could not mark document failed");
                        }
                        out.emit(ProcessingEvent::FatalError { phase, message }).await;
                    }
                    ErrorClass::Transient => {
                        tracing::warn!(document_id, ?phase, error = %message, "processing error");
                        if let Some((status, error)) = previous {
                            if let Err(e) = documents::set_status(
                                &self.pool,
                                document_id,
                                status,
                                error.as_deref(),
                            )
                            .await
                            {
                                tracing::warn!(document_id, error = %e, "could not restore document status");
                            }
                        }
                        out.emit(ProcessingEvent::Error { phase, message }).await;
                    }
                }
            }
        }
    }

    async fn run_phases(
        &self,
        document_id: &str,
        out: &mut Emitter,
    ) -> Result<RunCounts, PipelineError> {
        let document = documents::get_document(&self.pool, document_id).await?;
        let cleared = staging::clear_all(&self.pool, document_id).await?;
        if cleared > 0 {
            tracing::info!(document_id, cleared, "cleared staged items from previous run");
        }
        documents::mark_processing(&self.pool, document_id).await?;

        let text = document.raw_text.as_str();
        let blank = text.trim().is_empty();
        let provider = self.provider.as_ref();
        let raw_prefix = self.config.extraction.raw_prefix_chars;
        let mut counts = RunCounts::default();

        // Phase 1: domains
        let phase = Phase::DomainClassification;
        let known = domains::list_domains(&self.pool).await?;
        let classifier = DomainClassifier::new(provider, raw_prefix);
        out.begin(phase, classifier.prompt(text, &known)).await?;
        let classification = if blank {
            Default::default()
        } else {
            let mut sink = PhaseTokens {
                emitter: &mut *out,
                phase,
            };
            classifier.classify(text, &known, &mut sink).await?
        };
        let mut staged = 0;
        for item in &classification.document_domains {
            self.stage(document_id, StagedPayload::DomainAssignment(item.clone()), out, &mut counts)
                .await?;
            staged += 1;
        }
        for item in &classification.new_domain_suggestions {
            self.stage(document_id, StagedPayload::DomainSuggestion(item.clone()), out, &mut counts)
                .await?;
            staged += 1;
        }
        out.end(phase, staged, classification.questions_for_human.clone())
            .await?;

        // Phase 2: knowledge
        let phase = Phase::KnowledgeExtraction;
        let slugs = classification.assigned_slugs();
        let codes = CodeContext::from_used(knowledge::all_rule_codes(&self.pool).await?);
        let extractor = KnowledgeExtractor::new(provider, &self.config.extraction);
        out.begin(phase, extractor.prompt(text, &codes, &slugs)).await?;
        let extraction = if blank {
            Default::default()
        } else {
            let mut sink = PhaseTokens {
                emitter: &mut *out,
                phase,
            };
            extractor.extract(text, codes, &slugs, &mut sink).await?
        };
        let items = extraction
            .rules
            .into_iter()
            .map(StagedPayload::Rule)
            .chain(extraction.qa_pairs.into_iter().map(StagedPayload::QaPair))
            .chain(extraction.uncertainties.into_iter().map(StagedPayload::Uncertainty));
        let mut staged = 0;
        for payload in items {
            self.stage(document_id, payload, out, &mut counts).await?;
            staged += 1;
        }
        out.end(phase, staged, Vec::new()).await?;

        // Phase 3: chunks
        let phase = Phase::Chunking;
        let chunker = Chunker::new(&self.config.chunking);
        let prompt = PromptInfo {
            description: "Делим текст на перекрывающиеся фрагменты для поиска. Модель не используется.".to_string(),
            technical: format!(
                "chunk_size={} overlap={} min_chunk_chars={} search_window={}",
                self.config.chunking.chunk_size,
                self.config.chunking.overlap,
                self.config.chunking.min_chunk_chars,
                self.config.chunking.search_window
            ),
        };
        out.begin(phase, prompt).await?;
        let mut chunks = chunker.split(text);
        if chunks.is_empty() && !blank {
            // Short but non-empty documents are kept as one chunk.
            chunks.push(TextChunk {
                content: text.trim().to_string(),
                index: 0,
                start_char: 0,
                end_char: text.chars().count(),
            });
        }
        let staged = chunks.len();
        for chunk in chunks {
            self.stage(document_id, StagedPayload::Chunk(chunk), out, &mut counts)
                .await?;
        }
        out.end(phase, staged, Vec::new()).await?;

        out.state = out.state.done()?;
        Ok(counts)
    }

    async fn stage(
        &self,
        document_id: &str,
        payload: StagedPayload,
        out: &mut Emitter,
        counts: &mut RunCounts,
    ) -> Result<(), PipelineError> {
        let id = staging::append(&self.pool, document_id, &payload).await?;
        counts.record(payload.item_type());
        out.emit(ProcessingEvent::ItemExtracted {
            phase: payload.phase(),
            id,
            payload,
        })
        .await;
        Ok(())
    }
}
