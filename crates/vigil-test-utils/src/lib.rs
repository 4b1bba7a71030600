//! Stub capabilities and fixtures shared by Vigil's tests.
//!
//! Every stub is `Clone` and shares its counters between clones, so a test can
//! register one copy with an executor and keep another to inspect afterwards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tempfile::TempDir;

use vigil_core::error::{AnalyzerError, StoreError, ToolError};
use vigil_core::state::ConversationState;
use vigil_core::traits::{Analyzer, Router, StateStore, Tool};
use vigil_core::types::{
    AnalyzerOutput, ConversationId, Decision, PromptContext, Proposal, StructuredResult, ToolCall,
    ToolOutcome,
};
use vigil_memory::{MemoryStore, SqliteStore};

/// Shared invocation log of a stub.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<AtomicUsize>,
    contexts: Arc<Mutex<Vec<PromptContext>>>,
}

impl CallLog {
    fn record(&self, ctx: &PromptContext) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(ctx.clone());
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The context of every invocation, in order.
    pub fn contexts(&self) -> Vec<PromptContext> {
        self.contexts.lock().unwrap().clone()
    }
}

/// Sleep for `delay`, or fail with `Cancelled` if the run is torn down first.
async fn wait(ctx: &PromptContext, delay: Option<Duration>) -> Result<(), AnalyzerError> {
    let Some(delay) = delay else {
        return Ok(());
    };
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(AnalyzerError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Analyzer returning the same output every time.
#[derive(Clone)]
pub struct FixedAnalyzer {
    name: String,
    output: AnalyzerOutput,
    delay: Option<Duration>,
    log: CallLog,
}

impl FixedAnalyzer {
    /// Scores `score` with a canned justification.
    pub fn new(name: &str, score: f64) -> Self {
        Self::with_output(
            name,
            AnalyzerOutput::Scored(StructuredResult::new(score, format!("{} fixed", name))),
        )
    }

    pub fn with_output(name: &str, output: AnalyzerOutput) -> Self {
        Self {
            name: name.to_string(),
            output,
            delay: None,
            log: CallLog::default(),
        }
    }

    /// Respond only after `delay` (cancellable).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }

    pub fn calls(&self) -> usize {
        self.log.calls()
    }
}

impl Analyzer for FixedAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: PromptContext) -> BoxFuture<'_, Result<AnalyzerOutput, AnalyzerError>> {
        Box::pin(async move {
            self.log.record(&ctx);
            wait(&ctx, self.delay).await?;
            Ok(self.output.clone())
        })
    }
}

/// Analyzer that always fails with the given error.
#[derive(Clone)]
pub struct FailingAnalyzer {
    name: String,
    error: AnalyzerError,
    delay: Option<Duration>,
    log: CallLog,
}

impl FailingAnalyzer {
    pub fn new(name: &str, error: AnalyzerError) -> Self {
        Self {
            name: name.to_string(),
            error,
            delay: None,
            log: CallLog::default(),
        }
    }

    /// Fail only after `delay` (cancellable).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.log.calls()
    }
}

impl Analyzer for FailingAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: PromptContext) -> BoxFuture<'_, Result<AnalyzerOutput, AnalyzerError>> {
        Box::pin(async move {
            self.log.record(&ctx);
            wait(&ctx, self.delay).await?;
            Err(self.error.clone())
        })
    }
}

/// Analyzer that never answers unless cancelled.
#[derive(Clone)]
pub struct HangingAnalyzer {
    name: String,
    log: CallLog,
}

impl HangingAnalyzer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            log: CallLog::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.log.calls()
    }
}

impl Analyzer for HangingAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: PromptContext) -> BoxFuture<'_, Result<AnalyzerOutput, AnalyzerError>> {
        Box::pin(async move {
            self.log.record(&ctx);
            ctx.cancel.cancelled().await;
            Err(AnalyzerError::Cancelled)
        })
    }
}

/// Proposing analyzer that plays back a script. Once the script runs out it
/// keeps repeating the fallback proposal. Tool call ids are fresh per turn.
#[derive(Clone)]
pub struct ScriptedAnalyst {
    name: String,
    script: Arc<Mutex<VecDeque<Proposal>>>,
    fallback: Proposal,
    log: CallLog,
}

impl ScriptedAnalyst {
    pub fn new(name: &str, script: Vec<Proposal>, fallback: Proposal) -> Self {
        Self {
            name: name.to_string(),
            script: Arc::new(Mutex::new(script.into())),
            fallback,
            log: CallLog::default(),
        }
    }

    /// An analyst that requests `tool` with `args` on every turn.
    pub fn always_requesting(name: &str, tool: &str, args: serde_json::Value) -> Self {
        let proposal =
            Proposal::text(format!("calling {}", tool)).with_call(ToolCall::from_json(tool, args));
        Self::new(name, vec![], proposal)
    }

    pub fn calls(&self) -> usize {
        self.log.calls()
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }
}

impl Analyzer for ScriptedAnalyst {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: PromptContext) -> BoxFuture<'_, Result<AnalyzerOutput, AnalyzerError>> {
        Box::pin(async move {
            self.log.record(&ctx);
            let turn = self.log.calls();
            let mut proposal = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            for (i, call) in proposal.tool_calls.iter_mut().enumerate() {
                call.id = format!("{}-{}-{}", self.name, turn, i);
            }
            Ok(AnalyzerOutput::Proposal(proposal))
        })
    }
}

/// Router that always returns the same decision.
#[derive(Clone)]
pub struct FixedRouter {
    name: String,
    decision: String,
    log: CallLog,
}

impl FixedRouter {
    pub fn new(name: &str, decision: &str) -> Self {
        Self {
            name: name.to_string(),
            decision: decision.to_string(),
            log: CallLog::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.log.calls()
    }
}

impl Router for FixedRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn decide(&self, ctx: PromptContext) -> BoxFuture<'_, Result<Decision, AnalyzerError>> {
        Box::pin(async move {
            self.log.record(&ctx);
            Ok(Decision::new(self.decision.clone()))
        })
    }
}

/// Tool that records its arguments and answers with a fixed response.
#[derive(Clone)]
pub struct RecordingTool {
    name: String,
    response: Result<String, String>,
    invocations: Arc<Mutex<Vec<serde_json::Map<String, serde_json::Value>>>>,
}

impl RecordingTool {
    /// Succeeds with `"<name> ok"`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            response: Ok(format!("{} ok", name)),
            invocations: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Fails every call with `message`.
    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            response: Err(message.to_string()),
            ..Self::new(name)
        }
    }

    pub fn invocations(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Records its arguments."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn execute(
        &self,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<ToolOutcome, ToolError>> {
        Box::pin(async move {
            self.invocations.lock().unwrap().push(args);
            match &self.response {
                Ok(text) => Ok(ToolOutcome::text(text.clone())),
                Err(message) => Err(ToolError::CallFailed {
                    tool: self.name.clone(),
                    message: message.clone(),
                }),
            }
        })
    }
}

/// In-memory store that counts saves and can be told to fail them.
#[derive(Clone, Default)]
pub struct RecordingStore {
    inner: Arc<MemoryStore>,
    saves: Arc<AtomicUsize>,
    save_error: Option<String>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `save` fails with a backend error carrying `message`.
    pub fn failing_saves(message: &str) -> Self {
        Self {
            save_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Number of save attempts, failed ones included.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl StateStore for RecordingStore {
    fn load(&self, id: &ConversationId) -> BoxFuture<'_, Result<ConversationState, StoreError>> {
        self.inner.load(id)
    }

    fn save(
        &self,
        id: &ConversationId,
        state: &ConversationState,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        match &self.save_error {
            Some(message) => {
                let err = StoreError::Backend(message.clone());
                Box::pin(async move { Err(err) })
            }
            None => self.inner.save(id, state),
        }
    }
}

/// A SQLite store in a fresh temporary directory. Keep the `TempDir` alive
/// for as long as the store is used.
pub fn temp_store() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("state.db")).unwrap();
    (dir, store)
}
