//! Session lifecycle and the public entry point of the engine.
//!
//! [`SessionRegistry`] owns the per-session concurrency state (through the
//! [`RequestSerializer`]) and wires the processor, context manager, tool
//! invoker and collaborators together. Callers never touch the maps
//! directly; every mutation goes through the operations below.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use colloquy_core::events::BusEvent;
use colloquy_core::ids::{MessageId, SessionId};
use colloquy_core::message::{ChatInput, MessageWithParts, Part};
use colloquy_core::permission::PermissionPolicy;
use colloquy_core::provider::ModelBackend;
use colloquy_core::session::{RevertPointer, SessionInfo, ShareRef};
use colloquy_core::snapshot::SnapshotCoordinator;
use colloquy_core::tools::Tool;
use colloquy_store::Store;

use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::context::ContextManager;
use crate::error::EngineError;
use crate::invoker::ToolInvoker;
use crate::journal::Journal;
use crate::permission::AllowAll;
use crate::processor::GenerationProcessor;
use crate::registry::ToolRegistry;
use crate::serializer::{Admission, GenerationPhase, ReplyHandle, RequestSerializer};
use crate::share::{NoShare, ShareService};
use crate::snapshot::NoSnapshots;

/// Observable lifecycle state. `Deleted` sessions are simply gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Persisted, no messages yet.
    Created,
    Idle,
    Generating(GenerationPhase),
}

pub struct EngineBuilder {
    store: Store,
    backend: Arc<dyn ModelBackend>,
    title_backend: Option<Arc<dyn ModelBackend>>,
    tools: ToolRegistry,
    permission: Arc<dyn PermissionPolicy>,
    snapshots: Arc<dyn SnapshotCoordinator>,
    share: Arc<dyn ShareService>,
    bus: EventBus,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Small model used for session titles. Defaults to the main backend.
    pub fn title_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.title_backend = Some(backend);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn permission(mut self, policy: Arc<dyn PermissionPolicy>) -> Self {
        self.permission = policy;
        self
    }

    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotCoordinator>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn share(mut self, share: Arc<dyn ShareService>) -> Self {
        self.share = share;
        self
    }

    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<SessionRegistry> {
        let journal = Journal::new(self.store, self.bus);
        let serializer = Arc::new(RequestSerializer::new());
        let invoker = Arc::new(
            ToolInvoker::new(Arc::new(self.tools), self.permission, self.snapshots.clone())
                .with_timeout(self.config.tool_timeout),
        );
        let context = Arc::new(ContextManager::new(
            journal.clone(),
            self.backend.clone(),
            self.config.context.clone(),
        ));
        let title_backend = self.title_backend.unwrap_or_else(|| self.backend.clone());
        let processor = Arc::new(GenerationProcessor::new(
            self.backend,
            title_backend,
            invoker,
            context.clone(),
            journal.clone(),
            serializer.clone(),
            self.config.generation.clone(),
        ));
        Arc::new(SessionRegistry {
            journal,
            serializer,
            processor,
            context,
            snapshots: self.snapshots,
            share: self.share,
            config: self.config,
        })
    }
}

pub struct SessionRegistry {
    journal: Journal,
    serializer: Arc<RequestSerializer>,
    processor: Arc<GenerationProcessor>,
    context: Arc<ContextManager>,
    snapshots: Arc<dyn SnapshotCoordinator>,
    share: Arc<dyn ShareService>,
    config: EngineConfig,
}

impl SessionRegistry {
    pub fn builder(store: Store, backend: Arc<dyn ModelBackend>) -> EngineBuilder {
        EngineBuilder {
            store,
            backend,
            title_backend: None,
            tools: ToolRegistry::new(),
            permission: Arc::new(AllowAll),
            snapshots: Arc::new(NoSnapshots),
            share: Arc::new(NoShare),
            bus: EventBus::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        self.journal.bus()
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    #[instrument(skip_all, fields(parent_id = ?parent_id))]
    pub async fn create(&self, parent_id: Option<SessionId>) -> Result<SessionInfo, EngineError> {
        if let Some(parent) = &parent_id {
            let _ = self.get(parent)?;
        }
        let mut info = SessionInfo::new(parent_id);
        if self.config.auto_share && !info.is_child() {
            match self.share.share(&info.id).await {
                Ok(share) => info.share = Some(share),
                Err(e) => warn!(session_id = %info.id, error = %e, "auto-share failed"),
            }
        }
        self.journal.save_session(&info)?;
        info!(session_id = %info.id, "session created");
        Ok(info)
    }

    pub fn get(&self, session_id: &SessionId) -> Result<SessionInfo, EngineError> {
        self.journal
            .sessions()
            .get(session_id)
            .map_err(|e| EngineError::session_lookup(session_id, e))
    }

    /// All sessions, newest first.
    pub fn list(&self) -> Result<Vec<SessionInfo>, EngineError> {
        let mut sessions = self.journal.sessions().list()?;
        sessions.reverse();
        Ok(sessions)
    }

    pub fn children(&self, session_id: &SessionId) -> Result<Vec<SessionInfo>, EngineError> {
        Ok(self.journal.sessions().children(session_id)?)
    }

    pub fn messages(&self, session_id: &SessionId) -> Result<Vec<MessageWithParts>, EngineError> {
        let _ = self.get(session_id)?;
        Ok(self.journal.messages().load(session_id)?)
    }

    pub fn set_title(&self, session_id: &SessionId, title: &str) -> Result<SessionInfo, EngineError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(EngineError::Validation("title must not be empty".into()));
        }
        let mut info = self.get(session_id)?;
        info.title = title.to_string();
        info.touch();
        self.journal.save_session(&info)?;
        Ok(info)
    }

    pub fn state(&self, session_id: &SessionId) -> Result<SessionState, EngineError> {
        let _ = self.get(session_id)?;
        if let Some(phase) = self.serializer.phase(session_id) {
            return Ok(SessionState::Generating(phase));
        }
        if self.journal.messages().list_infos(session_id)?.is_empty() {
            Ok(SessionState::Created)
        } else {
            Ok(SessionState::Idle)
        }
    }

    /// Queued requests not yet merged into a generation.
    pub fn pending(&self, session_id: &SessionId) -> usize {
        self.serializer.pending(session_id)
    }

    /// Start a generation, or queue behind the running one. Validation
    /// failures are returned before any permit is taken.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn submit(&self, session_id: &SessionId, input: ChatInput) -> Result<ReplyHandle, EngineError> {
        input.validate().map_err(EngineError::Validation)?;
        let _ = self.get(session_id)?;

        let Some((admission, handle)) = self.serializer.admit(session_id, input) else {
            // Closed by `remove`; the session is already on its way out.
            return Err(EngineError::SessionNotFound(session_id.clone()));
        };
        if let Admission::Granted { permit, input } = admission {
            debug!("permit granted");
            let _ = tokio::spawn(self.processor.clone().drive(permit, input));
        }
        Ok(handle)
    }

    /// Submit and wait for the generation the input lands in.
    pub async fn chat(&self, session_id: &SessionId, input: ChatInput) -> Result<MessageWithParts, EngineError> {
        let handle = self.submit(session_id, input).await?;
        Ok(handle.await?)
    }

    /// Cancel the running generation. Returns false when the session is idle.
    pub fn abort(&self, session_id: &SessionId) -> bool {
        self.serializer.abort(session_id)
    }

    /// Remove a session and all of its descendants. Descendants go first and
    /// silently; one `session.deleted` event is published for `session_id`.
    /// Cleanup failures are logged and skipped.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn remove(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let root = self.get(session_id)?;

        let mut order = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(info) = stack.pop() {
            match self.journal.sessions().children(&info.id) {
                Ok(children) => stack.extend(children),
                Err(e) => warn!(session_id = %info.id, error = %e, "listing children failed"),
            }
            order.push(info);
        }

        for info in &order {
            self.serializer.close(&info.id);
            let _ = self.serializer.abort(&info.id);
        }
        for info in order.iter().rev() {
            if !self.serializer.wait_idle(&info.id, self.config.shutdown_grace).await {
                warn!(session_id = %info.id, "generation still running after abort");
            }
            if info.share.is_some() {
                if let Err(e) = self.share.unshare(&info.id).await {
                    warn!(session_id = %info.id, error = %e, "unshare failed");
                }
            }
            self.purge(&info.id);
        }

        let _ = self.bus().publish(BusEvent::SessionDeleted { info: root });
        info!(removed = order.len(), "session removed");
        Ok(())
    }

    fn purge(&self, session_id: &SessionId) {
        match self.journal.messages().list_infos(session_id) {
            Ok(infos) => {
                for info in infos {
                    if let Err(e) = self.journal.messages().remove(session_id, &info.id) {
                        warn!(session_id = %session_id, message_id = %info.id, error = %e, "message cleanup failed");
                    }
                }
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "listing messages failed"),
        }
        if let Err(e) = self.journal.sessions().remove(session_id) {
            warn!(session_id = %session_id, error = %e, "session cleanup failed");
        }
    }

    /// Undo back to `message_id` at `part_index`. The working tree is
    /// restored to the checkpoint at the boundary right away; history is
    /// trimmed when the next chat starts.
    #[instrument(skip_all, fields(session_id = %session_id, message_id = %message_id))]
    pub async fn revert(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        part_index: usize,
    ) -> Result<SessionInfo, EngineError> {
        if self.serializer.is_busy(session_id) {
            return Err(EngineError::Busy(session_id.clone()));
        }
        let mut session = self.get(session_id)?;
        let messages = self.journal.messages().load(session_id)?;
        let Some(index) = messages.iter().position(|m| &m.info.id == message_id) else {
            return Err(EngineError::MessageNotFound(message_id.clone()));
        };

        let boundary = messages[index..]
            .iter()
            .enumerate()
            .flat_map(|(n, m)| m.parts.iter().skip(if n == 0 { part_index } else { 0 }))
            .find_map(Part::snapshot)
            .cloned();

        // Keep the original pre-revert state when reverting twice.
        let mut pointer = RevertPointer {
            message_id: message_id.clone(),
            part_index,
            snapshot: session.revert.take().and_then(|r| r.snapshot),
            diff: None,
        };
        if let Some(target) = boundary {
            if pointer.snapshot.is_none() {
                pointer.snapshot = match self.snapshots.create(session_id).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(error = %e, "pre-revert snapshot failed, unrevert will not restore files");
                        None
                    }
                };
            }
            match self.snapshots.diff(session_id, &target).await {
                Ok(patch) => pointer.diff = Some(patch),
                Err(e) => warn!(error = %e, "revert diff failed"),
            }
            self.snapshots.restore(session_id, &target).await?;
        }

        session.revert = Some(pointer);
        session.touch();
        self.journal.save_session(&session)?;
        Ok(session)
    }

    /// Cancel a pending revert, restoring the working tree captured before it.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn unrevert(&self, session_id: &SessionId) -> Result<SessionInfo, EngineError> {
        if self.serializer.is_busy(session_id) {
            return Err(EngineError::Busy(session_id.clone()));
        }
        let mut session = self.get(session_id)?;
        let Some(pointer) = session.revert.take() else {
            return Ok(session);
        };
        if let Some(snapshot) = &pointer.snapshot {
            self.snapshots.restore(session_id, snapshot).await?;
        }
        session.touch();
        self.journal.save_session(&session)?;
        Ok(session)
    }

    pub async fn share(&self, session_id: &SessionId) -> Result<ShareRef, EngineError> {
        let mut session = self.get(session_id)?;
        let share = self.share.share(session_id).await?;
        session.share = Some(share.clone());
        session.touch();
        self.journal.save_session(&session)?;
        Ok(share)
    }

    pub async fn unshare(&self, session_id: &SessionId) -> Result<SessionInfo, EngineError> {
        let mut session = self.get(session_id)?;
        self.share.unshare(session_id).await?;
        session.share = None;
        session.touch();
        self.journal.save_session(&session)?;
        Ok(session)
    }

    /// Abort every running generation.
    pub fn shutdown(&self) {
        self.serializer.abort_all();
    }
}
