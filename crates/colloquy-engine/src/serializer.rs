//! Per-session mutual exclusion with a FIFO queue for input that arrives
//! while a generation is running.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use colloquy_core::ids::SessionId;
use colloquy_core::message::ChatInput;

use crate::error::{ChatError, ChatResult};

/// Exclusivity token of the single in-flight generation of a session.
#[derive(Clone, Debug)]
pub struct GenerationPermit {
    pub session_id: SessionId,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl GenerationPermit {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationPhase {
    Streaming,
    AwaitingTool,
    Summarizing,
}

pub enum Admission {
    /// The caller holds the permit and must drive the generation.
    Granted { permit: GenerationPermit, input: ChatInput },
    Queued,
}

struct QueuedRequest {
    /// Taken once the request is merged into a generation.
    input: Option<ChatInput>,
    reply: oneshot::Sender<ChatResult>,
}

impl QueuedRequest {
    fn processed(&self) -> bool {
        self.input.is_none()
    }
}

struct Slot {
    permit: GenerationPermit,
    phase: GenerationPhase,
    queue: VecDeque<QueuedRequest>,
}

#[derive(Default)]
pub struct RequestSerializer {
    slots: DashMap<SessionId, Slot>,
    closed: DashSet<SessionId>,
    released: Notify,
}

/// Callers answered by a finished generation, plus the queued input that
/// takes over the permit, if any.
#[derive(Default)]
pub struct Release {
    waiters: Vec<oneshot::Sender<ChatResult>>,
    next: Option<(GenerationPermit, ChatInput)>,
}

impl Release {
    /// Deliver `result` to every merged caller and hand back the next generation.
    pub fn resolve(self, result: &ChatResult) -> Option<(GenerationPermit, ChatInput)> {
        for reply in self.waiters {
            let _ = reply.send(result.clone());
        }
        self.next
    }
}

impl RequestSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant the permit if the session is idle, otherwise enqueue. The
    /// returned handle resolves with the generation the input ends up in.
    /// Returns `None` once the session is closed.
    pub fn admit(&self, session_id: &SessionId, input: ChatInput) -> Option<(Admission, ReplyHandle)> {
        let (tx, rx) = oneshot::channel();
        let entry = self.slots.entry(session_id.clone());
        // Checked under the shard lock so `close` followed by `abort` sees any slot created here.
        if self.closed.contains(session_id) {
            return None;
        }
        Some(match entry {
            Entry::Vacant(vacant) => {
                let permit = GenerationPermit::new(session_id.clone());
                let _ = vacant.insert(Slot {
                    permit: permit.clone(),
                    phase: GenerationPhase::Streaming,
                    queue: VecDeque::from([QueuedRequest { input: None, reply: tx }]),
                });
                (Admission::Granted { permit, input }, ReplyHandle { rx, queued: false })
            }
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.queue.push_back(QueuedRequest {
                    input: Some(input),
                    reply: tx,
                });
                debug!(session_id = %session_id, pending = slot.queue.len(), "request queued");
                (Admission::Queued, ReplyHandle { rx, queued: true })
            }
        })
    }

    /// Mark every unprocessed request as merged and hand over its input, in arrival order.
    pub fn take_unprocessed(&self, session_id: &SessionId) -> Vec<ChatInput> {
        self.slots
            .get_mut(session_id)
            .map(|mut slot| slot.queue.iter_mut().filter_map(|r| r.input.take()).collect())
            .unwrap_or_default()
    }

    /// End the current generation. The slot is handed to the next queued
    /// input or freed before any caller is answered, so a resolved caller
    /// never observes its own generation as still running. A cancelled
    /// generation frees the slot and rejects every request not merged into it.
    pub fn release(&self, session_id: &SessionId, cancelled: bool) -> Release {
        let Entry::Occupied(mut occupied) = self.slots.entry(session_id.clone()) else {
            return Release::default();
        };
        let slot = occupied.get_mut();
        let queue = std::mem::take(&mut slot.queue);
        let (done, mut waiting): (VecDeque<_>, VecDeque<_>) = queue.into_iter().partition(QueuedRequest::processed);
        let waiters = done.into_iter().map(|r| r.reply).collect();

        if !cancelled {
            if let Some(input) = waiting.iter_mut().find_map(|r| r.input.take()) {
                slot.queue = waiting;
                slot.permit = GenerationPermit::new(session_id.clone());
                slot.phase = GenerationPhase::Streaming;
                return Release {
                    waiters,
                    next: Some((slot.permit.clone(), input)),
                };
            }
        }

        let _ = occupied.remove();
        self.released.notify_waiters();
        for request in waiting {
            let _ = request.reply.send(Err(ChatError::Aborted));
        }
        Release { waiters, next: None }
    }

    /// Refuse further admissions for a session that is being removed.
    pub fn close(&self, session_id: &SessionId) {
        let _ = self.closed.insert(session_id.clone());
    }

    /// Cancel the active permit. Queued requests stay until the generation concludes.
    pub fn abort(&self, session_id: &SessionId) -> bool {
        match self.slots.get(session_id) {
            Some(slot) => {
                slot.permit.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self) {
        for slot in self.slots.iter() {
            slot.permit.cancel.cancel();
        }
    }

    pub fn is_busy(&self, session_id: &SessionId) -> bool {
        self.slots.contains_key(session_id)
    }

    pub fn phase(&self, session_id: &SessionId) -> Option<GenerationPhase> {
        self.slots.get(session_id).map(|s| s.phase)
    }

    pub fn set_phase(&self, session_id: &SessionId, phase: GenerationPhase) {
        if let Some(mut slot) = self.slots.get_mut(session_id) {
            slot.phase = phase;
        }
    }

    /// Requests not yet merged into a generation.
    pub fn pending(&self, session_id: &SessionId) -> usize {
        self.slots
            .get(session_id)
            .map_or(0, |s| s.queue.iter().filter(|r| !r.processed()).count())
    }

    /// Wait until the session holds no permit. Returns false on timeout.
    pub async fn wait_idle(&self, session_id: &SessionId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();
            if !self.is_busy(session_id) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.is_busy(session_id);
            }
        }
    }
}

/// Future resolved with the outcome of the generation a request was merged into.
#[derive(Debug)]
pub struct ReplyHandle {
    rx: oneshot::Receiver<ChatResult>,
    queued: bool,
}

impl ReplyHandle {
    /// Whether the request waited behind a running generation.
    pub fn is_queued(&self) -> bool {
        self.queued
    }
}

impl Future for ReplyHandle {
    type Output = ChatResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(ChatError::Failed("generation dropped".into()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::message::{MessageInfo, MessageWithParts};

    fn reply(sid: &SessionId) -> ChatResult {
        Ok(MessageWithParts::new(MessageInfo::user(sid.clone())))
    }

    fn admit(ser: &RequestSerializer, sid: &SessionId, text: &str) -> (Admission, ReplyHandle) {
        ser.admit(sid, ChatInput::text(text)).unwrap()
    }

    #[tokio::test]
    async fn one_permit_many_queued() {
        let ser = RequestSerializer::new();
        let sid = SessionId::new();
        let mut granted = 0;
        let mut handles = Vec::new();
        for i in 0..5 {
            let (admission, handle) = admit(&ser, &sid, &format!("m{i}"));
            if matches!(admission, Admission::Granted { .. }) {
                granted += 1;
                assert!(!handle.is_queued());
            } else {
                assert!(handle.is_queued());
            }
            handles.push(handle);
        }
        assert_eq!(granted, 1);
        assert_eq!(ser.pending(&sid), 4);
        assert!(ser.is_busy(&sid));
    }

    #[tokio::test]
    async fn merged_requests_share_the_result() {
        let ser = RequestSerializer::new();
        let sid = SessionId::new();
        let (_, first) = admit(&ser, &sid, "a");
        let (_, second) = admit(&ser, &sid, "b");
        let (_, third) = admit(&ser, &sid, "c");

        let merged = ser.take_unprocessed(&sid);
        assert_eq!(merged, vec![ChatInput::text("b"), ChatInput::text("c")]);
        assert_eq!(ser.pending(&sid), 0);

        let result = reply(&sid);
        assert!(ser.release(&sid, false).resolve(&result).is_none());
        assert_eq!(first.await, result);
        assert_eq!(second.await, result);
        assert_eq!(third.await, result);
        assert!(!ser.is_busy(&sid));
    }

    #[tokio::test]
    async fn slot_is_freed_before_callers_are_answered() {
        let ser = RequestSerializer::new();
        let sid = SessionId::new();
        let (_, mut handle) = admit(&ser, &sid, "a");

        let release = ser.release(&sid, false);
        assert!(!ser.is_busy(&sid));
        assert!(futures::poll!(&mut handle).is_pending());

        assert!(release.resolve(&reply(&sid)).is_none());
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn release_hands_next_request_a_fresh_permit() {
        let ser = RequestSerializer::new();
        let sid = SessionId::new();
        let (Admission::Granted { permit, .. }, first) = admit(&ser, &sid, "a") else {
            panic!("first caller must be granted");
        };
        let (_, second) = admit(&ser, &sid, "b");

        let (next, input) = ser.release(&sid, false).resolve(&reply(&sid)).unwrap();
        assert!(first.await.is_ok());
        assert_eq!(input, ChatInput::text("b"));
        assert!(ser.is_busy(&sid));
        assert_eq!(ser.pending(&sid), 0);
        permit.cancel.cancel();
        assert!(!next.cancel.is_cancelled());

        let failed = Err(ChatError::Failed("x".into()));
        assert!(ser.release(&sid, false).resolve(&failed).is_none());
        assert_eq!(second.await, failed);
    }

    #[tokio::test]
    async fn cancelled_release_rejects_every_waiter() {
        let ser = RequestSerializer::new();
        let sid = SessionId::new();
        let (Admission::Granted { permit, .. }, first) = admit(&ser, &sid, "a") else {
            panic!("first caller must be granted");
        };
        let (_, second) = admit(&ser, &sid, "b");

        assert!(ser.abort(&sid));
        assert!(permit.cancel.is_cancelled());
        assert!(ser.is_busy(&sid));

        let next = ser.release(&sid, true).resolve(&Err(ChatError::Aborted));
        assert!(next.is_none());
        assert!(!ser.is_busy(&sid));
        assert_eq!(first.await, Err(ChatError::Aborted));
        assert_eq!(second.await, Err(ChatError::Aborted));
        assert!(!ser.abort(&sid));
    }

    #[test]
    fn closed_sessions_refuse_admission() {
        let ser = RequestSerializer::new();
        let sid = SessionId::new();
        ser.close(&sid);
        assert!(ser.admit(&sid, ChatInput::text("a")).is_none());
        assert!(!ser.is_busy(&sid));
        assert!(ser.admit(&SessionId::new(), ChatInput::text("a")).is_some());
    }

    #[tokio::test]
    async fn wait_idle_wakes_on_release() {
        let ser = std::sync::Arc::new(RequestSerializer::new());
        let sid = SessionId::new();
        let _ = admit(&ser, &sid, "a");
        assert!(!ser.wait_idle(&sid, Duration::from_millis(10)).await);

        let ser2 = ser.clone();
        let sid2 = sid.clone();
        let waiter = tokio::spawn(async move { ser2.wait_idle(&sid2, Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        assert!(ser.release(&sid, false).resolve(&Err(ChatError::Aborted)).is_none());
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn dropped_sender_fails_the_handle() {
        let ser = RequestSerializer::new();
        let sid = SessionId::new();
        let (_, handle) = admit(&ser, &sid, "a");
        drop(ser);
        assert_eq!(handle.await, Err(ChatError::Failed("generation dropped".into())));
    }

    #[test]
    fn phase_tracks_slot() {
        let ser = RequestSerializer::new();
        let sid = SessionId::new();
        assert_eq!(ser.phase(&sid), None);
        let _ = admit(&ser, &sid, "a");
        assert_eq!(ser.phase(&sid), Some(GenerationPhase::Streaming));
        ser.set_phase(&sid, GenerationPhase::AwaitingTool);
        assert_eq!(ser.phase(&sid), Some(GenerationPhase::AwaitingTool));
    }
}
