//! Negotiation Engine: the offer/answer/candidate exchange for one session.
//!
//! [`NegotiationEngine`] wraps one [`PeerConnection`] and the
//! [`NegotiationContext`] describing how far negotiation has progressed.
//! Every operation that suspends (offer/answer creation, description
//! application) runs on its own task and posts its result back to the session
//! queue as a [`Tagged`] output. The tag is the context's [`Generation`]; the
//! session drops any output whose generation is no longer current, which is
//! how in-flight work from a torn-down session is cancelled.
//!
//! Remote candidates go through a single per-context task, so they reach the
//! peer connection in arrival order.
//!
//! Validation happens synchronously when an operation is requested, so role
//! errors surface to the caller immediately:
//!
//! | Operation                    | Requires                                              |
//! |------------------------------|-------------------------------------------------------|
//! | `create_offer`               | Initiator, no local description, no offer in flight   |
//! | `create_answer(offer)`       | Responder, `offer` applied as remote, no local answer |
//! | `apply_remote_description`   | offer for Responder, answer for Initiator after offer |
//! | `apply_remote_candidate`     | well-formed candidate line                            |

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{PairChatError, Result};
use crate::media::LocalMedia;
use crate::peer::{PeerConnection, PeerSignal};
use crate::protocol::{IceCandidate, Role, SessionDescription};
use crate::state::SessionRole;

// ── Generation ──────────────────────────────────────────────────────

/// Identifies one negotiation context.
///
/// Strictly increasing over the lifetime of a session handle. Asynchronous
/// results carry the generation they were started under and are discarded when
/// it no longer matches the live context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    pub fn get(self) -> u64 {
        self.0
    }

    /// The generation after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// Hands out generations. Advanced on every context creation and teardown.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    current: Generation,
}

impl GenerationCounter {
    pub fn current(&self) -> Generation {
        self.current
    }

    /// Invalidate everything tagged with the current generation and return
    /// the new one.
    pub fn advance(&mut self) -> Generation {
        self.current = self.current.next();
        self.current
    }
}

// ── Outputs posted back to the session queue ────────────────────────

/// Result of a suspended operation, or a peer-connection callback.
#[derive(Debug)]
pub(crate) enum EngineOutput {
    /// An offer or answer was created and set as the local description.
    LocalDescriptionReady(SessionDescription),
    /// The remote description finished applying.
    RemoteDescriptionApplied(SessionDescription),
    /// Local capture produced a stream.
    MediaAcquired(Arc<dyn LocalMedia>),
    /// Local capture failed.
    MediaFailed(PairChatError),
    /// A remote candidate was rejected by the media transport.
    CandidateRejected {
        candidate: IceCandidate,
        error: PairChatError,
    },
    /// Any other suspended operation failed.
    OperationFailed {
        operation: &'static str,
        error: PairChatError,
    },
    Peer(PeerSignal),
}

/// An [`EngineOutput`] stamped with the generation it belongs to.
#[derive(Debug)]
pub(crate) struct Tagged {
    pub(crate) generation: Generation,
    pub(crate) output: EngineOutput,
}

// ── NegotiationContext ──────────────────────────────────────────────

/// Progress of one session's negotiation.
///
/// Created on entering `Matched` and destroyed on leaving the session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NegotiationContext {
    pub generation: Generation,
    pub local_description: Option<SessionDescription>,
    /// Remote description committed by `apply_remote_description`.
    pub remote_description: Option<SessionDescription>,
    /// Whether the peer connection has finished applying `remote_description`.
    pub remote_applied: bool,
    /// Remote candidates that arrived before the remote description was
    /// applied, in arrival order.
    pub queued_remote_candidates: Vec<IceCandidate>,
    /// Local candidates gathered so far, in gathering order. Each is
    /// forwarded as soon as it is gathered.
    pub local_candidates: Vec<IceCandidate>,
    pub media_ready: bool,
    pub offer_in_flight: bool,
    pub answer_in_flight: bool,
    pub remote_stream_seen: bool,
}

// ── NegotiationEngine ───────────────────────────────────────────────

/// Drives one [`PeerConnection`] through offer/answer for a fixed role.
pub struct NegotiationEngine {
    role: Role,
    context: NegotiationContext,
    peer: Arc<dyn PeerConnection>,
    media: Option<Arc<dyn LocalMedia>>,
    outputs: mpsc::UnboundedSender<Tagged>,
    /// Feeds the task that applies remote candidates one at a time.
    candidates: mpsc::UnboundedSender<IceCandidate>,
}

impl NegotiationEngine {
    pub(crate) fn new(
        role: Role,
        generation: Generation,
        peer: Arc<dyn PeerConnection>,
        outputs: mpsc::UnboundedSender<Tagged>,
    ) -> Self {
        let candidates = spawn_candidate_applier(Arc::clone(&peer), outputs.clone(), generation);
        Self {
            role,
            context: NegotiationContext {
                generation,
                ..NegotiationContext::default()
            },
            peer,
            media: None,
            outputs,
            candidates,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> Generation {
        self.context.generation
    }

    pub fn context(&self) -> &NegotiationContext {
        &self.context
    }

    /// Start creating the offer.
    ///
    /// # Errors
    ///
    /// [`PairChatError::InvalidRole`] unless this is the Initiator and no offer
    /// exists or is in flight.
    pub fn create_offer(&mut self) -> Result<()> {
        if self.role != Role::Initiator {
            return Err(self.invalid("create_offer", "only the initiator may originate an offer"));
        }
        if self.context.local_description.is_some() || self.context.offer_in_flight {
            return Err(self.invalid("create_offer", "an offer has already been created"));
        }
        self.context.offer_in_flight = true;

        let peer = Arc::clone(&self.peer);
        self.spawn_op("create_offer", async move {
            let offer = peer.create_offer().await?;
            peer.set_local_description(offer.clone()).await?;
            Ok(EngineOutput::LocalDescriptionReady(offer))
        });
        Ok(())
    }

    /// Start creating the answer to `remote_offer`, which must be the offer
    /// that was just applied.
    ///
    /// # Errors
    ///
    /// [`PairChatError::InvalidRole`] unless this is the Responder and
    /// `remote_offer` is the applied remote offer with no answer yet.
    pub fn create_answer(&mut self, remote_offer: &SessionDescription) -> Result<()> {
        if self.role != Role::Responder {
            return Err(self.invalid("create_answer", "only the responder may originate an answer"));
        }
        let applied = self.context.remote_applied
            && self.context.remote_description.as_ref() == Some(remote_offer)
            && remote_offer.is_offer();
        if !applied {
            return Err(self.invalid("create_answer", "no remote offer has been applied"));
        }
        if self.context.local_description.is_some() || self.context.answer_in_flight {
            return Err(self.invalid("create_answer", "an answer has already been created"));
        }
        self.context.answer_in_flight = true;

        let peer = Arc::clone(&self.peer);
        self.spawn_op("create_answer", async move {
            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            Ok(EngineOutput::LocalDescriptionReady(answer))
        });
        Ok(())
    }

    /// Commit `description` as the remote description and start applying it.
    ///
    /// Returns `Ok(false)` without doing anything if the identical description
    /// is already committed.
    ///
    /// # Errors
    ///
    /// [`PairChatError::ProtocolViolation`] for an offer sent to the Initiator,
    /// an answer sent to the Responder, an answer before our offer, or a second
    /// differing description.
    pub fn apply_remote_description(&mut self, description: SessionDescription) -> Result<bool> {
        if self.context.remote_description.as_ref() == Some(&description) {
            return Ok(false);
        }
        if self.context.remote_description.is_some() {
            return Err(PairChatError::ProtocolViolation(
                "remote description changed mid-session".into(),
            ));
        }
        match (self.role, description.is_offer()) {
            (Role::Initiator, true) => {
                return Err(PairChatError::ProtocolViolation(
                    "initiator received an offer".into(),
                ));
            }
            (Role::Responder, false) => {
                return Err(PairChatError::ProtocolViolation(
                    "responder received an answer".into(),
                ));
            }
            (Role::Initiator, false) if self.context.local_description.is_none() => {
                return Err(PairChatError::ProtocolViolation(
                    "answer received before our offer was sent".into(),
                ));
            }
            _ => {}
        }

        self.context.remote_description = Some(description.clone());
        self.context.remote_applied = false;

        let peer = Arc::clone(&self.peer);
        self.spawn_op("set_remote_description", async move {
            peer.set_remote_description(description.clone()).await?;
            Ok(EngineOutput::RemoteDescriptionApplied(description))
        });
        Ok(true)
    }

    /// Queue or apply a remote candidate.
    ///
    /// Candidates that arrive before the remote description is applied are
    /// held and flushed, in order, once it is. The end-of-candidates marker is
    /// accepted and ignored.
    ///
    /// # Errors
    ///
    /// [`PairChatError::MalformedCandidate`] if the candidate line does not parse.
    pub fn apply_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        candidate.validate()?;
        if candidate.is_end_of_candidates() {
            debug!(generation = %self.generation(), "remote end-of-candidates");
            return Ok(());
        }
        if self.context.remote_applied {
            self.enqueue_candidate(candidate);
        } else {
            self.context.queued_remote_candidates.push(candidate);
        }
        Ok(())
    }

    /// Record that `description` became the local description.
    pub(crate) fn local_description_ready(&mut self, description: SessionDescription) {
        self.context.offer_in_flight = false;
        self.context.answer_in_flight = false;
        self.context.local_description = Some(description);
    }

    /// Mark `description` as applied and flush queued candidates.
    ///
    /// Returns `false` if `description` is not the committed remote
    /// description.
    pub(crate) fn remote_description_applied(&mut self, description: &SessionDescription) -> bool {
        if self.context.remote_description.as_ref() != Some(description) {
            return false;
        }
        self.context.remote_applied = true;
        let queued = std::mem::take(&mut self.context.queued_remote_candidates);
        if !queued.is_empty() {
            debug!(count = queued.len(), "flushing queued remote candidates");
        }
        for candidate in queued {
            self.enqueue_candidate(candidate);
        }
        true
    }

    /// Clear in-flight markers after a failed operation so the user can retry
    /// by skipping.
    pub(crate) fn operation_failed(&mut self, operation: &'static str) {
        match operation {
            "create_offer" => self.context.offer_in_flight = false,
            "create_answer" => self.context.answer_in_flight = false,
            _ => {}
        }
    }

    pub(crate) fn record_local_candidate(&mut self, candidate: IceCandidate) {
        self.context.local_candidates.push(candidate);
    }

    /// Returns `true` the first time a remote stream is reported.
    pub(crate) fn remote_stream_ready(&mut self) -> bool {
        !std::mem::replace(&mut self.context.remote_stream_seen, true)
    }

    /// Take ownership of the local capture stream and attach it.
    pub(crate) fn attach_media(&mut self, media: Arc<dyn LocalMedia>) {
        if let Some(previous) = self.media.replace(Arc::clone(&media)) {
            warn!(id = previous.id(), "replacing local media; stopping previous stream");
            previous.stop();
        }
        self.context.media_ready = true;

        let peer = Arc::clone(&self.peer);
        self.spawn_op("add_local_media", async move {
            peer.add_local_media(media).await?;
            Ok(EngineOutput::Peer(PeerSignal::NegotiationNeeded))
        });
    }

    pub fn local_media(&self) -> Option<&Arc<dyn LocalMedia>> {
        self.media.as_ref()
    }

    pub(crate) fn set_audio_enabled(&self, enabled: bool) {
        if let Some(media) = &self.media {
            media.set_audio_enabled(enabled);
        }
    }

    pub(crate) fn set_video_enabled(&self, enabled: bool) {
        if let Some(media) = &self.media {
            media.set_video_enabled(enabled);
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn invalid(&self, operation: &'static str, reason: &'static str) -> PairChatError {
        PairChatError::InvalidRole {
            operation,
            role: SessionRole::from(self.role),
            reason,
        }
    }

    fn enqueue_candidate(&self, candidate: IceCandidate) {
        if self.candidates.send(candidate).is_err() {
            warn!(generation = %self.context.generation, "candidate applier has stopped");
        }
    }

    /// Run `op` on its own task and post its outcome to the session queue.
    fn spawn_op<F>(&self, operation: &'static str, op: F)
    where
        F: Future<Output = Result<EngineOutput>> + Send + 'static,
    {
        let outputs = self.outputs.clone();
        let generation = self.context.generation;
        tokio::spawn(async move {
            let output = match op.await {
                Ok(output) => output,
                Err(error) => EngineOutput::OperationFailed { operation, error },
            };
            // A closed queue means the session has shut down.
            let _ = outputs.send(Tagged { generation, output });
        });
    }
}

/// Apply remote candidates strictly in the order they are queued, each one
/// only after the previous call has returned. Ends when the engine is dropped.
fn spawn_candidate_applier(
    peer: Arc<dyn PeerConnection>,
    outputs: mpsc::UnboundedSender<Tagged>,
    generation: Generation,
) -> mpsc::UnboundedSender<IceCandidate> {
    let (tx, mut rx) = mpsc::unbounded_channel::<IceCandidate>();
    tokio::spawn(async move {
        while let Some(candidate) = rx.recv().await {
            if let Err(error) = peer.add_ice_candidate(candidate.clone()).await {
                let _ = outputs.send(Tagged {
                    generation,
                    output: EngineOutput::CandidateRejected { candidate, error },
                });
            }
        }
    });
    tx
}

impl fmt::Debug for NegotiationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationEngine")
            .field("role", &self.role)
            .field("context", &self.context)
            .field("has_media", &self.media.is_some())
            .finish()
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        // The capture handle must be released before the next context
        // acquires one.
        if let Some(media) = self.media.take() {
            debug!(id = media.id(), generation = %self.context.generation, "stopping local media");
            media.stop();
        }
        let peer = Arc::clone(&self.peer);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { peer.close().await });
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const CANDIDATE: &str = "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host";

    // ── Mock peer connection ────────────────────────────────────────

    #[derive(Default)]
    struct RecordingPeer {
        calls: StdMutex<Vec<String>>,
        reject_candidates: AtomicBool,
        /// Suspend inside `add_ice_candidate` before recording the call.
        yield_on_candidate: AtomicBool,
    }

    impl RecordingPeer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl PeerConnection for RecordingPeer {
        async fn create_offer(&self) -> Result<SessionDescription> {
            self.record("create_offer");
            Ok(SessionDescription::offer("local-offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            self.record("create_answer");
            Ok(SessionDescription::answer("local-answer"))
        }

        async fn set_local_description(&self, d: SessionDescription) -> Result<()> {
            self.record(format!("set_local:{}", d.sdp));
            Ok(())
        }

        async fn set_remote_description(&self, d: SessionDescription) -> Result<()> {
            self.record(format!("set_remote:{}", d.sdp));
            Ok(())
        }

        async fn add_ice_candidate(&self, c: IceCandidate) -> Result<()> {
            if self.yield_on_candidate.load(Ordering::Relaxed) {
                tokio::task::yield_now().await;
            }
            self.record(format!("add_candidate:{}", c.candidate));
            if self.reject_candidates.load(Ordering::Relaxed) {
                return Err(PairChatError::MalformedCandidate("rejected".into()));
            }
            Ok(())
        }

        async fn add_local_media(&self, _media: Arc<dyn LocalMedia>) -> Result<()> {
            self.record("add_local_media");
            Ok(())
        }

        async fn close(&self) {
            self.record("close");
        }
    }

    fn engine(
        role: Role,
    ) -> (
        NegotiationEngine,
        Arc<RecordingPeer>,
        mpsc::UnboundedReceiver<Tagged>,
    ) {
        let peer = Arc::new(RecordingPeer::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::new(
            role,
            Generation::default().next(),
            Arc::clone(&peer) as Arc<dyn PeerConnection>,
            tx,
        );
        (engine, peer, rx)
    }

    async fn next_output(rx: &mut mpsc::UnboundedReceiver<Tagged>) -> Tagged {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("output in time")
            .expect("queue open")
    }

    // ── Generation ──────────────────────────────────────────────────

    #[test]
    fn generation_counter_is_strictly_increasing() {
        let mut counter = GenerationCounter::default();
        let first = counter.current();
        let second = counter.advance();
        let third = counter.advance();
        assert!(first < second && second < third);
        assert_eq!(counter.current(), third);
        assert_eq!(third.get(), 2);
        assert_eq!(third.to_string(), "gen#2");
    }

    // ── Role invariants ─────────────────────────────────────────────

    #[tokio::test]
    async fn responder_cannot_create_offer() {
        let (mut engine, peer, _rx) = engine(Role::Responder);
        let err = engine.create_offer().unwrap_err();
        assert!(matches!(
            err,
            PairChatError::InvalidRole {
                operation: "create_offer",
                role: SessionRole::Responder,
                ..
            }
        ));
        tokio::task::yield_now().await;
        assert!(peer.calls().is_empty());
    }

    #[tokio::test]
    async fn initiator_cannot_create_answer() {
        let (mut engine, _peer, _rx) = engine(Role::Initiator);
        let offer = SessionDescription::offer("remote");
        let err = engine.create_answer(&offer).unwrap_err();
        assert!(matches!(
            err,
            PairChatError::InvalidRole {
                operation: "create_answer",
                role: SessionRole::Initiator,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn initiator_offer_is_created_once() {
        let (mut engine, peer, mut rx) = engine(Role::Initiator);
        engine.create_offer().unwrap();
        assert!(matches!(
            engine.create_offer(),
            Err(PairChatError::InvalidRole { .. })
        ));

        let tagged = next_output(&mut rx).await;
        assert_eq!(tagged.generation, engine.generation());
        let EngineOutput::LocalDescriptionReady(offer) = tagged.output else {
            panic!("expected local description");
        };
        engine.local_description_ready(offer.clone());
        assert_eq!(engine.context().local_description.as_ref(), Some(&offer));
        assert!(matches!(
            engine.create_offer(),
            Err(PairChatError::InvalidRole { .. })
        ));
        assert_eq!(peer.calls(), vec!["create_offer", "set_local:local-offer"]);
    }

    #[tokio::test]
    async fn responder_answers_only_after_offer_applied() {
        let (mut engine, peer, mut rx) = engine(Role::Responder);
        let offer = SessionDescription::offer("remote-offer");

        assert!(matches!(
            engine.create_answer(&offer),
            Err(PairChatError::InvalidRole { .. })
        ));

        assert!(engine.apply_remote_description(offer.clone()).unwrap());
        // Committed but not applied yet.
        assert!(matches!(
            engine.create_answer(&offer),
            Err(PairChatError::InvalidRole { .. })
        ));

        let tagged = next_output(&mut rx).await;
        let EngineOutput::RemoteDescriptionApplied(applied) = tagged.output else {
            panic!("expected applied description");
        };
        assert!(engine.remote_description_applied(&applied));
        engine.create_answer(&applied).unwrap();

        let tagged = next_output(&mut rx).await;
        assert!(matches!(
            tagged.output,
            EngineOutput::LocalDescriptionReady(ref d) if d.sdp == "local-answer"
        ));
        assert_eq!(
            peer.calls(),
            vec![
                "set_remote:remote-offer",
                "create_answer",
                "set_local:local-answer"
            ]
        );
    }

    #[tokio::test]
    async fn role_mismatched_descriptions_are_protocol_violations() {
        let (mut initiator, _, _rx1) = engine(Role::Initiator);
        assert!(matches!(
            initiator.apply_remote_description(SessionDescription::offer("x")),
            Err(PairChatError::ProtocolViolation(_))
        ));
        // Answer before our own offer.
        assert!(matches!(
            initiator.apply_remote_description(SessionDescription::answer("x")),
            Err(PairChatError::ProtocolViolation(_))
        ));

        let (mut responder, _, _rx2) = engine(Role::Responder);
        assert!(matches!(
            responder.apply_remote_description(SessionDescription::answer("x")),
            Err(PairChatError::ProtocolViolation(_))
        ));
    }

    // ── Idempotence ─────────────────────────────────────────────────

    #[tokio::test]
    async fn applying_same_description_twice_equals_applying_once() {
        let (mut once, _, _rx1) = engine(Role::Responder);
        let (mut twice, peer, _rx2) = engine(Role::Responder);
        let offer = SessionDescription::offer("remote-offer");

        assert!(once.apply_remote_description(offer.clone()).unwrap());
        assert!(twice.apply_remote_description(offer.clone()).unwrap());
        assert!(!twice.apply_remote_description(offer).unwrap());

        assert_eq!(once.context(), twice.context());
        tokio::task::yield_now().await;
        let set_remote_calls = peer
            .calls()
            .iter()
            .filter(|c| c.starts_with("set_remote"))
            .count();
        assert_eq!(set_remote_calls, 1);
    }

    // ── Candidates ──────────────────────────────────────────────────

    #[tokio::test]
    async fn candidates_before_description_are_queued_then_flushed_in_order() {
        let (mut engine, peer, mut rx) = engine(Role::Responder);
        let first = IceCandidate::new(CANDIDATE);
        let second = IceCandidate::new(CANDIDATE.replace("50000", "50001"));

        engine.apply_remote_candidate(first.clone()).unwrap();
        engine.apply_remote_candidate(second.clone()).unwrap();
        assert_eq!(
            engine.context().queued_remote_candidates,
            vec![first, second]
        );

        engine
            .apply_remote_description(SessionDescription::offer("remote-offer"))
            .unwrap();
        let tagged = next_output(&mut rx).await;
        let EngineOutput::RemoteDescriptionApplied(applied) = tagged.output else {
            panic!("expected applied description");
        };
        assert!(engine.remote_description_applied(&applied));
        assert!(engine.context().queued_remote_candidates.is_empty());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let adds: Vec<String> = peer
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("add_candidate"))
            .collect();
        assert_eq!(adds.len(), 2);
        assert!(adds[0].ends_with("50000 typ host"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn candidates_reach_peer_in_arrival_order_on_multi_thread_runtime() {
        let (mut engine, peer, mut rx) = engine(Role::Responder);
        peer.yield_on_candidate.store(true, Ordering::Relaxed);
        let lines: Vec<String> = (0..40)
            .map(|i| CANDIDATE.replace("50000", &(10_000 + i).to_string()))
            .collect();

        for line in &lines {
            engine.apply_remote_candidate(IceCandidate::new(line.as_str())).unwrap();
        }
        engine
            .apply_remote_description(SessionDescription::offer("remote-offer"))
            .unwrap();
        let Tagged { output, .. } = next_output(&mut rx).await;
        let EngineOutput::RemoteDescriptionApplied(applied) = output else {
            panic!("expected applied description");
        };
        assert!(engine.remote_description_applied(&applied));

        // Candidates arriving after the flush go through the same queue.
        let late = CANDIDATE.replace("50000", "20000");
        engine.apply_remote_candidate(IceCandidate::new(late.as_str())).unwrap();

        let expected: Vec<String> = lines
            .iter()
            .chain(std::iter::once(&late))
            .map(|l| format!("add_candidate:{l}"))
            .collect();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let adds = peer
                    .calls()
                    .into_iter()
                    .filter(|c| c.starts_with("add_candidate"))
                    .count();
                if adds == expected.len() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all candidates applied");

        let adds: Vec<String> = peer
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("add_candidate"))
            .collect();
        assert_eq!(adds, expected);
    }

    #[tokio::test]
    async fn malformed_candidate_is_rejected_without_queueing() {
        let (mut engine, _, _rx) = engine(Role::Initiator);
        let err = engine
            .apply_remote_candidate(IceCandidate::new("garbage"))
            .unwrap_err();
        assert!(matches!(err, PairChatError::MalformedCandidate(_)));
        assert!(engine.context().queued_remote_candidates.is_empty());

        tokio_test::assert_ok!(engine.apply_remote_candidate(IceCandidate::new("")));
        assert!(engine.context().queued_remote_candidates.is_empty());
    }

    #[tokio::test]
    async fn candidate_rejected_by_transport_is_reported() {
        let (mut engine, peer, mut rx) = engine(Role::Responder);
        peer.reject_candidates.store(true, Ordering::Relaxed);
        engine
            .apply_remote_description(SessionDescription::offer("o"))
            .unwrap();
        let Tagged { output, .. } = next_output(&mut rx).await;
        let EngineOutput::RemoteDescriptionApplied(applied) = output else {
            panic!("expected applied description");
        };
        engine.remote_description_applied(&applied);

        engine
            .apply_remote_candidate(IceCandidate::new(CANDIDATE))
            .unwrap();
        let Tagged { output, .. } = next_output(&mut rx).await;
        assert!(matches!(
            output,
            EngineOutput::CandidateRejected {
                error: PairChatError::MalformedCandidate(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn remote_stream_is_reported_once() {
        let (mut engine, _, _rx) = engine(Role::Initiator);
        assert!(engine.remote_stream_ready());
        assert!(!engine.remote_stream_ready());
    }

    #[tokio::test]
    async fn drop_closes_peer_connection() {
        let (engine, peer, _rx) = engine(Role::Initiator);
        drop(engine);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(peer.calls(), vec!["close"]);
    }
}
