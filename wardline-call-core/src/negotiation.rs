//! Offer/answer and candidate handling for one call.
//!
//! The rules here mirror the portal's signaling contract: the creator
//! sends exactly one initial offer, the joiner answers, and only the
//! joiner starts renegotiation rounds. Candidates that arrive before the
//! remote description are buffered and applied in arrival order once it
//! lands. Handlers return the message to relay back, if any; the session
//! owns the actual sending.

use crate::media::TrackController;
use crate::peer::{PeerError, PeerEvent, PeerFactory, PeerLink};
use crate::signaling::{IceCandidatePayload, SdpPayload, SignalMessage};
use crate::types::{CallId, Role};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised while negotiating.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The peer connection driver refused an operation.
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Negotiation state machine for one session.
pub struct Negotiator {
    call_id: CallId,
    role: Role,
    factory: Arc<dyn PeerFactory>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    peer: Option<Box<dyn PeerLink>>,
    pending_candidates: VecDeque<IceCandidatePayload>,
    remote_description_set: bool,
    initial_offer_sent: bool,
    awaiting_answer: bool,
    exchange_complete: bool,
}

impl Negotiator {
    /// Creates the machine for `call_id`; the peer capability is built
    /// lazily on first need, reporting into `peer_events`.
    #[must_use]
    pub fn new(
        call_id: CallId,
        role: Role,
        factory: Arc<dyn PeerFactory>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            call_id,
            role,
            factory,
            peer_events,
            peer: None,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            initial_offer_sent: false,
            awaiting_answer: false,
            exchange_complete: false,
        }
    }

    async fn ensure_peer(&mut self, tracks: &mut TrackController) -> Result<(), NegotiationError> {
        if self.peer.is_none() {
            tracing::debug!(call_id = %self.call_id, "creating peer connection");
            let peer = self.factory.create(self.peer_events.clone()).await?;
            self.peer = Some(peer);
        }
        if let Some(peer) = self.peer.as_deref() {
            tracks.attach(peer).await.map_err(NegotiationError::from)?;
        }
        Ok(())
    }

    /// Sends the creator's single initial offer.
    ///
    /// A no-op for the joiner and for every call after the first.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] when the capability or the offer
    /// cannot be created.
    pub async fn start_offer(
        &mut self,
        tracks: &mut TrackController,
    ) -> Result<Option<SignalMessage>, NegotiationError> {
        if !self.role.is_creator() || self.initial_offer_sent {
            return Ok(None);
        }
        self.ensure_peer(tracks).await?;
        let Some(peer) = self.peer.as_deref() else {
            return Ok(None);
        };
        let offer = peer.create_offer().await?;
        self.initial_offer_sent = true;
        self.awaiting_answer = true;
        tracing::info!(call_id = %self.call_id, "initial offer created");
        Ok(Some(SignalMessage::Offer {
            call_id: self.call_id.clone(),
            offer,
        }))
    }

    /// Handles a remote offer and returns the answer to relay.
    ///
    /// An offer arriving while our own offer is outstanding (glare) is
    /// dropped with a warning; the portal contract makes offers flow one
    /// way at a time.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] when applying the offer or building
    /// the answer fails.
    pub async fn handle_offer(
        &mut self,
        offer: SdpPayload,
        tracks: &mut TrackController,
    ) -> Result<Option<SignalMessage>, NegotiationError> {
        if self.awaiting_answer {
            tracing::warn!(call_id = %self.call_id, "offer received while our own offer is outstanding, dropping");
            return Ok(None);
        }
        self.ensure_peer(tracks).await?;
        let Some(peer) = self.peer.as_deref() else {
            return Ok(None);
        };
        peer.set_remote_description(offer).await?;
        self.remote_description_set = true;
        drain_candidates(&mut self.pending_candidates, peer, &self.call_id).await;
        let answer = peer.create_answer().await?;
        self.exchange_complete = true;
        tracing::info!(call_id = %self.call_id, "answer created");
        Ok(Some(SignalMessage::Answer {
            call_id: self.call_id.clone(),
            answer,
        }))
    }

    /// Applies a remote answer to our outstanding offer.
    ///
    /// Answers with no outstanding offer are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] when the driver rejects the answer.
    pub async fn handle_answer(&mut self, answer: SdpPayload) -> Result<(), NegotiationError> {
        if !self.awaiting_answer {
            tracing::debug!(call_id = %self.call_id, "answer with no outstanding offer, ignoring");
            return Ok(());
        }
        let Some(peer) = self.peer.as_deref() else {
            return Ok(());
        };
        peer.set_remote_description(answer).await?;
        self.awaiting_answer = false;
        self.remote_description_set = true;
        self.exchange_complete = true;
        drain_candidates(&mut self.pending_candidates, peer, &self.call_id).await;
        tracing::info!(call_id = %self.call_id, "remote answer applied");
        Ok(())
    }

    /// Applies or buffers a remote candidate.
    ///
    /// Before the remote description lands the candidate joins the FIFO
    /// buffer; afterwards it is applied immediately.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] when an immediate apply is rejected;
    /// callers log and drop it, per-candidate failures never tear a call
    /// down.
    pub async fn handle_candidate(
        &mut self,
        candidate: IceCandidatePayload,
    ) -> Result<(), NegotiationError> {
        if !self.remote_description_set || self.peer.is_none() {
            self.pending_candidates.push_back(candidate);
            tracing::debug!(
                call_id = %self.call_id,
                buffered = self.pending_candidates.len(),
                "candidate buffered until remote description"
            );
            return Ok(());
        }
        let Some(peer) = self.peer.as_deref() else {
            return Ok(());
        };
        peer.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// Starts a renegotiation round when the capability asks for one.
    ///
    /// Only the joiner renegotiates, and only after the initial exchange
    /// completed; every other trigger is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] when the fresh offer cannot be built.
    pub async fn handle_negotiation_needed(
        &mut self,
        tracks: &mut TrackController,
    ) -> Result<Option<SignalMessage>, NegotiationError> {
        if self.role.is_creator() {
            tracing::debug!(call_id = %self.call_id, "renegotiation skipped on creator side");
            return Ok(None);
        }
        if !self.exchange_complete {
            tracing::debug!(call_id = %self.call_id, "renegotiation deferred until initial exchange completes");
            return Ok(None);
        }
        self.ensure_peer(tracks).await?;
        let Some(peer) = self.peer.as_deref() else {
            return Ok(None);
        };
        let offer = peer.create_offer().await?;
        self.awaiting_answer = true;
        tracing::info!(call_id = %self.call_id, "renegotiation offer created");
        Ok(Some(SignalMessage::Offer {
            call_id: self.call_id.clone(),
            offer,
        }))
    }

    /// Closes the peer capability and discards buffered candidates.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        self.pending_candidates.clear();
    }

    /// Returns `true` once the peer capability has been created.
    #[must_use]
    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    /// Returns `true` once the initial offer went out.
    #[must_use]
    pub fn initial_offer_sent(&self) -> bool {
        self.initial_offer_sent
    }

    /// Returns `true` while a local offer awaits its answer.
    #[must_use]
    pub fn awaiting_answer(&self) -> bool {
        self.awaiting_answer
    }

    /// Returns `true` once the first offer/answer round completed.
    #[must_use]
    pub fn exchange_complete(&self) -> bool {
        self.exchange_complete
    }

    /// Number of candidates waiting for the remote description.
    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }
}

/// Applies buffered candidates in arrival order. Rejections are logged
/// and dropped so one bad candidate cannot wedge the rest of the queue.
async fn drain_candidates(
    pending: &mut VecDeque<IceCandidatePayload>,
    peer: &dyn PeerLink,
    call_id: &CallId,
) {
    while let Some(candidate) = pending.pop_front() {
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            tracing::warn!(call_id = %call_id, error = %e, "buffered candidate rejected");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, MediaDevices, MediaError};
    use crate::signaling::SdpKind;
    use crate::types::{MediaConstraints, TrackKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct PeerProbe {
        created: AtomicUsize,
        offers: AtomicUsize,
        answers: AtomicUsize,
        tracks: Mutex<Vec<String>>,
        remote_descriptions: Mutex<Vec<SdpPayload>>,
        candidates: Mutex<Vec<String>>,
        fail_candidates: AtomicBool,
        closed: AtomicBool,
    }

    struct MockPeer {
        probe: Arc<PeerProbe>,
    }

    #[async_trait]
    impl PeerLink for MockPeer {
        async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError> {
            self.probe.tracks.lock().unwrap().push(track.id().to_string());
            Ok(())
        }

        async fn create_offer(&self) -> Result<SdpPayload, PeerError> {
            let n = self.probe.offers.fetch_add(1, Ordering::SeqCst);
            Ok(SdpPayload {
                kind: SdpKind::Offer,
                sdp: format!("offer-{n}"),
            })
        }

        async fn create_answer(&self) -> Result<SdpPayload, PeerError> {
            let n = self.probe.answers.fetch_add(1, Ordering::SeqCst);
            Ok(SdpPayload {
                kind: SdpKind::Answer,
                sdp: format!("answer-{n}"),
            })
        }

        async fn set_remote_description(&self, description: SdpPayload) -> Result<(), PeerError> {
            self.probe
                .remote_descriptions
                .lock()
                .unwrap()
                .push(description);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), PeerError> {
            if self.probe.fail_candidates.load(Ordering::SeqCst) {
                return Err(PeerError::Candidate("refused".into()));
            }
            self.probe
                .candidates
                .lock()
                .unwrap()
                .push(candidate.candidate);
            Ok(())
        }

        async fn close(&self) {
            self.probe.closed.store(true, Ordering::SeqCst);
        }
    }

    struct MockFactory {
        probe: Arc<PeerProbe>,
    }

    #[async_trait]
    impl PeerFactory for MockFactory {
        async fn create(
            &self,
            _events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<Box<dyn PeerLink>, PeerError> {
            self.probe.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockPeer {
                probe: Arc::clone(&self.probe),
            }))
        }
    }

    struct FakeTrack {
        id: String,
        kind: TrackKind,
    }

    impl LocalTrack for FakeTrack {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> TrackKind {
            self.kind
        }
        fn set_enabled(&self, _enabled: bool) {}
        fn is_enabled(&self) -> bool {
            true
        }
        fn stop(&self) {}
    }

    struct StaticDevices {
        track_ids: Vec<&'static str>,
    }

    #[async_trait]
    impl MediaDevices for StaticDevices {
        async fn acquire(
            &self,
            _constraints: &MediaConstraints,
        ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
            Ok(self
                .track_ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    Arc::new(FakeTrack {
                        id: (*id).to_string(),
                        kind: if i == 0 {
                            TrackKind::Audio
                        } else {
                            TrackKind::Video
                        },
                    }) as Arc<dyn LocalTrack>
                })
                .collect())
        }
    }

    fn controller(track_ids: Vec<&'static str>) -> TrackController {
        TrackController::new(
            Arc::new(StaticDevices { track_ids }),
            MediaConstraints::video_call(),
        )
    }

    fn negotiator(role: Role) -> (Negotiator, Arc<PeerProbe>, mpsc::UnboundedReceiver<PeerEvent>) {
        let probe = Arc::new(PeerProbe::default());
        let factory = Arc::new(MockFactory {
            probe: Arc::clone(&probe),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(CallId::parse("AB12CD").unwrap(), role, factory, tx);
        (negotiator, probe, rx)
    }

    fn candidate(line: &str) -> IceCandidatePayload {
        IceCandidatePayload {
            candidate: line.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn offer_payload() -> SdpPayload {
        SdpPayload {
            kind: SdpKind::Offer,
            sdp: "remote-offer".to_string(),
        }
    }

    fn answer_payload() -> SdpPayload {
        SdpPayload {
            kind: SdpKind::Answer,
            sdp: "remote-answer".to_string(),
        }
    }

    #[tokio::test]
    async fn test_creator_sends_exactly_one_initial_offer() {
        let (mut negotiator, probe, _rx) = negotiator(Role::Creator);
        let mut tracks = controller(vec![]);

        let first = negotiator.start_offer(&mut tracks).await.unwrap();
        assert!(matches!(first, Some(SignalMessage::Offer { .. })));
        assert!(negotiator.initial_offer_sent());
        assert!(negotiator.awaiting_answer());

        let second = negotiator.start_offer(&mut tracks).await.unwrap();
        assert!(second.is_none());
        assert_eq!(probe.offers.load(Ordering::SeqCst), 1);
        assert_eq!(probe.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_joiner_never_starts_the_initial_offer() {
        let (mut negotiator, probe, _rx) = negotiator(Role::Joiner);
        let mut tracks = controller(vec![]);
        assert!(negotiator.start_offer(&mut tracks).await.unwrap().is_none());
        assert!(!negotiator.has_peer());
        assert_eq!(probe.offers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_early_candidates_flush_in_arrival_order() {
        let (mut negotiator, probe, _rx) = negotiator(Role::Joiner);
        let mut tracks = controller(vec![]);

        for line in ["cand-1", "cand-2", "cand-3"] {
            negotiator.handle_candidate(candidate(line)).await.unwrap();
        }
        assert_eq!(negotiator.pending_candidates(), 3);
        assert!(!negotiator.has_peer());

        let reply = negotiator
            .handle_offer(offer_payload(), &mut tracks)
            .await
            .unwrap();
        assert!(matches!(reply, Some(SignalMessage::Answer { .. })));
        assert_eq!(negotiator.pending_candidates(), 0);
        assert_eq!(
            *probe.candidates.lock().unwrap(),
            vec!["cand-1", "cand-2", "cand-3"]
        );

        // Later candidates skip the buffer entirely.
        negotiator.handle_candidate(candidate("cand-4")).await.unwrap();
        assert_eq!(negotiator.pending_candidates(), 0);
        assert_eq!(probe.candidates.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_answer_without_outstanding_offer_is_ignored() {
        let (mut negotiator, probe, _rx) = negotiator(Role::Joiner);
        negotiator.handle_answer(answer_payload()).await.unwrap();
        assert!(probe.remote_descriptions.lock().unwrap().is_empty());
        assert!(!negotiator.exchange_complete());
    }

    #[tokio::test]
    async fn test_answer_applies_when_an_offer_is_outstanding() {
        let (mut negotiator, probe, _rx) = negotiator(Role::Creator);
        let mut tracks = controller(vec![]);
        negotiator.start_offer(&mut tracks).await.unwrap();
        negotiator.handle_candidate(candidate("early")).await.unwrap();

        negotiator.handle_answer(answer_payload()).await.unwrap();
        assert!(!negotiator.awaiting_answer());
        assert!(negotiator.exchange_complete());
        let descriptions = probe.remote_descriptions.lock().unwrap();
        assert_eq!(descriptions.len(), 1);
        assert_eq!(descriptions[0].kind, SdpKind::Answer);
        drop(descriptions);
        assert_eq!(*probe.candidates.lock().unwrap(), vec!["early"]);

        // A duplicate answer no longer has an outstanding offer to match.
        negotiator.handle_answer(answer_payload()).await.unwrap();
        assert_eq!(probe.remote_descriptions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_glare_offer_is_dropped_while_awaiting_answer() {
        let (mut negotiator, probe, _rx) = negotiator(Role::Creator);
        let mut tracks = controller(vec![]);
        negotiator.start_offer(&mut tracks).await.unwrap();

        let reply = negotiator
            .handle_offer(offer_payload(), &mut tracks)
            .await
            .unwrap();
        assert!(reply.is_none());
        assert!(probe.remote_descriptions.lock().unwrap().is_empty());
        assert!(negotiator.awaiting_answer());
    }

    #[tokio::test]
    async fn test_creator_answers_renegotiation_offers_after_the_exchange() {
        let (mut negotiator, probe, _rx) = negotiator(Role::Creator);
        let mut tracks = controller(vec![]);
        negotiator.start_offer(&mut tracks).await.unwrap();
        negotiator.handle_answer(answer_payload()).await.unwrap();

        let reply = negotiator
            .handle_offer(offer_payload(), &mut tracks)
            .await
            .unwrap();
        assert!(matches!(reply, Some(SignalMessage::Answer { .. })));
        assert_eq!(probe.remote_descriptions.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_renegotiation_is_joiner_only_and_gated_on_the_exchange() {
        let (mut creator, _creator_probe, _rx_a) = negotiator(Role::Creator);
        let mut creator_tracks = controller(vec![]);
        creator.start_offer(&mut creator_tracks).await.unwrap();
        assert!(creator
            .handle_negotiation_needed(&mut creator_tracks)
            .await
            .unwrap()
            .is_none());

        let (mut joiner, probe, _rx_b) = negotiator(Role::Joiner);
        let mut tracks = controller(vec![]);
        assert!(joiner
            .handle_negotiation_needed(&mut tracks)
            .await
            .unwrap()
            .is_none());

        joiner
            .handle_offer(offer_payload(), &mut tracks)
            .await
            .unwrap();
        let reply = joiner
            .handle_negotiation_needed(&mut tracks)
            .await
            .unwrap();
        assert!(matches!(reply, Some(SignalMessage::Offer { .. })));
        assert!(joiner.awaiting_answer());
        assert_eq!(probe.offers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_buffered_candidates_do_not_wedge_the_queue() {
        let (mut negotiator, probe, _rx) = negotiator(Role::Joiner);
        let mut tracks = controller(vec![]);
        probe.fail_candidates.store(true, Ordering::SeqCst);

        negotiator.handle_candidate(candidate("bad-1")).await.unwrap();
        negotiator.handle_candidate(candidate("bad-2")).await.unwrap();

        let reply = negotiator
            .handle_offer(offer_payload(), &mut tracks)
            .await
            .unwrap();
        assert!(matches!(reply, Some(SignalMessage::Answer { .. })));
        assert_eq!(negotiator.pending_candidates(), 0);

        // Direct applies surface the error for the caller to log and drop.
        let result = negotiator.handle_candidate(candidate("bad-3")).await;
        assert!(matches!(result, Err(NegotiationError::Peer(_))));
    }

    #[tokio::test]
    async fn test_tracks_attach_once_across_negotiation_rounds() {
        let (mut negotiator, probe, _rx) = negotiator(Role::Joiner);
        let mut tracks = controller(vec!["audio-0", "video-1"]);
        tracks.acquire().await.unwrap();

        negotiator
            .handle_offer(offer_payload(), &mut tracks)
            .await
            .unwrap();
        assert_eq!(
            *probe.tracks.lock().unwrap(),
            vec!["audio-0", "video-1"]
        );

        negotiator
            .handle_negotiation_needed(&mut tracks)
            .await
            .unwrap();
        assert_eq!(probe.tracks.lock().unwrap().len(), 2);
        assert_eq!(probe.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_clears_buffers() {
        let (mut negotiator, probe, _rx) = negotiator(Role::Creator);
        let mut tracks = controller(vec![]);
        negotiator.start_offer(&mut tracks).await.unwrap();
        negotiator.handle_candidate(candidate("late")).await.unwrap();

        negotiator.close().await;
        assert!(probe.closed.load(Ordering::SeqCst));
        assert!(!negotiator.has_peer());
        assert_eq!(negotiator.pending_candidates(), 0);
        negotiator.close().await;
    }
}
