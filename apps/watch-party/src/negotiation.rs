//! Offer/answer state machine for the offering side of a watch party.
//!
//! Signaling records can arrive in any order and occasionally twice. The
//! session tolerates candidates ahead of the answer by buffering them until
//! the remote description is applied, and ignores every answer after the
//! first.

use std::collections::HashSet;
use std::fmt;

use signal_bus::{IceCandidate, PeerId, SdpType, SignalKind, SignalingRecord};
use tracing::{debug, info, warn};

use crate::error::{Result, WatchPartyError};
use crate::ice_queue::{DrainReport, IceCandidateQueue};
use crate::peer::{Connectivity, PeerConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    Negotiated,
    Connected,
    Failed,
}

impl NegotiationState {
    /// Single place where legal transitions are defined.
    pub fn can_transition_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Idle, Offering)
            | (Offering, AwaitingAnswer)
            | (AwaitingAnswer, Negotiated)
            | (Negotiated, Connected) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == NegotiationState::Failed
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::AwaitingAnswer => "awaiting_answer",
            NegotiationState::Negotiated => "negotiated",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
}

/// What a single inbound record did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    AnswerApplied(DrainReport),
    DuplicateAnswer,
    CandidateBuffered,
    CandidateApplied,
    CandidateRejected,
    DuplicateCandidate,
    PeerEnded,
    Ignored,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub applied: usize,
    pub rejected: usize,
}

#[derive(Debug)]
enum CandidateRouting {
    Buffering(IceCandidateQueue),
    Direct,
}

#[derive(Debug)]
pub struct NegotiationSession {
    role: Role,
    state: NegotiationState,
    local_peer: PeerId,
    remote_peer: PeerId,
    has_answered: bool,
    remote_description_set: bool,
    routing: CandidateRouting,
    seen_candidates: HashSet<IceCandidate>,
    stats: CandidateStats,
    offer_was_sent: bool,
}

impl NegotiationSession {
    pub fn new(local_peer: PeerId, remote_peer: PeerId) -> Self {
        Self {
            role: Role::Offerer,
            state: NegotiationState::Idle,
            local_peer,
            remote_peer,
            has_answered: false,
            remote_description_set: false,
            routing: CandidateRouting::Buffering(IceCandidateQueue::new()),
            seen_candidates: HashSet::new(),
            stats: CandidateStats::default(),
            offer_was_sent: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    pub fn has_answered(&self) -> bool {
        self.has_answered
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        match &self.routing {
            CandidateRouting::Buffering(queue) => queue.len(),
            CandidateRouting::Direct => 0,
        }
    }

    pub fn candidate_stats(&self) -> CandidateStats {
        self.stats
    }

    /// Whether the local offer has been published to the peer.
    pub fn offer_published(&self) -> bool {
        self.offer_was_sent
    }

    fn transition(&mut self, next: NegotiationState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(WatchPartyError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(
            peer = %self.remote_peer,
            from = %self.state,
            to = %next,
            "negotiation transition"
        );
        self.state = next;
        Ok(())
    }

    pub fn begin_offer(&mut self) -> Result<()> {
        self.transition(NegotiationState::Offering)
    }

    pub fn offer_sent(&mut self) -> Result<()> {
        self.transition(NegotiationState::AwaitingAnswer)?;
        self.offer_was_sent = true;
        Ok(())
    }

    /// Applies one inbound signaling record.
    ///
    /// Errors are setup failures (the remote description was rejected) and
    /// are fatal for the session. Per-candidate failures are not errors.
    pub async fn handle_record(
        &mut self,
        record: &SignalingRecord,
        connection: &dyn PeerConnection,
    ) -> Result<RecordOutcome> {
        if self.state.is_terminal() {
            return Ok(RecordOutcome::Ignored);
        }
        if record.from != self.remote_peer || record.to != self.local_peer {
            debug!(from = %record.from, to = %record.to, "ignoring record for another call");
            return Ok(RecordOutcome::Ignored);
        }

        match record.kind {
            SignalKind::Answer => self.handle_answer(record, connection).await,
            SignalKind::Candidate => match record.ice_candidate() {
                Some(candidate) => Ok(self.handle_candidate(candidate.clone(), connection).await),
                None => {
                    warn!(peer = %self.remote_peer, "candidate record without candidate");
                    Ok(RecordOutcome::Ignored)
                }
            },
            SignalKind::End => {
                info!(peer = %self.remote_peer, "peer ended the watch party");
                self.fail();
                Ok(RecordOutcome::PeerEnded)
            }
            SignalKind::Offer => {
                debug!(peer = %self.remote_peer, "ignoring offer; this side always offers");
                Ok(RecordOutcome::Ignored)
            }
        }
    }

    async fn handle_answer(
        &mut self,
        record: &SignalingRecord,
        connection: &dyn PeerConnection,
    ) -> Result<RecordOutcome> {
        if self.has_answered {
            debug!(peer = %self.remote_peer, "duplicate answer ignored");
            return Ok(RecordOutcome::DuplicateAnswer);
        }
        let Some(description) = record.description() else {
            warn!(peer = %self.remote_peer, "answer record without session description");
            return Ok(RecordOutcome::Ignored);
        };
        if description.sdp_type != SdpType::Answer {
            warn!(peer = %self.remote_peer, sdp_type = ?description.sdp_type, "answer record carries a non-answer description");
            return Ok(RecordOutcome::Ignored);
        }
        if self.state != NegotiationState::AwaitingAnswer {
            debug!(peer = %self.remote_peer, state = %self.state, "answer before offer was published");
            return Ok(RecordOutcome::Ignored);
        }

        self.has_answered = true;
        connection
            .set_remote_description(description.clone())
            .await?;
        self.remote_description_set = true;
        self.transition(NegotiationState::Negotiated)?;

        let routing = std::mem::replace(&mut self.routing, CandidateRouting::Direct);
        let report = match routing {
            CandidateRouting::Buffering(queue) => {
                queue
                    .drain_into(|candidate| connection.add_ice_candidate(candidate))
                    .await
            }
            CandidateRouting::Direct => DrainReport::default(),
        };
        self.stats.applied += report.applied;
        self.stats.rejected += report.failed;
        info!(
            peer = %self.remote_peer,
            drained = report.applied,
            skipped = report.failed,
            "remote answer applied"
        );
        Ok(RecordOutcome::AnswerApplied(report))
    }

    async fn handle_candidate(
        &mut self,
        candidate: IceCandidate,
        connection: &dyn PeerConnection,
    ) -> RecordOutcome {
        if !self.seen_candidates.insert(candidate.clone()) {
            return RecordOutcome::DuplicateCandidate;
        }
        match &mut self.routing {
            CandidateRouting::Buffering(queue) => {
                queue.enqueue(candidate);
                RecordOutcome::CandidateBuffered
            }
            CandidateRouting::Direct => {
                let label = candidate.candidate.clone();
                match connection.add_ice_candidate(candidate).await {
                    Ok(()) => {
                        self.stats.applied += 1;
                        RecordOutcome::CandidateApplied
                    }
                    Err(err) => {
                        warn!(candidate = %label, error = %err, "failed to apply remote ice candidate");
                        self.stats.rejected += 1;
                        RecordOutcome::CandidateRejected
                    }
                }
            }
        }
    }

    /// Returns `ConnectivityLost` once the transport reports failed/closed.
    pub fn on_connectivity(&mut self, connectivity: Connectivity) -> Result<bool> {
        if connectivity.is_terminal() {
            if self.fail() {
                return Err(WatchPartyError::ConnectivityLost(format!(
                    "ice connection {connectivity:?}"
                )));
            }
            return Ok(false);
        }
        if connectivity.is_connected() {
            return Ok(self.mark_connected());
        }
        Ok(false)
    }

    /// First remote media counts as connectivity.
    pub fn on_remote_media(&mut self) -> bool {
        self.mark_connected()
    }

    pub fn on_channel_open(&mut self) -> bool {
        self.mark_connected()
    }

    fn mark_connected(&mut self) -> bool {
        if self.state == NegotiationState::Negotiated {
            self.state = NegotiationState::Connected;
            info!(peer = %self.remote_peer, "peer connected");
            true
        } else {
            false
        }
    }

    /// Moves to `Failed`. Returns false if the session had already failed.
    pub fn fail(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        debug!(peer = %self.remote_peer, from = %self.state, "negotiation failed");
        self.state = NegotiationState::Failed;
        self.routing = CandidateRouting::Direct;
        true
    }
}
