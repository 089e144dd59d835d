//! The voter-side state machine, mirroring the poller's table.
//!
//! The one structural difference from the poller side is the vote gate: a
//! vote request and local hash completion can arrive in either order, and
//! the vote goes out only once both have. The two intermediate states make
//! that explicit, so the invariant is visible in the table rather than in
//! session bookkeeping.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoterState {
    VerifyPollEffort,
    ProvePollAck,
    SendPollAck,
    WaitPollProof,
    VerifyPollProof,
    SendNominate,
    GenerateVote,
    HashedAwaitingRequest,
    RequestedAwaitingHash,
    SendVote,
    WaitReceipt,
    ProcessReceipt,
    Finalize,
    Declined,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoterEvent {
    Start,
    PollEffortOk,
    PollEffortBad,
    Accepted,
    DeclinedPoll,
    AckEffortProven,
    PollAckSent,
    PollProofReceived,
    PollProofOk,
    PollProofBad,
    NominateSent,
    HashingDone,
    HashingFailed,
    VoteRequested,
    VoteSent,
    RepairRequested,
    ReceiptReceived,
    ReceiptProcessed,
    Deadline,
    BadMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoterEffect {
    VerifyPollEffort,
    DecideParticipation,
    ProveAckEffort,
    SendPollAck,
    SendDecline,
    VerifyPollProof,
    SendNominate,
    StartHash,
    SendVote,
    ServeRepair,
    RecordReceipt,
    Finalize,
}

pub fn step(state: VoterState, event: VoterEvent) -> (VoterState, Vec<VoterEffect>) {
    use VoterEffect::*;
    use VoterEvent as E;
    use VoterState as S;

    match (state, event) {
        (S::VerifyPollEffort, E::Start) => (S::VerifyPollEffort, vec![VerifyPollEffort]),
        (S::VerifyPollEffort, E::PollEffortOk) => (S::VerifyPollEffort, vec![DecideParticipation]),
        // A malformed invitation still gets a polite decline.
        (S::VerifyPollEffort, E::PollEffortBad) => (S::Declined, vec![SendDecline, Finalize]),
        (S::VerifyPollEffort, E::Accepted) => (S::ProvePollAck, vec![ProveAckEffort]),
        (S::VerifyPollEffort, E::DeclinedPoll) => (S::Declined, vec![SendDecline, Finalize]),

        (S::ProvePollAck, E::AckEffortProven) => (S::SendPollAck, vec![SendPollAck]),
        (S::SendPollAck, E::PollAckSent) => (S::WaitPollProof, vec![]),

        (S::WaitPollProof, E::PollProofReceived) => (S::VerifyPollProof, vec![VerifyPollProof]),
        (S::VerifyPollProof, E::PollProofOk) => (S::SendNominate, vec![SendNominate, StartHash]),
        (S::VerifyPollProof, E::PollProofBad) => (S::Error, vec![Finalize]),

        (S::SendNominate, E::NominateSent) => (S::GenerateVote, vec![]),

        // The vote gate: both the request and the finished hash are needed,
        // in either order.
        (S::GenerateVote, E::HashingDone) => (S::HashedAwaitingRequest, vec![]),
        (S::GenerateVote, E::VoteRequested) => (S::RequestedAwaitingHash, vec![]),
        (S::HashedAwaitingRequest, E::VoteRequested) => (S::SendVote, vec![SendVote]),
        (S::RequestedAwaitingHash, E::HashingDone) => (S::SendVote, vec![SendVote]),
        (S::GenerateVote, E::HashingFailed) => (S::Error, vec![Finalize]),
        (S::RequestedAwaitingHash, E::HashingFailed) => (S::Error, vec![Finalize]),

        (S::SendVote, E::VoteSent) => (S::WaitReceipt, vec![]),

        (S::WaitReceipt, E::RepairRequested) => (S::WaitReceipt, vec![ServeRepair]),
        (S::WaitReceipt, E::ReceiptReceived) => (S::ProcessReceipt, vec![RecordReceipt]),
        (S::ProcessReceipt, E::ReceiptProcessed) => (S::Finalize, vec![Finalize]),

        (S::Finalize, _) => (S::Finalize, vec![]),
        (S::Declined, _) => (S::Declined, vec![]),
        (S::Error, _) => (S::Error, vec![]),

        (_, E::Deadline) => (S::Error, vec![Finalize]),
        (_, _) => (S::Error, vec![Finalize]),
    }
}

#[cfg(test)]
mod test {
    use super::VoterEffect::*;
    use super::VoterEvent as E;
    use super::VoterState as S;
    use super::*;

    #[test]
    fn test_happy_path_request_after_hash() {
        let steps = vec![
            (S::VerifyPollEffort, E::Start, S::VerifyPollEffort),
            (S::VerifyPollEffort, E::PollEffortOk, S::VerifyPollEffort),
            (S::VerifyPollEffort, E::Accepted, S::ProvePollAck),
            (S::ProvePollAck, E::AckEffortProven, S::SendPollAck),
            (S::SendPollAck, E::PollAckSent, S::WaitPollProof),
            (S::WaitPollProof, E::PollProofReceived, S::VerifyPollProof),
            (S::VerifyPollProof, E::PollProofOk, S::SendNominate),
            (S::SendNominate, E::NominateSent, S::GenerateVote),
            (S::GenerateVote, E::HashingDone, S::HashedAwaitingRequest),
            (S::HashedAwaitingRequest, E::VoteRequested, S::SendVote),
            (S::SendVote, E::VoteSent, S::WaitReceipt),
            (S::WaitReceipt, E::ReceiptReceived, S::ProcessReceipt),
            (S::ProcessReceipt, E::ReceiptProcessed, S::Finalize),
        ];
        for (state, event, expected) in steps {
            let (next, _) = step(state, event);
            assert_eq!(next, expected, "{:?} x {:?}", state, event);
        }
    }

    #[test]
    fn test_vote_never_sent_before_hash_completes() {
        // A vote request arriving first must not trigger the send.
        let (next, effects) = step(S::GenerateVote, E::VoteRequested);
        assert_eq!(next, S::RequestedAwaitingHash);
        assert!(!effects.contains(&SendVote));

        let (next, effects) = step(next, E::HashingDone);
        assert_eq!(next, S::SendVote);
        assert_eq!(effects, vec![SendVote]);
    }

    #[test]
    fn test_decline_path() {
        let (next, effects) = step(S::VerifyPollEffort, E::DeclinedPoll);
        assert_eq!(next, S::Declined);
        assert_eq!(effects, vec![SendDecline, Finalize]);
        // Declined absorbs later traffic.
        let (next, effects) = step(next, E::PollProofReceived);
        assert_eq!(next, S::Declined);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_repair_service_loop() {
        let (next, effects) = step(S::WaitReceipt, E::RepairRequested);
        assert_eq!(next, S::WaitReceipt);
        assert_eq!(effects, vec![ServeRepair]);
    }

    #[test]
    fn test_deadline_and_bad_message() {
        let (next, effects) = step(S::WaitPollProof, E::Deadline);
        assert_eq!(next, S::Error);
        assert_eq!(effects, vec![Finalize]);

        let (next, _) = step(S::GenerateVote, E::ReceiptReceived);
        assert_eq!(next, S::Error);
    }

    #[test]
    fn test_hash_failure_aborts() {
        let (next, effects) = step(S::RequestedAwaitingHash, E::HashingFailed);
        assert_eq!(next, S::Error);
        assert_eq!(effects, vec![Finalize]);
    }
}
