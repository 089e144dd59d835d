//! The poller-side per-participant state machine.
//!
//! One machine runs per invited voter, driving that voter through the
//! message exchange. The machine is a pure transition table: `step` maps a
//! state and an event to the next state plus side effects, and the session
//! interprets the effects. No I/O happens here, which keeps the protocol
//! logic identical whether events are processed synchronously or dispatched
//! through an actor mailbox.

/// Machine states, in protocol order. `Error` is the terminal sink for
/// unexpected events; it drops only this participant, never the poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollerState {
    ProveIntroEffort,
    SendPoll,
    WaitPollAck,
    VerifyPollAckEffort,
    ProveRemainingEffort,
    SendPollProof,
    WaitNominate,
    SendVoteRequest,
    WaitVote,
    TallyVote,
    SendReceipt,
    Finalize,
    Error,
}

/// Why a participant left the poll early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    Declined,
    BadEffort,
    Deadline,
    Protocol,
}

/// Internal completions and inbound messages, already stripped to what the
/// table needs; payloads live in the participant record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerEvent {
    Start,
    IntroEffortProven,
    PollSent,
    AckReceived { accept: bool },
    AckEffortOk,
    AckEffortBad,
    RemainingEffortProven,
    PollProofSent,
    NominateReceived,
    VoteRequestSent,
    VoteReceived,
    /// One of this participant's blocks was consumed by the merge.
    BlockTallied,
    /// The merge has fully consumed this participant's vote stream.
    VoiceExhausted,
    /// A repair arrived while tallying.
    RepairReceived,
    /// The poll is closing; receipts go out.
    PollClosing,
    ReceiptSent,
    /// The governing deadline of the current wait state expired.
    Deadline,
    /// Malformed or out-of-place message.
    BadMessage,
}

/// Side effects the session must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerEffect {
    ProveIntroEffort,
    SendPoll,
    VerifyAckEffort,
    ProveRemainingEffort,
    SendPollProof,
    SendVoteRequest,
    ProcessRepair,
    SendReceipt,
    Drop(DropReason),
    Finalize,
    Checkpoint,
}

/// The transition table. Every unmatched (state, event) pair falls through
/// to the error row.
pub fn step(state: PollerState, event: PollerEvent) -> (PollerState, Vec<PollerEffect>) {
    use PollerEffect::*;
    use PollerEvent as E;
    use PollerState as S;

    match (state, event) {
        (S::ProveIntroEffort, E::Start) => (S::ProveIntroEffort, vec![ProveIntroEffort]),
        (S::ProveIntroEffort, E::IntroEffortProven) => (S::SendPoll, vec![SendPoll]),
        (S::SendPoll, E::PollSent) => (S::WaitPollAck, vec![Checkpoint]),

        (S::WaitPollAck, E::AckReceived { accept: true }) => {
            (S::VerifyPollAckEffort, vec![VerifyAckEffort])
        }
        (S::WaitPollAck, E::AckReceived { accept: false }) => {
            (S::Finalize, vec![Drop(DropReason::Declined), Finalize])
        }

        (S::VerifyPollAckEffort, E::AckEffortOk) => {
            (S::ProveRemainingEffort, vec![ProveRemainingEffort, Checkpoint])
        }
        (S::VerifyPollAckEffort, E::AckEffortBad) => {
            (S::Error, vec![Drop(DropReason::BadEffort), Finalize])
        }

        (S::ProveRemainingEffort, E::RemainingEffortProven) => {
            (S::SendPollProof, vec![SendPollProof])
        }
        (S::SendPollProof, E::PollProofSent) => (S::WaitNominate, vec![Checkpoint]),

        (S::WaitNominate, E::NominateReceived) => {
            (S::SendVoteRequest, vec![SendVoteRequest, Checkpoint])
        }
        (S::SendVoteRequest, E::VoteRequestSent) => (S::WaitVote, vec![]),

        (S::WaitVote, E::VoteReceived) => (S::TallyVote, vec![Checkpoint]),

        // The tally loop: stay until the voice is exhausted, accepting
        // repair detours.
        (S::TallyVote, E::BlockTallied) => (S::TallyVote, vec![]),
        (S::TallyVote, E::RepairReceived) => (S::TallyVote, vec![ProcessRepair]),
        (S::TallyVote, E::VoiceExhausted) => (S::SendReceipt, vec![]),

        (S::SendReceipt, E::RepairReceived) => (S::SendReceipt, vec![ProcessRepair]),
        (S::SendReceipt, E::PollClosing) => (S::SendReceipt, vec![SendReceipt]),
        (S::SendReceipt, E::ReceiptSent) => (S::Finalize, vec![Finalize, Checkpoint]),

        // Terminal states absorb everything.
        (S::Finalize, _) => (S::Finalize, vec![]),
        (S::Error, _) => (S::Error, vec![]),

        // A poll closing early (no quorum, expiry, abort) still owes a
        // receipt to everyone who voted; earlier states finalize quietly.
        (S::TallyVote, E::PollClosing) => (S::SendReceipt, vec![SendReceipt]),
        (_, E::PollClosing) => (S::Finalize, vec![Finalize]),

        // Deadlines in any wait state drop the participant.
        (_, E::Deadline) => (S::Error, vec![Drop(DropReason::Deadline), Finalize]),

        // The else row: unexpected message or missing field.
        (_, _) => (S::Error, vec![Drop(DropReason::Protocol), Finalize]),
    }
}

#[cfg(test)]
mod test {
    use super::PollerEffect::*;
    use super::PollerEvent as E;
    use super::PollerState as S;
    use super::*;

    /// Drives the machine through the happy path and checks the effect
    /// sequence at each step.
    #[test]
    fn test_happy_path() {
        let steps = vec![
            (S::ProveIntroEffort, E::Start, S::ProveIntroEffort),
            (S::ProveIntroEffort, E::IntroEffortProven, S::SendPoll),
            (S::SendPoll, E::PollSent, S::WaitPollAck),
            (S::WaitPollAck, E::AckReceived { accept: true }, S::VerifyPollAckEffort),
            (S::VerifyPollAckEffort, E::AckEffortOk, S::ProveRemainingEffort),
            (S::ProveRemainingEffort, E::RemainingEffortProven, S::SendPollProof),
            (S::SendPollProof, E::PollProofSent, S::WaitNominate),
            (S::WaitNominate, E::NominateReceived, S::SendVoteRequest),
            (S::SendVoteRequest, E::VoteRequestSent, S::WaitVote),
            (S::WaitVote, E::VoteReceived, S::TallyVote),
            (S::TallyVote, E::BlockTallied, S::TallyVote),
            (S::TallyVote, E::VoiceExhausted, S::SendReceipt),
            (S::SendReceipt, E::PollClosing, S::SendReceipt),
            (S::SendReceipt, E::ReceiptSent, S::Finalize),
        ];
        for (state, event, expected) in steps {
            let (next, _) = step(state, event);
            assert_eq!(next, expected, "{:?} x {:?}", state, event);
        }
    }

    #[test]
    fn test_decline_drops_participant() {
        let (next, effects) = step(S::WaitPollAck, E::AckReceived { accept: false });
        assert_eq!(next, S::Finalize);
        assert!(effects.contains(&Drop(DropReason::Declined)));
    }

    #[test]
    fn test_unexpected_message_goes_to_error() {
        // A vote arriving while we wait for an ack is a protocol error.
        let (next, effects) = step(S::WaitPollAck, E::VoteReceived);
        assert_eq!(next, S::Error);
        assert!(effects.contains(&Drop(DropReason::Protocol)));
        assert!(effects.contains(&Finalize));
    }

    #[test]
    fn test_deadline_in_wait_states() {
        for state in [S::WaitPollAck, S::WaitNominate, S::WaitVote].iter() {
            let (next, effects) = step(*state, E::Deadline);
            assert_eq!(next, S::Error);
            assert!(effects.contains(&Drop(DropReason::Deadline)));
        }
    }

    #[test]
    fn test_terminal_states_absorb() {
        let (next, effects) = step(S::Finalize, E::VoteReceived);
        assert_eq!(next, S::Finalize);
        assert!(effects.is_empty());
        let (next, effects) = step(S::Error, E::Deadline);
        assert_eq!(next, S::Error);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_early_close_still_sends_receipt_to_voted() {
        // A no-quorum or expired close reaches voted participants mid-tally.
        let (next, effects) = step(S::TallyVote, E::PollClosing);
        assert_eq!(next, S::SendReceipt);
        assert_eq!(effects, vec![SendReceipt]);
        // Peers that never voted finalize without a receipt.
        let (next, effects) = step(S::WaitVote, E::PollClosing);
        assert_eq!(next, S::Finalize);
        assert_eq!(effects, vec![Finalize]);
    }

    #[test]
    fn test_repair_detour_stays_in_tally() {
        let (next, effects) = step(S::TallyVote, E::RepairReceived);
        assert_eq!(next, S::TallyVote);
        assert_eq!(effects, vec![ProcessRepair]);
    }
}
