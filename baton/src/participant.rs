//! Election participant
//!
//! Every participant plays all the Paxos roles at once: it proposes when it
//! wants the baton (or needs to hand it on), accepts other proposals, and
//! learns the outcome. [`Participant`] is a plain state machine: each entry
//! point takes an input, mutates the state and returns the [`Effect`]s the
//! caller is expected to carry out (sending messages, arming or cancelling
//! the election timeout, notifying the user). It never does any IO itself.
use baton_api::{
    Acceptance, BatonName, InstanceId, Message, Nack, Promise, Proposal, ProposalNumber,
    ReleaseNotice,
};
use tracing::{debug, error, info, trace, warn};

/// View of who is currently taking part in the election of a baton
pub trait Membership {
    /// Number of participants, used to size the quorum
    fn count(&self) -> usize;
    /// Is `id` still connected
    fn contains(&self, id: &InstanceId) -> bool;
}

/// What the participant wants from the baton
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Role {
    /// Not interested
    #[default]
    Idle,
    /// Waiting to be elected
    Claiming,
    /// Elected, until released
    Holding,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Broadcast a message on the baton's channel
    Send(Message),
    /// (Re)start the election timeout; when it fires call
    /// [`Participant::on_election_timeout`]
    ArmElectionTimeout,
    CancelElectionTimeout,
    /// We are now the holder
    Elected,
    /// We stopped being the holder
    Released,
}

pub type Effects = Vec<Effect>;

/// Is proposal number `a` better than `b`
///
/// Only the numbers are compared; the proposer id does not break ties, so
/// two equal numbers from different proposers are not better than each other.
pub fn better_number(a: ProposalNumber, b: ProposalNumber) -> bool {
    a > b
}

#[derive(Clone, Debug, Default)]
struct BestPromise {
    number: ProposalNumber,
    winner: Option<InstanceId>,
}

pub struct Participant {
    name: BatonName,
    id: InstanceId,
    /// Learn acceptances locally instead of broadcasting `accepted`
    use_optimizations: bool,
    role: Role,

    // Proposer
    proposal_number: ProposalNumber,
    n_quorum: usize,
    best_promise: BestPromise,
    /// Best number reported back in nacks
    highest_nacked: ProposalNumber,
    n_promises: usize,
    n_accepted: usize,
    n_nack: usize,
    /// Acceptor that most recently told us it wants the baton
    interested: Option<InstanceId>,
    /// Election timeout is armed
    election_pending: bool,

    // Acceptor
    best_proposal: Option<Proposal>,
    accepted: Option<Acceptance>,
}

impl Participant {
    pub fn new(name: BatonName, id: InstanceId) -> Self {
        Self {
            name,
            id,
            use_optimizations: true,
            role: Role::default(),
            proposal_number: ProposalNumber::ZERO,
            n_quorum: 0,
            best_promise: BestPromise::default(),
            highest_nacked: ProposalNumber::ZERO,
            n_promises: 0,
            n_accepted: 0,
            n_nack: 0,
            interested: None,
            election_pending: false,
            best_proposal: None,
            accepted: None,
        }
    }

    /// All participants of a baton must use the same setting
    pub fn with_optimizations(mut self, enabled: bool) -> Self {
        self.use_optimizations = enabled;
        self
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn name(&self) -> &BatonName {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn proposal_number(&self) -> ProposalNumber {
        self.proposal_number
    }

    pub fn is_election_pending(&self) -> bool {
        self.election_pending
    }

    pub fn accepted(&self) -> Option<&Acceptance> {
        self.accepted.as_ref()
    }

    /// Who we believe holds the baton
    pub fn holder(&self) -> Option<&InstanceId> {
        self.accepted.as_ref().and_then(|a| a.winner.as_ref())
    }

    fn best_proposal_number(&self) -> ProposalNumber {
        self.best_proposal
            .as_ref()
            .map_or(ProposalNumber::ZERO, |p| p.number)
    }

    /// Register the intent to hold the baton
    ///
    /// [`Effect::Elected`] is returned (now or from a later call) once we win,
    /// which may be never.
    pub fn claim(&mut self, members: &dyn Membership) -> Effects {
        let mut effects = vec![];
        match self.role {
            Role::Claiming => {
                warn!(
                    baton = %self.name,
                    "Ignoring attempt to claim virtual baton, which is already waiting for claim"
                );
            }
            Role::Holding => {
                warn!(
                    baton = %self.name,
                    "Ignoring attempt to claim virtual baton, which is already held"
                );
            }
            Role::Idle => {
                debug!(baton = %self.name, id = %self.id, "claim");
                self.role = Role::Claiming;
                self.propose(members, &mut effects);
            }
        }
        effects
    }

    /// Let go of the baton we hold
    pub fn release(&mut self, members: &dyn Membership) -> Effects {
        let mut effects = vec![];
        if self.holder() != Some(&self.id) {
            info!(
                baton = %self.name,
                "Ignoring attempt to release virtual baton, which is not being held"
            );
            return effects;
        }
        debug!(baton = %self.name, id = %self.id, "release");

        self.local_release(&mut effects);
        let id = self.id.clone();
        self.forget_winner(&id);
        effects.push(Effect::Send(Message::Release(ReleaseNotice { instance_id: id })));

        if self.role != Role::Claiming {
            // elect someone else among those still interested
            self.propose(members, &mut effects);
        }
        effects
    }

    /// Withdraw a claim, or release the baton if already elected
    pub fn cancel(&mut self, members: &dyn Membership) -> Effects {
        match self.role {
            Role::Claiming => {
                debug!(baton = %self.name, id = %self.id, "claim cancelled");
                self.role = Role::Idle;
                vec![]
            }
            Role::Holding => self.release(members),
            Role::Idle => vec![],
        }
    }

    pub fn on_election_timeout(&mut self, members: &dyn Membership) -> Effects {
        debug!(
            baton = %self.name,
            id = %self.id,
            proposal = %self.proposal_number,
            "No winner within election timeout"
        );
        self.election_pending = false;
        let mut effects = vec![];
        self.propose(members, &mut effects);
        effects
    }

    /// Check that the holder we are waiting on is still around
    pub fn recheck(&mut self, members: &dyn Membership) -> Effects {
        let mut effects = vec![];
        if self.role != Role::Claiming || self.election_pending {
            return effects;
        }
        let Some(holder) = self.holder().cloned() else {
            return effects;
        };
        if !members.contains(&holder) {
            info!(baton = %self.name, %holder, "Holder disconnected, starting new election");
            self.best_promise.winner = None;
            self.propose(members, &mut effects);
        }
        effects
    }

    pub fn handle(&mut self, msg: Message, members: &dyn Membership) -> Effects {
        trace!(baton = %self.name, id = %self.id, op = msg.op(), ?msg, "receive");
        let mut effects = vec![];
        // nobody could ever propose anything newer
        if msg.max_number() == ProposalNumber::MAX {
            warn!(baton = %self.name, id = %self.id, op = msg.op(), "Dropping message with exhausted proposal number");
            return effects;
        }
        match msg {
            Message::Prepare(proposal) => self.on_prepare(proposal, members, &mut effects),
            Message::Promise(promise) => {
                if promise.proposer_id == self.id {
                    self.on_promise(promise, &mut effects);
                }
            }
            Message::Nack(nack) => {
                if nack.proposer_id == self.id {
                    self.on_nack(nack);
                }
            }
            Message::Accept(acceptance) => self.on_accept(acceptance, members, &mut effects),
            Message::Accepted(acceptance) => {
                // with optimizations every acceptor learns on its own and only
                // reports back to the proposer
                if !self.use_optimizations || acceptance.proposer_id == self.id {
                    self.learn(acceptance, members, &mut effects);
                }
            }
            Message::Release(notice) => self.on_release(notice, members, &mut effects),
        }
        effects
    }

    /// Start a new round, unless one is already in progress
    fn propose(&mut self, members: &dyn Membership, effects: &mut Effects) {
        if self.election_pending {
            trace!(baton = %self.name, id = %self.id, "Election already in progress");
            return;
        }
        let Some(proposal_number) = self
            .proposal_number
            .max(self.best_promise.number)
            .max(self.best_proposal_number())
            .max(self.highest_nacked)
            .next()
        else {
            error!(baton = %self.name, id = %self.id, "Proposal numbers exhausted");
            return;
        };
        self.election_pending = true;
        effects.push(Effect::ArmElectionTimeout);

        let n_acceptors = members.count().max(1);
        self.n_quorum = n_acceptors / 2 + 1;
        self.proposal_number = proposal_number;

        debug!(
            baton = %self.name,
            id = %self.id,
            proposal = %self.proposal_number,
            claim = self.role == Role::Claiming,
            n_acceptors,
            prev_promises = self.n_promises,
            prev_accepted = self.n_accepted,
            prev_nack = self.n_nack,
            "propose"
        );
        self.n_promises = 0;
        self.n_accepted = 0;
        self.n_nack = 0;
        self.interested = None;

        effects.push(Effect::Send(Message::Prepare(Proposal {
            number: self.proposal_number,
            proposer_id: self.id.clone(),
        })));
    }

    fn on_prepare(&mut self, proposal: Proposal, members: &dyn Membership, effects: &mut Effects) {
        let best = self.best_proposal_number();
        if !better_number(proposal.number, best) {
            effects.push(Effect::Send(Message::Nack(Nack {
                proposal_number: proposal.number,
                proposer_id: proposal.proposer_id,
                number: best,
            })));
            return;
        }

        let (number, winner) = match &self.accepted {
            Some(Acceptance {
                number,
                winner: Some(winner),
                ..
            }) if members.contains(winner) => (Some(*number), Some(winner.clone())),
            _ => (None, None),
        };
        let promise = Promise {
            proposal_number: proposal.number,
            proposer_id: proposal.proposer_id.clone(),
            acceptor_id: self.id.clone(),
            candidate: self.role != Role::Idle,
            number,
            winner,
        };
        self.best_proposal = Some(proposal);
        effects.push(Effect::Send(Message::Promise(promise)));
    }

    fn on_promise(&mut self, promise: Promise, effects: &mut Effects) {
        if let Some(number) = promise.number {
            if better_number(number, self.best_promise.number) {
                self.best_promise = BestPromise {
                    number,
                    winner: promise.winner.clone(),
                };
            }
        }

        if promise.proposal_number != self.proposal_number {
            // reply to one of our previous rounds
            return;
        }
        if promise.candidate && promise.acceptor_id != self.id {
            self.interested = Some(promise.acceptor_id);
        }

        self.n_promises += 1;
        if self.n_promises != self.n_quorum {
            return;
        }

        let winner = self.pick_winner();
        debug!(
            baton = %self.name,
            id = %self.id,
            proposal = %self.proposal_number,
            winner = ?winner,
            "Quorum of promises"
        );
        effects.push(Effect::Send(Message::Accept(Acceptance {
            number: self.proposal_number,
            proposer_id: self.id.clone(),
            winner,
        })));
    }

    /// The current holder stays; otherwise we take it if we want it, or
    /// hand it to whoever last said they are interested
    fn pick_winner(&self) -> Option<InstanceId> {
        match &self.best_promise.winner {
            Some(winner) if *winner != self.id => Some(winner.clone()),
            _ if self.role != Role::Idle => Some(self.id.clone()),
            _ => self.interested.clone(),
        }
    }

    fn on_nack(&mut self, nack: Nack) {
        self.highest_nacked = self.highest_nacked.max(nack.number);
        if nack.proposal_number == self.proposal_number {
            self.n_nack += 1;
            trace!(
                baton = %self.name,
                proposal = %self.proposal_number,
                n_nack = self.n_nack,
                "nack"
            );
        }
    }

    fn on_accept(&mut self, acceptance: Acceptance, members: &dyn Membership, effects: &mut Effects) {
        let best = self.best_proposal_number();
        if better_number(best, acceptance.number) {
            effects.push(Effect::Send(Message::Nack(Nack {
                proposal_number: acceptance.number,
                proposer_id: acceptance.proposer_id,
                number: best,
            })));
            return;
        }
        // we might have missed the prepare
        self.best_proposal = Some(Proposal {
            number: acceptance.number,
            proposer_id: acceptance.proposer_id.clone(),
        });

        if self.use_optimizations {
            let report = (acceptance.proposer_id != self.id)
                .then(|| Message::Accepted(acceptance.clone()));
            self.learn(acceptance, members, effects);
            if let Some(report) = report {
                effects.push(Effect::Send(report));
            }
        } else {
            effects.push(Effect::Send(Message::Accepted(acceptance)));
        }
    }

    fn learn(&mut self, acceptance: Acceptance, members: &dyn Membership, effects: &mut Effects) {
        let old_winner = match &self.accepted {
            Some(current) if better_number(current.number, acceptance.number) => {
                trace!(baton = %self.name, number = %acceptance.number, "Stale acceptance");
                return;
            }
            Some(current) => current.winner.clone(),
            None => None,
        };
        debug!(
            baton = %self.name,
            id = %self.id,
            number = %acceptance.number,
            winner = ?acceptance.winner,
            "accepted"
        );

        let is_own_round =
            acceptance.proposer_id == self.id && acceptance.number == self.proposal_number;
        let winner = acceptance.winner.clone();
        self.accepted = Some(acceptance);

        if is_own_round {
            self.n_accepted += 1;
            if self.election_pending && self.n_quorum <= self.n_accepted {
                self.election_pending = false;
                effects.push(Effect::CancelElectionTimeout);
            }
        }

        if winner.as_ref() == Some(&self.id) {
            match self.role {
                Role::Claiming => {
                    info!(baton = %self.name, id = %self.id, "Elected");
                    self.role = Role::Holding;
                    effects.push(Effect::Elected);
                }
                Role::Holding => {}
                Role::Idle => {
                    debug!(
                        baton = %self.name,
                        id = %self.id,
                        "Won, but no longer interested"
                    );
                    self.propose(members, effects);
                }
            }
            return;
        }

        if self.role == Role::Holding && old_winner.as_ref() == Some(&self.id) {
            info!(baton = %self.name, id = %self.id, winner = ?winner, "Released by others");
            self.local_release(effects);
        }
        if self.role == Role::Claiming && winner.is_none() {
            self.propose(members, effects);
        }
    }

    fn on_release(&mut self, notice: ReleaseNotice, members: &dyn Membership, effects: &mut Effects) {
        debug!(baton = %self.name, id = %self.id, releaser = %notice.instance_id, "release");
        self.forget_winner(&notice.instance_id);
        if self.role == Role::Claiming && notice.instance_id != self.id {
            self.propose(members, effects);
        }
    }

    fn local_release(&mut self, effects: &mut Effects) {
        if self.role == Role::Holding {
            self.role = Role::Idle;
            effects.push(Effect::Released);
        }
    }

    fn forget_winner(&mut self, id: &InstanceId) {
        if let Some(accepted) = self.accepted.as_mut() {
            if accepted.winner.as_ref() == Some(id) {
                accepted.winner = None;
            }
        }
        if self.best_promise.winner.as_ref() == Some(id) {
            self.best_promise.winner = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Members;

    fn members(ids: &[&str]) -> Members {
        ids.iter().copied().map(InstanceId::from).collect()
    }

    fn participant(id: &str) -> Participant {
        Participant::new(BatonName::new("test").unwrap(), InstanceId::from(id))
    }

    fn sent(effects: &[Effect]) -> Vec<&Message> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    fn only_promise(effects: &[Effect]) -> Promise {
        match sent(effects)[..] {
            [Message::Promise(promise)] => promise.clone(),
            _ => panic!("expected a single promise, got {effects:?}"),
        }
    }

    fn prepare(number: u64, proposer: &str) -> Message {
        Message::Prepare(Proposal {
            number: ProposalNumber(number),
            proposer_id: InstanceId::from(proposer),
        })
    }

    #[test]
    fn claim_sends_prepare_and_arms_timeout() {
        let mut a = participant("A");
        let effects = a.claim(&members(&["A", "B", "C"]));

        assert_eq!(effects[0], Effect::ArmElectionTimeout);
        assert_eq!(sent(&effects), vec![&prepare(1, "A")]);
        assert_eq!(a.role(), Role::Claiming);
    }

    #[test]
    fn claim_while_claiming_is_ignored() {
        let mut a = participant("A");
        let all = members(&["A", "B"]);
        a.claim(&all);

        assert!(a.claim(&all).is_empty());
        assert_eq!(a.proposal_number(), ProposalNumber(1));
    }

    #[test]
    fn release_while_not_holding_is_ignored() {
        let mut a = participant("A");
        let all = members(&["A", "B"]);
        assert!(a.release(&all).is_empty());

        a.claim(&all);
        assert!(a.release(&all).is_empty());
        assert_eq!(a.role(), Role::Claiming);
    }

    #[test]
    fn timeout_retries_with_greater_number() {
        let mut a = participant("A");
        let all = members(&["A", "B", "C"]);
        a.claim(&all);

        let effects = a.on_election_timeout(&all);
        assert_eq!(effects[0], Effect::ArmElectionTimeout);
        assert_eq!(sent(&effects), vec![&prepare(2, "A")]);
    }

    #[test]
    fn exhausted_proposal_numbers_are_dropped() {
        let mut a = participant("A");
        let all = members(&["A", "B", "C"]);
        a.claim(&all);

        let effects = a.handle(
            Message::Nack(Nack {
                proposal_number: ProposalNumber(1),
                proposer_id: InstanceId::from("A"),
                number: ProposalNumber::MAX,
            }),
            &all,
        );
        assert!(effects.is_empty());
        assert!(a.handle(prepare(u64::MAX, "B"), &all).is_empty());

        let effects = a.on_election_timeout(&all);
        assert_eq!(sent(&effects), vec![&prepare(2, "A")]);

        // just below the limit still works, once
        a.handle(
            Message::Nack(Nack {
                proposal_number: ProposalNumber(2),
                proposer_id: InstanceId::from("A"),
                number: ProposalNumber(u64::MAX - 1),
            }),
            &all,
        );
        let effects = a.on_election_timeout(&all);
        assert_eq!(sent(&effects), vec![&prepare(u64::MAX, "A")]);
        assert!(a.on_election_timeout(&all).is_empty());
        assert_eq!(a.role(), Role::Claiming);
    }

    #[test]
    fn equal_numbers_from_other_proposer_are_not_better() {
        let mut c = participant("C");
        let all = members(&["A", "B", "C"]);

        let effects = c.handle(prepare(1, "A"), &all);
        assert!(matches!(sent(&effects)[..], [Message::Promise(_)]));

        let effects = c.handle(prepare(1, "B"), &all);
        assert_eq!(
            sent(&effects),
            vec![&Message::Nack(Nack {
                proposal_number: ProposalNumber(1),
                proposer_id: InstanceId::from("B"),
                number: ProposalNumber(1),
            })]
        );
    }

    #[test]
    fn promise_carries_connected_winner_only() {
        let mut c = participant("C");
        let all = members(&["A", "B", "C"]);
        c.handle(
            Message::Accept(Acceptance {
                number: ProposalNumber(1),
                proposer_id: InstanceId::from("A"),
                winner: Some(InstanceId::from("A")),
            }),
            &all,
        );

        let promise = only_promise(&c.handle(prepare(2, "B"), &all));
        assert_eq!(promise.winner, Some(InstanceId::from("A")));
        assert_eq!(promise.number, Some(ProposalNumber(1)));

        let without_a = members(&["B", "C"]);
        let promise = only_promise(&c.handle(prepare(3, "B"), &without_a));
        assert_eq!(promise.winner, None);
    }

    #[test]
    fn single_participant_elects_itself() {
        let mut a = participant("A");
        let only_a = members(&["A"]);

        let mut inbox: Vec<Message> = sent(&a.claim(&only_a)).into_iter().cloned().collect();
        let mut elected = 0;
        while let Some(msg) = inbox.pop() {
            let effects = a.handle(msg, &only_a);
            elected += effects.iter().filter(|e| **e == Effect::Elected).count();
            inbox.extend(sent(&effects).into_iter().cloned());
        }

        assert_eq!(elected, 1);
        assert_eq!(a.role(), Role::Holding);
        assert_eq!(a.holder(), Some(&InstanceId::from("A")));
        assert!(!a.is_election_pending());
    }

    #[test]
    fn holder_released_when_other_winner_accepted() {
        let mut a = participant("A");
        let all = members(&["A", "B"]);
        a.claim(&all);
        a.handle(
            Message::Accept(Acceptance {
                number: ProposalNumber(1),
                proposer_id: InstanceId::from("A"),
                winner: Some(InstanceId::from("A")),
            }),
            &all,
        );
        assert_eq!(a.role(), Role::Holding);

        let effects = a.handle(
            Message::Accept(Acceptance {
                number: ProposalNumber(2),
                proposer_id: InstanceId::from("B"),
                winner: Some(InstanceId::from("B")),
            }),
            &all,
        );
        assert!(effects.contains(&Effect::Released));
        assert_eq!(a.role(), Role::Idle);
    }

    #[test]
    fn stale_accept_is_nacked() {
        let mut a = participant("A");
        let all = members(&["A", "B"]);
        a.handle(prepare(5, "B"), &all);

        let effects = a.handle(
            Message::Accept(Acceptance {
                number: ProposalNumber(3),
                proposer_id: InstanceId::from("C"),
                winner: Some(InstanceId::from("C")),
            }),
            &all,
        );
        assert!(matches!(sent(&effects)[..], [Message::Nack(_)]));
        assert_eq!(a.holder(), None);
    }

    #[test]
    fn recheck_replaces_disconnected_holder() {
        let mut b = participant("B");
        let all = members(&["A", "B"]);
        b.claim(&all);
        b.handle(
            Message::Accept(Acceptance {
                number: ProposalNumber(1),
                proposer_id: InstanceId::from("A"),
                winner: Some(InstanceId::from("A")),
            }),
            &all,
        );
        // still waiting on our own round
        assert!(b.recheck(&members(&["B"])).is_empty());

        b.election_pending = false;
        assert!(b.recheck(&all).is_empty());

        let effects = b.recheck(&members(&["B"]));
        assert!(matches!(sent(&effects)[..], [Message::Prepare(_)]));
    }

    #[test]
    fn cancel_withdraws_claim() {
        let mut a = participant("A");
        let all = members(&["A", "B"]);
        a.claim(&all);
        assert!(a.cancel(&all).is_empty());
        assert_eq!(a.role(), Role::Idle);

        let promise = only_promise(&a.handle(prepare(7, "B"), &all));
        assert!(!promise.candidate);
    }
}
