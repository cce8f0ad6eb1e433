//! Election messages
//!
//! Every message is a JSON object `{"op": ..., "data": {...}}` sent on the
//! baton's channel. Replies that only matter to one proposer (`promise`,
//! `nack`, and `accepted` in the optimized mode) still travel over the
//! broadcast channel and are filtered by `proposerId` on the receiving side.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{InstanceId, ProposalNumber};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "op", content = "data")]
pub enum Message {
    /// Paxos phase 1a, broadcast by a proposer
    #[serde(rename = "prepare!")]
    Prepare(Proposal),
    /// Paxos phase 1b, an acceptor's promise to the proposer
    #[serde(rename = "promise")]
    Promise(Promise),
    /// Acceptor telling the proposer it already saw something newer
    #[serde(rename = "nack")]
    Nack(Nack),
    /// Paxos phase 2a, the proposer's pick for the winner
    #[serde(rename = "accept!")]
    Accept(Acceptance),
    /// Paxos phase 2b
    #[serde(rename = "accepted")]
    Accepted(Acceptance),
    /// The holder let go of the baton
    #[serde(rename = "release")]
    Release(ReleaseNotice),
}

impl Message {
    /// Name of the operation, as it appears on the wire
    pub fn op(&self) -> &'static str {
        match self {
            Message::Prepare(_) => "prepare!",
            Message::Promise(_) => "promise",
            Message::Nack(_) => "nack",
            Message::Accept(_) => "accept!",
            Message::Accepted(_) => "accepted",
            Message::Release(_) => "release",
        }
    }

    /// Largest proposal number the message carries
    pub fn max_number(&self) -> ProposalNumber {
        match self {
            Message::Prepare(p) => p.number,
            Message::Promise(p) => p.proposal_number.max(p.number.unwrap_or_default()),
            Message::Nack(n) => n.proposal_number.max(n.number),
            Message::Accept(a) | Message::Accepted(a) => a.number,
            Message::Release(_) => ProposalNumber::ZERO,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("can't fail")
    }

    pub fn from_json(s: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(s)?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub number: ProposalNumber,
    pub proposer_id: InstanceId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Promise {
    /// The proposal being promised
    pub proposal_number: ProposalNumber,
    pub proposer_id: InstanceId,
    pub acceptor_id: InstanceId,
    /// Acceptor would like to hold the baton
    #[serde(default)]
    pub candidate: bool,
    /// Number of the acceptance the acceptor currently holds, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<ProposalNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<InstanceId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Nack {
    /// The proposal being refused
    pub proposal_number: ProposalNumber,
    pub proposer_id: InstanceId,
    /// Best proposal number the acceptor has seen
    #[serde(default)]
    pub number: ProposalNumber,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Acceptance {
    pub number: ProposalNumber,
    pub proposer_id: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<InstanceId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseNotice {
    pub instance_id: InstanceId,
}

#[test]
fn message_wire_shape() {
    let prepare = Message::Prepare(Proposal {
        number: ProposalNumber(3),
        proposer_id: InstanceId::from("A"),
    });
    assert_eq!(
        prepare.to_json(),
        r#"{"op":"prepare!","data":{"number":3,"proposerId":"A"}}"#
    );

    let accept = Message::Accept(Acceptance {
        number: ProposalNumber(4),
        proposer_id: InstanceId::from("B"),
        winner: None,
    });
    assert_eq!(
        accept.to_json(),
        r#"{"op":"accept!","data":{"number":4,"proposerId":"B"}}"#
    );
}

#[test]
fn message_decoding() {
    let promise = Message::from_json(
        r#"{"op":"promise","data":{"proposalNumber":2,"proposerId":"A","acceptorId":"C","number":1,"winner":"B"}}"#,
    )
    .unwrap();
    assert_eq!(
        promise,
        Message::Promise(Promise {
            proposal_number: ProposalNumber(2),
            proposer_id: InstanceId::from("A"),
            acceptor_id: InstanceId::from("C"),
            candidate: false,
            number: Some(ProposalNumber(1)),
            winner: Some(InstanceId::from("B")),
        })
    );

    // explicit `null` winner, as older participants send it
    let accepted =
        Message::from_json(r#"{"op":"accepted","data":{"number":2,"proposerId":"A","winner":null}}"#)
            .unwrap();
    assert_eq!(accepted.op(), "accepted");

    assert!(Message::from_json(r#"{"op":"vote","data":{}}"#).is_err());
    assert!(Message::from_json("not json").is_err());
}
