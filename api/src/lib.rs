use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod net;
pub use self::net::*;

mod msg;
pub use self::msg::*;

/// Prefix of the pub/sub channel a baton election runs on
///
/// The full channel name is the prefix followed by the [`BatonName`].
pub const CHANNEL_PREFIX: &str = "io.highfidelity.virtualBaton:";

/// Name of a baton
///
/// Any string agreed upon by the cooperating participants. Only one
/// of them at a time holds the baton of a given name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatonName(String);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("a baton must have a non-empty name")]
pub struct InvalidBatonName;

impl BatonName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidBatonName> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidBatonName);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Pub/sub channel the election for this baton runs on
    pub fn channel(&self) -> String {
        format!("{CHANNEL_PREFIX}{}", self.0)
    }
}

/// Identity of one participant
///
/// Unique per running participant. Used both as the proposer id and as
/// the identity of the elected winner.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Paxos proposal number
///
/// Each proposer picks numbers strictly greater than anything it has seen.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProposalNumber(pub u64);

impl ProposalNumber {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    /// `None` once the numbers run out
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

#[test]
fn proposal_number_does_not_wrap() {
    assert_eq!(ProposalNumber::ZERO.next(), Some(ProposalNumber(1)));
    assert_eq!(ProposalNumber::MAX.next(), None);
}

#[test]
fn baton_name_must_not_be_empty() {
    assert_eq!(BatonName::new(""), Err(InvalidBatonName));

    let name = BatonName::new("tribble").unwrap();
    assert_eq!(name.as_str(), "tribble");
    assert_eq!(name.channel(), "io.highfidelity.virtualBaton:tribble");
}
