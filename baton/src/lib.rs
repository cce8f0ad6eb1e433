//! Virtual baton
//!
//! Lets cooperating participants pass a "virtual baton" between them: a
//! named token that at most one of them holds at a time. Participants run
//! a Paxos-style election over a broadcast [`Bus`] to agree on the holder,
//! and hold a new election when the holder releases the baton or goes away.
//!
//! [`Participant`] is the election itself as a plain state machine.
//! [`Baton`] drives one on a tokio task against a [`Bus`].
pub mod bus;
mod driver;
pub mod participant;

mod error {
    use ::std::io;
    use baton_api::FrameError;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("io error: {0}")]
        Io(#[from] io::Error),
        #[error("data decoding error: {0}")]
        Decoding(#[from] binrw::Error),
        #[error("frame error: {0}")]
        Frame(#[from] FrameError),
        #[error("invalid protocol version: {0}")]
        ProtocolVersion(u8),
        #[error("bus disconnected")]
        Disconnected,
        #[error("claim ended without election")]
        Cancelled,
        #[error("baton is not running")]
        Stopped,
    }
}

pub use self::bus::{Bus, LocalBus, Members, Subscription, TcpBus};
pub use self::driver::{Baton, Claim, Parameters};
pub use self::error::Error;
pub use self::participant::{Effect, Membership, Participant, Role};
pub use baton_api::{BatonName, InstanceId};

pub type Result<T> = ::std::result::Result<T, Error>;
