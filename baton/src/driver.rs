use baton_api::{BatonName, InstanceId, Message};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, sleep_until, Instant};
use tracing::{debug, info, trace, warn};
use typed_builder::TypedBuilder;

use crate::bus::{Bus, Members, Subscription};
use crate::participant::{Effect, Effects, Participant, Role};
use crate::{Error, Result};

/// Runtime parameters of a [`Baton`]
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    pub name: BatonName,

    /// Identity among all participants of this baton
    #[builder(default = Parameters::random_instance_id())]
    pub instance_id: InstanceId,

    /// If there is no winner in this time, hold a new election
    #[builder(default = Parameters::DEFAULT_ELECTION_TIMEOUT)]
    pub election_timeout: Duration,
    #[builder(default = Parameters::DEFAULT_ELECTION_TIMEOUT_JITTER)]
    pub election_timeout_jitter: f64,

    /// How often to check that the holder is still connected
    #[builder(default = Parameters::DEFAULT_RECHECK_INTERVAL)]
    pub recheck_interval: Duration,
    #[builder(default = Parameters::DEFAULT_RECHECK_INTERVAL_JITTER)]
    pub recheck_interval_jitter: f64,

    /// Learn acceptances locally instead of broadcasting them
    ///
    /// Must be the same for all participants of a baton.
    #[builder(default = true)]
    pub use_optimizations: bool,
}

impl Parameters {
    pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const DEFAULT_ELECTION_TIMEOUT_JITTER: f64 = 0.5;
    pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_millis(500);
    pub const DEFAULT_RECHECK_INTERVAL_JITTER: f64 = 0.2;

    pub fn random_instance_id() -> InstanceId {
        InstanceId::new(format!("{:032x}", rand::random::<u128>()))
    }
}

/// `base` +/- `variability` of it, so participants don't act in lockstep
fn randomize(base: Duration, variability: f64) -> Duration {
    let deviation = base.as_secs_f64() * variability.clamp(0.0, 1.0);
    let secs = base.as_secs_f64() - deviation + rand::thread_rng().gen::<f64>() * 2.0 * deviation;
    Duration::from_secs_f64(secs.max(0.0))
}

enum Command {
    Claim(oneshot::Sender<Option<ClaimReceivers>>),
    Release(oneshot::Sender<bool>),
    Cancel(oneshot::Sender<()>),
    Unload(oneshot::Sender<()>),
}

struct ClaimSenders {
    elected: Option<oneshot::Sender<()>>,
    released: Option<oneshot::Sender<()>>,
}

struct ClaimReceivers {
    elected: oneshot::Receiver<()>,
    released: oneshot::Receiver<()>,
}

/// A pending or successful claim of a baton
///
/// Dropping it does not withdraw the claim, use [`Claim::cancel`].
pub struct Claim {
    name: BatonName,
    elected: Option<oneshot::Receiver<()>>,
    is_elected: bool,
    released: Option<oneshot::Receiver<()>>,
    is_released: bool,
    cmd_tx: flume::Sender<Command>,
}

impl Claim {
    pub fn name(&self) -> &BatonName {
        &self.name
    }

    /// Wait until we hold the baton
    ///
    /// Fails with [`Error::Cancelled`] if the claim was withdrawn first.
    pub async fn elected(&mut self) -> Result<()> {
        if let Some(rx) = self.elected.as_mut() {
            let res = rx.await;
            self.elected = None;
            self.is_elected = res.is_ok();
        }
        if self.is_elected {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    /// Wait until we no longer hold the baton, whether released by us or
    /// by the others
    pub async fn released(&mut self) -> Result<()> {
        if let Some(rx) = self.released.as_mut() {
            let res = rx.await;
            self.released = None;
            self.is_released = res.is_ok();
        }
        if self.is_released {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    /// Withdraw the claim, releasing the baton if we already hold it
    pub async fn cancel(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send_async(Command::Cancel(tx))
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }
}

/// Participant of one baton's election, running on a tokio task
///
/// Dropping it unloads it, like [`Baton::unload`] without waiting.
pub struct Baton {
    name: BatonName,
    id: InstanceId,
    cmd_tx: flume::Sender<Command>,
    role_rx: watch::Receiver<Role>,
    join_handle: Option<JoinHandle<()>>,
}

impl Baton {
    pub async fn start(bus: Arc<dyn Bus>, params: Parameters) -> Result<Self> {
        info!(
            baton = %params.name,
            id = %params.instance_id,
            election_timeout = ?params.election_timeout,
            "Starting virtual baton"
        );
        let channel = params.name.channel();
        let subscription = bus.join(&channel, &params.instance_id).await?;

        let participant = Participant::new(params.name.clone(), params.instance_id.clone())
            .with_optimizations(params.use_optimizations);
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (role_tx, role_rx) = watch::channel(Role::Idle);

        let task = BatonTask {
            bus,
            channel,
            participant,
            subscription,
            deadline: None,
            claim: None,
            role_tx,
            params: params.clone(),
        };
        let join_handle = tokio::spawn(task.run(cmd_rx));

        Ok(Self {
            name: params.name,
            id: params.instance_id,
            cmd_tx,
            role_rx,
            join_handle: Some(join_handle),
        })
    }

    pub fn name(&self) -> &BatonName {
        &self.name
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn role(&self) -> Role {
        *self.role_rx.borrow()
    }

    /// Observe our role as it changes
    pub fn state(&self) -> watch::Receiver<Role> {
        self.role_rx.clone()
    }

    async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send_async(cmd(tx))
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    /// Register the intent to hold the baton
    ///
    /// Returns `None` (and logs) if we are already claiming or holding it.
    pub async fn claim(&self) -> Result<Option<Claim>> {
        let receivers = self.request(Command::Claim).await?;
        Ok(receivers.map(|r| Claim {
            name: self.name.clone(),
            elected: Some(r.elected),
            is_elected: false,
            released: Some(r.released),
            is_released: false,
            cmd_tx: self.cmd_tx.clone(),
        }))
    }

    /// Release the baton; `false` (and a log) if we don't hold it
    pub async fn release(&self) -> Result<bool> {
        self.request(Command::Release).await
    }

    /// Leave the baton's channel and stop
    ///
    /// Does not release the baton; the others will notice we are gone.
    pub async fn unload(mut self) -> Result<()> {
        self.request(Command::Unload).await?;
        if let Some(join_handle) = self.join_handle.take() {
            if let Err(e) = join_handle.await {
                warn!(error = %e, "Baton task failed");
            }
        }
        Ok(())
    }
}

impl Drop for Baton {
    fn drop(&mut self) {
        if self.join_handle.is_some() {
            // Outstanding `Claim`s keep the command channel open, so tell
            // the task explicitly
            let (tx, _rx) = oneshot::channel();
            let _ = self.cmd_tx.try_send(Command::Unload(tx));
        }
    }
}

struct BatonTask {
    bus: Arc<dyn Bus>,
    channel: String,
    params: Parameters,
    participant: Participant,
    subscription: Subscription,
    /// When the election timeout fires
    deadline: Option<Instant>,
    claim: Option<ClaimSenders>,
    role_tx: watch::Sender<Role>,
}

impl BatonTask {
    async fn run(mut self, cmd_rx: flume::Receiver<Command>) {
        let mut recheck = time::interval(
            randomize(
                self.params.recheck_interval,
                self.params.recheck_interval_jitter,
            )
            .max(Duration::from_millis(1)),
        );

        loop {
            let deadline = self.deadline;
            let effects = tokio::select! {
                cmd = cmd_rx.recv_async() => match cmd {
                    Ok(Command::Unload(reply)) => {
                        self.unload().await;
                        let _ = reply.send(());
                        return;
                    }
                    Ok(cmd) => self.handle_command(cmd),
                    Err(_) => {
                        debug!(baton = %self.params.name, "All handles dropped");
                        self.unload().await;
                        return;
                    }
                },
                payload = self.subscription.messages.recv_async() => match payload {
                    Ok(payload) => self.handle_payload(&payload),
                    Err(_) => {
                        warn!(baton = %self.params.name, "Bus subscription closed");
                        return;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.deadline = None;
                    let members = self.members();
                    self.participant.on_election_timeout(&members)
                },
                _ = recheck.tick() => {
                    let members = self.members();
                    self.participant.recheck(&members)
                },
            };

            self.apply(effects).await;
        }
    }

    fn members(&self) -> Members {
        self.subscription.members.borrow().clone()
    }

    fn handle_command(&mut self, cmd: Command) -> Effects {
        let members = self.members();
        match cmd {
            Command::Claim(reply) => {
                let was_idle = self.participant.role() == Role::Idle;
                let effects = self.participant.claim(&members);
                if was_idle {
                    let (elected_tx, elected_rx) = oneshot::channel();
                    let (released_tx, released_rx) = oneshot::channel();
                    self.claim = Some(ClaimSenders {
                        elected: Some(elected_tx),
                        released: Some(released_tx),
                    });
                    let _ = reply.send(Some(ClaimReceivers {
                        elected: elected_rx,
                        released: released_rx,
                    }));
                } else {
                    let _ = reply.send(None);
                }
                effects
            }
            Command::Release(reply) => {
                let effects = self.participant.release(&members);
                let _ = reply.send(!effects.is_empty());
                effects
            }
            Command::Cancel(reply) => {
                let effects = self.participant.cancel(&members);
                if !effects.contains(&Effect::Released) {
                    // withdrawn before being elected
                    self.claim = None;
                }
                let _ = reply.send(());
                effects
            }
            Command::Unload(_) => unreachable!("handled in the main loop"),
        }
    }

    fn handle_payload(&mut self, payload: &str) -> Effects {
        match Message::from_json(payload) {
            Ok(msg) => {
                let members = self.members();
                self.participant.handle(msg, &members)
            }
            Err(e) => {
                warn!(baton = %self.params.name, error = %e, "Dropping unrecognized message");
                vec![]
            }
        }
    }

    async fn apply(&mut self, effects: Effects) {
        for effect in effects {
            match effect {
                Effect::Send(msg) => {
                    trace!(baton = %self.params.name, op = msg.op(), "send");
                    if let Err(e) = self.bus.publish(&self.channel, msg.to_json()).await {
                        warn!(baton = %self.params.name, error = %e, "Failed to publish");
                    }
                }
                Effect::ArmElectionTimeout => {
                    self.deadline = Some(
                        Instant::now()
                            + randomize(
                                self.params.election_timeout,
                                self.params.election_timeout_jitter,
                            ),
                    );
                }
                Effect::CancelElectionTimeout => self.deadline = None,
                Effect::Elected => {
                    if let Some(tx) = self.claim.as_mut().and_then(|c| c.elected.take()) {
                        let _ = tx.send(());
                    }
                }
                Effect::Released => {
                    if let Some(tx) = self.claim.take().and_then(|mut c| c.released.take()) {
                        let _ = tx.send(());
                    }
                }
            }
        }

        let role = self.participant.role();
        if *self.role_tx.borrow() != role {
            self.role_tx.send_replace(role);
        }
    }

    async fn unload(&mut self) {
        if let Err(e) = self.bus.leave(&self.channel, self.participant.id()).await {
            warn!(baton = %self.params.name, error = %e, "Failed to leave channel");
        }
        self.claim = None;
        self.deadline = None;
        debug!(baton = %self.params.name, id = %self.participant.id(), "unload");
    }
}

#[test]
fn randomize_stays_within_variability() {
    let base = Duration::from_millis(1000);
    for _ in 0..100 {
        let d = randomize(base, 0.5);
        assert!(Duration::from_millis(500) <= d && d <= Duration::from_millis(1500));
    }
    assert_eq!(randomize(base, 0.0), base);
}
