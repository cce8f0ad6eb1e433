use baton::{Baton, BatonName, Bus, Parameters, Role, TcpBus};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::test;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(10);

pub struct TestBatond {
    node: Option<batond::Node>,
}

impl TestBatond {
    pub fn new() -> anyhow::Result<Self> {
        let node = batond::Node::new(batond::Parameters::builder().build())?;
        Ok(Self { node: Some(node) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.node
            .as_ref()
            .expect("Node was already dropped")
            .get_ctrl()
            .local_addr()
    }

    /// Every baton gets its own connection, like separate processes would
    pub async fn new_baton(&self, id: &str) -> anyhow::Result<Baton> {
        let bus: Arc<dyn Bus> = Arc::new(TcpBus::connect(self.local_addr()).await?);
        Self::start_baton(bus, id).await
    }

    async fn start_baton(bus: Arc<dyn Bus>, id: &str) -> anyhow::Result<Baton> {
        let params = Parameters::builder()
            .name(BatonName::new("sanity")?)
            .instance_id(id.into())
            .election_timeout(Duration::from_millis(100))
            .recheck_interval(Duration::from_millis(50))
            .build();
        Ok(Baton::start(bus, params).await?)
    }
}

impl Drop for TestBatond {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            node.get_ctrl().stop();
        }
    }
}

fn holders(batons: &[&Baton]) -> Vec<String> {
    batons
        .iter()
        .filter(|b| b.role() == Role::Holding)
        .map(|b| b.id().to_string())
        .collect()
}

/// Wait until exactly one of `batons` holds the baton, and it's not `previous`
async fn wait_for_holder(batons: &[&Baton], previous: Option<&str>) -> anyhow::Result<String> {
    timeout(WAIT, async {
        loop {
            if let [holder] = holders(batons).as_slice() {
                if Some(holder.as_str()) != previous {
                    return holder.clone();
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .map_err(Into::into)
}

#[test(flavor = "multi_thread")]
async fn sanity_three_claimants() -> anyhow::Result<()> {
    let server = TestBatond::new()?;

    let a = server.new_baton("A").await?;
    let b = server.new_baton("B").await?;
    let c = server.new_baton("C").await?;
    let all = [&a, &b, &c];

    let mut claims = vec![];
    for baton in all {
        claims.push(baton.claim().await?.expect("not claiming yet"));
    }

    let first = wait_for_holder(&all, None).await?;
    sleep(Duration::from_millis(500)).await;
    assert_eq!(holders(&all), [first.clone()]);

    let holder = all
        .iter()
        .find(|b| b.id().as_str() == first)
        .expect("holder is one of us");
    assert!(holder.release().await?);

    let second = wait_for_holder(&all, Some(&first)).await?;
    assert_ne!(first, second);

    for baton in [a, b, c] {
        baton.unload().await?;
    }

    Ok(())
}

#[test(flavor = "multi_thread")]
async fn sanity_holder_disconnects() -> anyhow::Result<()> {
    let server = TestBatond::new()?;

    let a = server.new_baton("A").await?;
    let b = server.new_baton("B").await?;

    let mut a_claim = a.claim().await?.expect("not claiming yet");
    timeout(WAIT, a_claim.elected()).await??;
    let mut b_claim = b.claim().await?.expect("not claiming yet");

    a.unload().await?;

    timeout(WAIT, b_claim.elected()).await??;
    assert_eq!(b.role(), Role::Holding);

    Ok(())
}

#[test(flavor = "multi_thread")]
async fn sanity_shared_connection() -> anyhow::Result<()> {
    let server = TestBatond::new()?;
    let bus: Arc<dyn Bus> = Arc::new(TcpBus::connect(server.local_addr()).await?);

    let a = TestBatond::start_baton(Arc::clone(&bus), "A").await?;
    let b = TestBatond::start_baton(Arc::clone(&bus), "B").await?;
    let c = server.new_baton("C").await?;

    let mut a_claim = a.claim().await?.expect("not claiming yet");
    timeout(WAIT, a_claim.elected()).await??;
    let mut b_claim = b.claim().await?.expect("not claiming yet");

    assert!(a.release().await?);
    timeout(WAIT, b_claim.elected()).await??;
    assert_eq!(holders(&[&a, &b, &c]), ["B"]);

    // leaving doesn't take the other member of the connection with it
    a.unload().await?;
    assert!(b.release().await?);
    let mut c_claim = c.claim().await?.expect("not claiming yet");
    timeout(WAIT, c_claim.elected()).await??;
    let mut b_claim = b.claim().await?.expect("not claiming anymore");
    assert!(c.release().await?);
    timeout(WAIT, b_claim.elected()).await??;

    Ok(())
}
