use baton::{Baton, BatonName, Error, LocalBus, Parameters, Role};
use std::sync::Arc;
use std::time::Duration;
use tokio::test;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
    // `RUST_LOG=baton=trace` to see the election
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start(bus: &LocalBus, id: &str) -> anyhow::Result<Baton> {
    init_logging();
    let params = Parameters::builder()
        .name(BatonName::new("test")?)
        .instance_id(id.into())
        .election_timeout(Duration::from_millis(50))
        .recheck_interval(Duration::from_millis(20))
        .build();
    Ok(Baton::start(Arc::new(bus.clone()), params).await?)
}

fn holders(batons: &[&Baton]) -> usize {
    batons.iter().filter(|b| b.role() == Role::Holding).count()
}

#[test]
async fn lone_claim_is_elected() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let a = start(&bus, "A").await?;

    let mut claim = a.claim().await?.expect("not claiming yet");
    timeout(WAIT, claim.elected()).await??;
    assert_eq!(a.role(), Role::Holding);
    assert_eq!(claim.name().as_str(), "test");

    Ok(())
}

#[test]
async fn concurrent_claims_elect_one() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let a = start(&bus, "A").await?;
    let b = start(&bus, "B").await?;
    let c = start(&bus, "C").await?;

    let mut claims = vec![];
    for baton in [&a, &b, &c] {
        claims.push(baton.claim().await?.expect("not claiming yet"));
    }

    timeout(WAIT, async {
        while holders(&[&a, &b, &c]) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    // let a few election timeouts pass
    sleep(Duration::from_millis(300)).await;
    assert_eq!(holders(&[&a, &b, &c]), 1);

    Ok(())
}

#[test]
async fn release_hands_baton_to_next_claimant() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let a = start(&bus, "A").await?;
    let b = start(&bus, "B").await?;

    let mut a_claim = a.claim().await?.expect("not claiming yet");
    timeout(WAIT, a_claim.elected()).await??;

    let mut b_claim = b.claim().await?.expect("not claiming yet");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(b.role(), Role::Claiming);

    assert!(a.release().await?);
    timeout(WAIT, a_claim.released()).await??;
    timeout(WAIT, b_claim.elected()).await??;
    assert_eq!(a.role(), Role::Idle);
    assert_eq!(b.role(), Role::Holding);

    Ok(())
}

#[test]
async fn misuse_is_ignored() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let a = start(&bus, "A").await?;

    assert!(!a.release().await?);

    let mut claim = a.claim().await?.expect("not claiming yet");
    assert!(a.claim().await?.is_none());
    timeout(WAIT, claim.elected()).await??;
    assert!(a.claim().await?.is_none());
    assert_eq!(a.role(), Role::Holding);

    Ok(())
}

#[test]
async fn cancelled_claim_is_never_elected() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let a = start(&bus, "A").await?;
    let b = start(&bus, "B").await?;

    let mut a_claim = a.claim().await?.expect("not claiming yet");
    timeout(WAIT, a_claim.elected()).await??;

    let b_claim = b.claim().await?.expect("not claiming yet");
    b_claim.cancel().await?;

    assert!(a.release().await?);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(a.role(), Role::Idle);
    assert_eq!(b.role(), Role::Idle);

    // a fresh claim afterwards works
    let mut b_claim = b.claim().await?.expect("not claiming anymore");
    timeout(WAIT, b_claim.elected()).await??;

    Ok(())
}

#[test]
async fn pending_claim_fails_on_unload() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let a = start(&bus, "A").await?;
    let b = start(&bus, "B").await?;

    let mut a_claim = a.claim().await?.expect("not claiming yet");
    timeout(WAIT, a_claim.elected()).await??;

    let mut b_claim = b.claim().await?.expect("not claiming yet");
    b.unload().await?;
    assert!(matches!(b_claim.elected().await, Err(Error::Cancelled)));

    Ok(())
}

#[test]
async fn unloaded_holder_is_replaced() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let a = start(&bus, "A").await?;
    let b = start(&bus, "B").await?;

    let mut a_claim = a.claim().await?.expect("not claiming yet");
    timeout(WAIT, a_claim.elected()).await??;
    let mut b_claim = b.claim().await?.expect("not claiming yet");

    a.unload().await?;
    assert_eq!(bus.members(&BatonName::new("test")?.channel()).len(), 1);

    timeout(WAIT, b_claim.elected()).await??;
    assert_eq!(b.role(), Role::Holding);

    Ok(())
}

#[test]
async fn dropped_baton_leaves_despite_pending_claim() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let channel = BatonName::new("test")?.channel();
    let a = start(&bus, "A").await?;
    let b = start(&bus, "B").await?;

    let mut b_claim = b.claim().await?.expect("not claiming yet");
    timeout(WAIT, b_claim.elected()).await??;

    let mut a_claim = a.claim().await?.expect("not claiming yet");
    drop(a);
    assert!(matches!(
        timeout(WAIT, a_claim.elected()).await?,
        Err(Error::Cancelled)
    ));
    timeout(WAIT, async {
        while bus.members(&channel).len() != 1 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    // nobody left to hand it to
    assert!(b.release().await?);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(b.role(), Role::Idle);

    Ok(())
}
