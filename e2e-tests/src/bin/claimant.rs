use baton::{Baton, BatonName, Bus, InstanceId, Parameters, TcpBus};
use clap::Parser;
use derive_more::Display;
use error_stack::{Context, IntoReport, Report, ResultExt};
use rand::Rng;
use std::{io, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::{prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Display)]
#[display(fmt = "application error")]
pub struct AppError;

impl Context for AppError {}

pub type AppResult<T> = error_stack::Result<T, AppError>;

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    #[clap(flatten)]
    pub common: baton_e2e::Opts,

    /// Instance id to use, random by default
    #[clap(long)]
    pub id: Option<String>,

    /// How long to hold the baton before releasing it, in ms
    #[clap(long, default_value = "1000")]
    pub hold: u64,

    /// Stop after holding the baton this many times, 0 for never
    #[clap(long, default_value = "0")]
    pub rounds: u64,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();

    let opts = Opts::from_args();

    let name = BatonName::new(opts.common.baton.clone())
        .report()
        .change_context(AppError)?;
    let bus: Arc<dyn Bus> = Arc::new(
        TcpBus::connect(opts.common.server_addr)
            .await
            .report()
            .change_context(AppError)?,
    );

    let params = Parameters::builder().name(name);
    let params = if let Some(id) = opts.id.clone() {
        params.instance_id(InstanceId::new(id)).build()
    } else {
        params.build()
    };

    let baton = Baton::start(bus, params)
        .await
        .report()
        .change_context(AppError)?;

    let res = tokio::select! {
        res = claim_repeatedly(&baton, &opts) => res,
        res = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            res.report().change_context(AppError)
        }
    };

    baton.unload().await.report().change_context(AppError)?;

    res
}

async fn claim_repeatedly(baton: &Baton, opts: &Opts) -> AppResult<()> {
    let hold = Duration::from_millis(opts.hold);
    let mut rounds = 0;

    loop {
        let Some(mut claim) = baton.claim().await.report().change_context(AppError)? else {
            return Err(Report::new(AppError).attach_printable("baton already claimed"));
        };

        claim.elected().await.report().change_context(AppError)?;
        info!(baton = %baton.name(), id = %baton.id(), "Holding the baton");
        println!("{} elected", baton.id());

        tokio::select! {
            _ = sleep(hold) => {
                baton.release().await.report().change_context(AppError)?;
                info!(baton = %baton.name(), id = %baton.id(), "Released the baton");
            }
            res = claim.released() => {
                res.report().change_context(AppError)?;
                info!(baton = %baton.name(), id = %baton.id(), "Baton taken over by others");
            }
        }

        rounds += 1;
        if opts.rounds != 0 && opts.rounds <= rounds {
            return Ok(());
        }

        // give the others a chance
        let pause = rand::thread_rng().gen_range(0..=opts.hold);
        sleep(Duration::from_millis(pause)).await;
    }
}
