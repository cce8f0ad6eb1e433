#![deny(clippy::as_conversions)]
use batond::Parameters;
use opts::Opts;
use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod opts;

fn main() -> anyhow::Result<()> {
    init_logging();

    let opts = Opts::from_args();

    let params = Parameters::builder().bind(opts.listen);

    let params = if let Some(len) = opts.outbound_queue_len {
        params.outbound_queue_len(len)
    } else {
        params.outbound_queue_len(Parameters::DEFAULT_OUTBOUND_QUEUE_LEN)
    };

    let node = batond::Node::new(params.build())?;

    node.get_ctrl().install_signal_handler()?;

    node.wait();

    Ok(())
}

fn init_logging() {
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
}
