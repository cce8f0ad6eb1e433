use clap::Parser;
use std::net::SocketAddr;

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    #[clap(long = "listen", env = "BATOND_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Frames buffered for a slow connection before it gets dropped
    #[clap(long = "outbound-queue")]
    pub outbound_queue_len: Option<usize>,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }
}

#[test]
fn opts_defaults() {
    let opts = Opts::parse_from(["batond"]);
    assert_eq!(opts.listen, "127.0.0.1:8080".parse().unwrap());
    assert_eq!(opts.outbound_queue_len, None);

    let opts = Opts::parse_from(["batond", "--listen", "[::1]:9000", "--outbound-queue", "8"]);
    assert_eq!(opts.listen.port(), 9000);
    assert_eq!(opts.outbound_queue_len, Some(8));
}
