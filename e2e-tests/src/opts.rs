use std::net::SocketAddr;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    #[clap(long = "server", env = "BATOND_SERVER", default_value = "127.0.0.1:8080")]
    pub server_addr: SocketAddr,

    /// Name of the baton to compete for
    #[clap(long = "baton", default_value = "e2e")]
    pub baton: String,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }
}
