#![allow(unused)]

use anyhow::Result;
use baton::TcpBus;
use batond::Parameters;
use std::net::SocketAddr;

pub struct TestBatond {
    node: Option<batond::Node>,
}

impl TestBatond {
    pub fn new() -> anyhow::Result<Self> {
        let params = Parameters::builder();
        let node = batond::Node::new(params.build())?;
        Ok(Self { node: Some(node) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.node().get_ctrl().local_addr()
    }

    pub fn node(&self) -> &batond::Node {
        self.node.as_ref().expect("Node was already dropped")
    }

    pub async fn new_bus(&self) -> Result<TcpBus> {
        Ok(TcpBus::connect(self.local_addr()).await?)
    }
}

impl Drop for TestBatond {
    fn drop(&mut self) {
        self.node().get_ctrl().stop();
        self.node.take();
    }
}
