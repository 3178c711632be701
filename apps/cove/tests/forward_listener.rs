//! End-to-end behavior of the port-forward manager with a forwarder that
//! binds real loopback listeners: every binding accepts TCP while the
//! manager runs, and every listener is released once it stops.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use cove::forward::{ForwardError, PortForwardManager, PortForwarder};
use cove::session::scope::{cancelled, Scope};

struct LoopbackForwarder;

#[async_trait]
impl PortForwarder for LoopbackForwarder {
    async fn forward(
        &self,
        _namespace: &str,
        _pod: &str,
        local: u16,
        remote: u16,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), ForwardError> {
        let listener = TcpListener::bind(("127.0.0.1", local))
            .await
            .map_err(|err| ForwardError::Broken {
                local,
                remote,
                reason: err.to_string(),
            })?;
        loop {
            tokio::select! {
                _ = cancelled(&mut cancel) => return Ok(()),
                accepted = listener.accept() => drop(accepted),
            }
        }
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

async fn connects(port: u16) -> bool {
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn listeners_live_and_die_with_the_manager() {
    let port = free_port();
    let scope = Scope::new();
    let (err_tx, _err_rx) = mpsc::channel(4);

    let mut manager = PortForwardManager::new(Arc::new(LoopbackForwarder), err_tx);
    manager.add(port, 80).unwrap();
    manager.start("web-1", "dev", &scope);

    assert!(connects(port).await, "local listener must accept while running");

    scope.cancel();
    manager.stop().await;
    scope.wait().await;

    // The port is free again: nothing orphaned survives the session.
    std::net::TcpListener::bind(("127.0.0.1", port))
        .expect("local port released after stop");
}

#[tokio::test]
async fn both_bindings_of_a_pair_come_up() {
    let first = free_port();
    let second = free_port();
    let scope = Scope::new();
    let (err_tx, _err_rx) = mpsc::channel(4);

    let mut manager = PortForwardManager::new(Arc::new(LoopbackForwarder), err_tx);
    manager.add(first, 22000).unwrap();
    manager.add(second, 8384).unwrap();
    manager.start("web-1", "dev", &scope);

    assert!(connects(first).await);
    assert!(connects(second).await);

    scope.cancel();
    manager.stop().await;
    scope.wait().await;
}
