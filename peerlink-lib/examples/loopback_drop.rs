use std::time::Duration;

use anyhow::Result;
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::EnvFilter;

use peerlink_lib::signaling::loopback::LoopbackRouter;
use peerlink_lib::transport::memory::MemoryHub;
use peerlink_lib::{ChannelPurpose, ConnectionState, FileMetadata, Session, SessionConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,peerlink_lib=debug")),
        )
        .init();

    let hub = MemoryHub::new();
    let router = LoopbackRouter::new();

    let (alice, mut alice_events) = Session::spawn(
        SessionConfig::new("alice", "bob", ChannelPurpose::FileTransfer),
        Box::new(router.relay()),
        Box::new(hub.factory("alice")),
        None,
    );
    router.register("alice", alice.clone());
    let (bob, mut bob_events) = Session::spawn(
        SessionConfig::new("bob", "alice", ChannelPurpose::FileTransfer),
        Box::new(router.relay()),
        Box::new(hub.factory("bob")),
        None,
    );
    router.register("bob", bob.clone());

    let dir = std::env::temp_dir().join("peerlink_loopback_drop");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("drop.bin");
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 239) as u8).collect();
    std::fs::write(&path, &payload)?;

    // both sides come up concurrently; role assignment picks the offerer
    alice.establish_connection();
    bob.establish_connection();

    let metadata = FileMetadata::new("drop.bin", payload.len() as u64, "application/octet-stream");
    let accepted = alice.queue_file(&path, metadata).await?;
    info!(accepted, "file queued");

    let received = timeout(Duration::from_secs(10), bob_events.received.recv())
        .await?
        .expect("received stream closed");
    let intact = received.data[..] == payload[..];
    info!(
        name = %received.metadata.name,
        bytes = received.data.len(),
        intact,
        "file arrived"
    );

    while let Ok(progress) = alice_events.progress.try_recv() {
        info!(
            file_id = %progress.file_id(),
            status = ?progress.status(),
            percent = progress.percent(),
            "sender progress"
        );
    }

    assert_eq!(alice.connection_state(), ConnectionState::Connected);
    alice.cleanup();
    bob.cleanup();
    std::fs::remove_file(&path).ok();
    Ok(())
}
