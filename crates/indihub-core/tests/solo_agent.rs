//! Solo agent integration tests against a scripted INDI-server on
//! localhost: device discovery, sideband bootstrap and image forwarding.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::mock_solo_tunnel;
use indihub_core::solo::SoloAgent;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

const DEF_EXPOSURE: &[u8] = b"<defNumberVector device='CAM1' name='CCD_EXPOSURE'>\
    <defNumber name='CCD_EXPOSURE_VALUE'>1.0</defNumber></defNumberVector>";
const BLOB_FRAME: &[u8] = b"<setBLOBVector device='CAM1' name='CCD1'>\
    <oneBLOB name='CCD1' size='8'>AAAAAAAA</oneBLOB></setBLOBVector>";

/// Collect reads from a socket until `pattern` shows up in the
/// accumulated bytes.
async fn read_until(stream: &mut TcpStream, collected: &mut Vec<u8>, pattern: &[u8]) {
    timeout(WAIT, async {
        loop {
            if collected
                .windows(pattern.len().max(1))
                .any(|w| w == pattern)
            {
                return;
            }
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed while waiting for {pattern:?}");
            collected.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "never received {:?}, got {:?}",
            String::from_utf8_lossy(pattern),
            String::from_utf8_lossy(collected)
        )
    });
}

#[tokio::test]
async fn test_discovers_device_and_forwards_blobs() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let accepts = Arc::new(Mutex::new(0usize));
    let accepts_seen = accepts.clone();
    let (script_done_tx, mut script_done_rx) = mpsc::unbounded_channel::<&'static str>();

    // scripted INDI-server: first connection is the agent's main one,
    // the second is the CAM1 sideband
    tokio::spawn(async move {
        // main connection
        let (mut main_conn, _) = listener.accept().await.unwrap();
        *accepts.lock().await += 1;
        let mut got = Vec::new();
        read_until(&mut main_conn, &mut got, b"<getProperties version='1.7'/>").await;
        main_conn.write_all(DEF_EXPOSURE).await.unwrap();
        read_until(
            &mut main_conn,
            &mut got,
            b"<enableBLOB device='CAM1'>Never</enableBLOB>",
        )
        .await;
        script_done_tx.send("main").unwrap();

        // sideband connection
        let (mut sideband, _) = listener.accept().await.unwrap();
        *accepts.lock().await += 1;
        let mut got = Vec::new();
        read_until(
            &mut sideband,
            &mut got,
            b"<getProperties device='CAM1' version='1.7'/>",
        )
        .await;
        read_until(
            &mut sideband,
            &mut got,
            b"<enableBLOB device='CAM1'>Only</enableBLOB>",
        )
        .await;
        sideband.write_all(BLOB_FRAME).await.unwrap();
        script_done_tx.send("sideband").unwrap();

        // hold both sockets open until the agent closes them
        let mut buf = [0u8; 64];
        let _ = main_conn.read(&mut buf).await;
        let _ = sideband.read(&mut buf).await;
    });

    let (tunnel, mut responses) = mock_solo_tunnel();
    let agent = Arc::new(SoloAgent::new(addr, tunnel));
    let run = tokio::spawn(agent.clone().start(7, "solo-token".to_string()));

    assert_eq!(timeout(WAIT, script_done_rx.recv()).await.unwrap(), Some("main"));
    assert_eq!(
        timeout(WAIT, script_done_rx.recv()).await.unwrap(),
        Some("sideband")
    );

    // the BLOB frame arrives labelled with the sideband's conn id
    let resp = timeout(WAIT, responses.recv()).await.unwrap().unwrap();
    assert_eq!(resp.conn, 1);
    assert_eq!(resp.data, BLOB_FRAME);
    assert_eq!(resp.session_id, 7);
    assert_eq!(resp.session_token, "solo-token");

    // exactly one sideband for the device
    assert_eq!(agent.devices().await, vec!["CAM1".to_string()]);
    assert_eq!(*accepts_seen.lock().await, 2);

    agent.close();
    let summary = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert!(summary.images_num >= 1);
}

#[tokio::test]
async fn test_repeated_definition_opens_no_second_sideband() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let accepts = Arc::new(Mutex::new(0usize));
    let accepts_seen = accepts.clone();

    tokio::spawn(async move {
        let (mut main_conn, _) = listener.accept().await.unwrap();
        *accepts.lock().await += 1;
        let mut got = Vec::new();
        read_until(&mut main_conn, &mut got, b"<getProperties version='1.7'/>").await;
        // the INDI-server re-announces the property
        main_conn.write_all(DEF_EXPOSURE).await.unwrap();
        main_conn.write_all(DEF_EXPOSURE).await.unwrap();

        loop {
            let (mut sideband, _) = listener.accept().await.unwrap();
            *accepts.lock().await += 1;
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while matches!(sideband.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });

    let (tunnel, _responses) = mock_solo_tunnel();
    let agent = Arc::new(SoloAgent::new(addr, tunnel));
    let run = tokio::spawn(agent.clone().start(7, "solo-token".to_string()));

    timeout(WAIT, async {
        while agent.devices().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // give a would-be second sideband time to show up, then check it never did
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*accepts_seen.lock().await, 2);
    assert_eq!(agent.devices().await.len(), 1);

    agent.close();
    let _ = timeout(WAIT, run).await.unwrap();
}

#[tokio::test]
async fn test_unreachable_server_is_an_error() {
    let (tunnel, _responses) = mock_solo_tunnel();
    // port 1 on localhost refuses connections
    let agent = Arc::new(SoloAgent::new("127.0.0.1:1", tunnel));
    let result = agent.start(1, "tok".to_string()).await;
    assert!(result.is_err());
}
