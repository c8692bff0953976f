//! Broadcast proxy integration tests: guests reach the local INDI-server
//! through the listener while both directions are teed to the cloud.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::mock_tunnel;
use indihub_core::broadcast::BroadcastProxy;
use indihub_core::protocol::Request;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Reserve an ephemeral port for the broadcast listener.
async fn free_addr() -> String {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap().to_string();
    drop(probe);
    addr
}

#[tokio::test]
async fn test_guest_traffic_is_relayed_and_teed() {
    // local INDI-server stand-in: answer any request with one reply
    let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = server_listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    stream.write_all(b"<ok/>").await.unwrap();
                }
            });
        }
    });

    let (tunnel, mut handle) = mock_tunnel();
    let proxy = Arc::new(BroadcastProxy::new("INDI-Server", server_addr.as_str(), tunnel));
    let (pub_tx, mut pub_rx) = mpsc::channel(1);
    let listen_addr = free_addr().await;

    {
        let proxy = proxy.clone();
        let listen_addr = listen_addr.clone();
        tokio::spawn(async move {
            proxy
                .start(pub_tx, 11, "bcast-token".to_string(), listen_addr)
                .await;
        });
    }

    // the relay announces the public address first
    handle
        .req_tx
        .send(Request {
            conn: 0,
            data: b"broadcast.indihub.io:40001".to_vec(),
            closed: false,
        })
        .unwrap();
    let public = timeout(WAIT, pub_rx.recv()).await.unwrap().unwrap();
    assert_eq!(public.addr, "broadcast.indihub.io:40001");

    // guest connects through the broadcast listener
    let mut guest = timeout(WAIT, async {
        loop {
            match TcpStream::connect(&listen_addr).await {
                Ok(stream) => return stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .unwrap();

    guest
        .write_all(b"<getProperties version='1.7'/>")
        .await
        .unwrap();

    // the getProperties frame is teed to the cloud with the guest's number
    let teed = timeout(WAIT, handle.resp_rx.recv()).await.unwrap().unwrap();
    assert_eq!(teed.conn, 1);
    assert_eq!(teed.data, b"<getProperties version='1.7'/>");
    assert_eq!(teed.session_id, 11);
    assert_eq!(teed.session_token, "bcast-token");

    // the server's reply reaches the guest and the cloud
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, guest.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"<ok/>");

    let teed = timeout(WAIT, handle.resp_rx.recv()).await.unwrap().unwrap();
    assert_eq!(teed.conn, 1);
    assert_eq!(teed.data, b"<ok/>");

    proxy.close().await;
}

#[tokio::test]
async fn test_plain_guest_requests_are_teed_too() {
    let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = server_listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        // swallow the request, send nothing back
        while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
    });

    let (tunnel, mut handle) = mock_tunnel();
    let proxy = Arc::new(BroadcastProxy::new("INDI-Server", server_addr.as_str(), tunnel));
    let (pub_tx, mut pub_rx) = mpsc::channel(1);
    let listen_addr = free_addr().await;

    {
        let proxy = proxy.clone();
        let listen_addr = listen_addr.clone();
        tokio::spawn(async move {
            proxy
                .start(pub_tx, 11, "bcast-token".to_string(), listen_addr)
                .await;
        });
    }

    handle
        .req_tx
        .send(Request {
            conn: 0,
            data: b"pub".to_vec(),
            closed: false,
        })
        .unwrap();
    pub_rx.recv().await.unwrap();

    let mut guest = timeout(WAIT, async {
        loop {
            match TcpStream::connect(&listen_addr).await {
                Ok(stream) => return stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .unwrap();

    guest
        .write_all(b"<newSwitchVector device='scope'/>")
        .await
        .unwrap();

    // ordinary commands are part of the broadcast copy as well
    let teed = timeout(WAIT, handle.resp_rx.recv()).await.unwrap().unwrap();
    assert_eq!(teed.conn, 1);
    assert_eq!(teed.data, b"<newSwitchVector device='scope'/>");
    assert_eq!(teed.session_id, 11);
    assert_eq!(teed.session_token, "bcast-token");

    proxy.close().await;
}
