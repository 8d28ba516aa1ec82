//! TcpTransport against minimal listeners that speak the cell wire format.

use std::path::PathBuf;
use std::time::Duration;

use cellfs_client::{TcpTransport, load_registry};
use cellfs_kernel::wire::{self, CellRequest, CellResponse, Operation, Reply};
use cellfs_kernel::{CellConfig, CellFsError, CellTransport};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

fn cell_at(addr: std::net::SocketAddr) -> CellConfig {
    CellConfig::new("bb", "/data/bb", addr.to_string(), "pw-bb")
}

fn read_request(path: &str) -> CellRequest {
    CellRequest {
        credential: "pw-bb".into(),
        source_cell: "aa".into(),
        op: Operation::Read {
            path: PathBuf::from(path),
        },
    }
}

/// Accept one connection and answer its single request with `answer`.
async fn answer_once(answer: fn(&CellRequest) -> CellResponse) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, wire::frame_codec(1024 * 1024));
        let request: CellRequest = wire::recv_frame(&mut framed).await.unwrap().unwrap();
        wire::send_frame(&mut framed, &answer(&request)).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn reply_comes_back_from_listener() {
    let addr = answer_once(|req| match &req.op {
        Operation::Read { path } => Ok(Reply::Data(path.to_string_lossy().into_owned().into_bytes())),
        _ => Err(CellFsError::invalid_argument("unexpected op")),
    })
    .await;

    let reply = TcpTransport::new()
        .call(&cell_at(addr), read_request("/data/bb/x"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply.into_data().unwrap(), b"/data/bb/x");
}

#[tokio::test]
async fn remote_error_keeps_its_kind() {
    let addr = answer_once(|_| Err(CellFsError::permission_denied("wrong credential"))).await;
    let err = TcpTransport::new()
        .call(&cell_at(addr), read_request("/data/bb/x"), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CellFsError::PermissionDenied(_)));
}

#[tokio::test]
async fn silent_peer_hits_the_deadline() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let holder = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let err = TcpTransport::new()
        .call(&cell_at(addr), read_request("/data/bb/x"), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, CellFsError::Timeout(_)));
    holder.abort();
}

#[tokio::test]
async fn unreachable_cell_is_internal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = TcpTransport::new()
        .call(&cell_at(addr), read_request("/data/bb/x"), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CellFsError::Internal(_)));
}

#[tokio::test]
async fn peer_closing_without_reply_is_internal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, wire::frame_codec(1024 * 1024));
        let _: Option<CellRequest> = wire::recv_frame(&mut framed).await.unwrap();
    });

    let err = TcpTransport::new()
        .call(&cell_at(addr), read_request("/data/bb/x"), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CellFsError::Internal(_)));
}

#[test]
fn missing_cell_table_is_config_not_found() {
    let dir = tempfile::TempDir::new().unwrap();
    let err = load_registry(Some(&dir.path().join("cells.json"))).unwrap_err();
    assert!(matches!(err, CellFsError::ConfigNotFound(_)));
}

#[test]
fn cell_table_loads_from_explicit_path() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("cells.json");
    std::fs::write(
        &path,
        r#"{"aa": {"fs_root": "/data/aa", "fs_ip": "10.0.0.1", "fs_port": 7001, "fs_password": "pw"}}"#,
    )
    .unwrap();
    let registry = load_registry(Some(&path)).unwrap();
    let cfg = cellfs_kernel::CellRegistry::lookup(&registry, "aa").unwrap();
    assert_eq!(cfg.network_address, "10.0.0.1:7001");
}
