//! End-to-end storage-node tests driven over a real TCP connection,
//! exercising the FastDFS wire protocol (`spec.md` §6) and the seed
//! scenarios in §8.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use fastdfs_storage::config::StorageConfig;
use fastdfs_storage::peer::Peer;
use fastdfs_storage::protocol::{read_group, write_group, Cmd, Header, GROUP_FIELD_LEN};
use fastdfs_storage::storage::Storage;

async fn spawn_node(group: &str, self_id: &str) -> (Arc<Storage>, std::net::SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = StorageConfig::default();
    config.store_paths = vec![dir.path().to_path_buf()];
    config.disk_reader_threads = 1;
    config.disk_writer_threads = 1;

    let storage = Arc::new(Storage::open(config, group.to_string(), self_id.to_string()).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accepting = storage.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { return };
            let storage = accepting.clone();
            tokio::spawn(fastdfs_storage::fsm::serve_connection(storage, socket));
        }
    });

    (storage, addr, dir)
}

async fn request(stream: &mut TcpStream, cmd: Cmd, body: &[u8]) -> (u8, Vec<u8>) {
    let header = Header::new(body.len() as u64, cmd.to_u8(), 0);
    header.write_to(stream).await.unwrap();
    stream.write_all(body).await.unwrap();

    let response = Header::read_from(stream).await.unwrap();
    let mut payload = vec![0u8; response.body_len as usize];
    stream.read_exact(&mut payload).await.unwrap();
    (response.status, payload)
}

fn upload_body(path_index: u8, ext: &str, data: &[u8]) -> Vec<u8> {
    let mut body = vec![path_index];
    body.extend_from_slice(&(data.len() as u64).to_be_bytes());
    let mut ext_field = [0u8; 6];
    let ext_bytes = ext.as_bytes();
    ext_field[..ext_bytes.len().min(6)].copy_from_slice(&ext_bytes[..ext_bytes.len().min(6)]);
    body.extend_from_slice(&ext_field);
    body.extend_from_slice(data);
    body
}

fn download_body(group: &str, filename: &str) -> Vec<u8> {
    let mut body = vec![0u8; 16];
    body.extend_from_slice(&write_group(group));
    body.extend_from_slice(filename.as_bytes());
    body
}

/// S1 "Upload/Download round-trip" (`spec.md` §8): upload `"hello"`,
/// check the returned filename's shape, then download it back intact.
#[tokio::test]
async fn upload_then_download_round_trips_over_the_wire() {
    let (storage, addr, _dir) = spawn_node("group1", "node-a").await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let (status, response) = request(&mut client, Cmd::UploadFile, &upload_body(0xFF, "txt", b"hello")).await;
    assert_eq!(status, 0);
    let group = read_group(&response[..GROUP_FIELD_LEN]).unwrap();
    let filename = String::from_utf8(response[GROUP_FIELD_LEN..].to_vec()).unwrap();
    assert_eq!(group, "group1");
    assert!(filename.starts_with("M00/"));

    let (status, downloaded) = request(&mut client, Cmd::DownloadFile, &download_body(&group, &filename)).await;
    assert_eq!(status, 0);
    assert_eq!(downloaded, b"hello");

    // The source op appears in the binlog exactly once, and carries the
    // decoded local name that the receiver (nothing, in this test) would
    // replay (`spec.md` §8 invariant 3/seed S1).
    storage.binlog.flush().unwrap();
    let binlog_bytes = fastdfs_storage::binlog::read_binlog_file(storage.binlog.sync_dir(), 0).unwrap();
    let binlog_text = String::from_utf8(binlog_bytes).unwrap();
    assert_eq!(binlog_text.lines().count(), 1);
    assert!(binlog_text.starts_with(char::is_numeric));
    assert!(binlog_text.contains(" C "));
}

/// §8 invariant 2: once delete succeeds, subsequent downloads 404.
#[tokio::test]
async fn delete_makes_the_file_unreachable() {
    let (_storage, addr, _dir) = spawn_node("group1", "node-a").await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let (_, response) = request(&mut client, Cmd::UploadFile, &upload_body(0xFF, "bin", b"payload")).await;
    let filename = String::from_utf8(response[GROUP_FIELD_LEN..].to_vec()).unwrap();

    let mut delete_body = write_group("group1").to_vec();
    delete_body.extend_from_slice(filename.as_bytes());
    let (status, _) = request(&mut client, Cmd::DeleteFile, &delete_body).await;
    assert_eq!(status, 0);

    let (status, _) = request(&mut client, Cmd::DownloadFile, &download_body("group1", &filename)).await;
    assert_eq!(status, 2); // ENOENT
}

/// S2 "Replication create" (`spec.md` §8): two nodes in the same group;
/// driving one replication pass after an upload to A lands the file on B
/// with a lower-case binlog op.
#[tokio::test]
async fn one_replication_pass_copies_a_new_file_to_the_peer() {
    let (storage_a, addr_a, _dir_a) = spawn_node("group1", "node-a").await;
    let (storage_b, addr_b, _dir_b) = spawn_node("group1", "node-b").await;

    let mut client_a = TcpStream::connect(addr_a).await.unwrap();
    let (_, response) = request(&mut client_a, Cmd::UploadFile, &upload_body(0xFF, "txt", b"replicate-me")).await;
    let filename = String::from_utf8(response[GROUP_FIELD_LEN..].to_vec()).unwrap();
    storage_a.binlog.flush().unwrap();

    let peer = Peer::new("node-b", addr_b.to_string());
    let live_reader_indices = Arc::new(std::sync::Mutex::new(std::collections::HashMap::new()));
    let replication_task = tokio::spawn(fastdfs_storage::server::run_peer_replication(
        storage_a.clone(),
        peer,
        live_reader_indices,
    ));

    let mut client_b = TcpStream::connect(addr_b).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, body) = request(&mut client_b, Cmd::DownloadFile, &download_body("group1", &filename)).await;
        if status == 0 {
            assert_eq!(body, b"replicate-me");
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("replication did not land the file on the peer in time");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    replication_task.abort();
    storage_b.binlog.flush().unwrap();
    let binlog_bytes = fastdfs_storage::binlog::read_binlog_file(storage_b.binlog.sync_dir(), 0).unwrap();
    let binlog_text = String::from_utf8(binlog_bytes).unwrap();
    assert!(binlog_text.contains(" c "), "expected a lower-case replica op in B's binlog: {binlog_text}");
}

/// S6-adjacent: trunk-eligible uploads stay small, and an upload at or
/// above `slot_max_size` always bypasses the trunk allocator
/// (`spec.md` §8 "Boundary behaviors").
#[tokio::test]
async fn large_upload_bypasses_the_trunk_allocator() {
    let (_storage, addr, _dir) = spawn_node("group1", "node-a").await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let big = vec![7u8; 17 * 1024 * 1024]; // over the default 16 MiB slot_max_size
    let (status, response) = request(&mut client, Cmd::UploadFile, &upload_body(0xFF, "bin", &big)).await;
    assert_eq!(status, 0);
    let filename = String::from_utf8(response[GROUP_FIELD_LEN..].to_vec()).unwrap();

    let (status, downloaded) = request(&mut client, Cmd::DownloadFile, &download_body("group1", &filename)).await;
    assert_eq!(status, 0);
    assert_eq!(downloaded.len(), big.len());
}
