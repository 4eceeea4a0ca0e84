//! Integration tests for the chunk downloader: resume, range handling,
//! retry classification and cancellation.

mod common;

use std::sync::{Arc, Mutex};

use egafetch::download::ChunkDownloader;
use egafetch::error::Error;
use egafetch::state::{ChunkStatus, FileState};
use tokio_util::sync::CancellationToken;

use common::server::{Behavior, TestServer};
use common::{test_api, test_payload, test_spec, test_store};

const CHUNK_SIZE: u64 = 64;
const FILE_SIZE: u64 = 160;

/// Build a chunked file state and the downloader pointed at `server`.
async fn setup(
    server: &TestServer,
    size: u64,
) -> (
    tempfile::TempDir,
    Arc<egafetch::StateStore>,
    Arc<Mutex<FileState>>,
    ChunkDownloader,
) {
    let (dir, store) = test_store();
    let api = test_api(&server.url);
    let url = api.download_url(common::TEST_FILE_ID);

    let mut state = FileState::new(&test_spec(size, "", ""), CHUNK_SIZE);
    state.init_chunks();
    let state = Arc::new(Mutex::new(state));

    let chunks_dir = store.chunks_dir_for(common::TEST_FILE_ID);
    tokio::fs::create_dir_all(&chunks_dir).await.unwrap();

    let downloader = ChunkDownloader::new(api, url, chunks_dir, None, None);
    (dir, store, state, downloader)
}

#[tokio::test]
async fn test_fresh_chunk_download() {
    let payload = test_payload(FILE_SIZE as usize);
    let server = TestServer::start(payload.clone(), Behavior::Normal).await;
    let (_dir, store, state, downloader) = setup(&server, FILE_SIZE).await;

    downloader
        .download(&state, 1, &CancellationToken::new())
        .await
        .unwrap();

    let st = state.lock().unwrap();
    assert_eq!(st.chunks[1].status, ChunkStatus::Complete);
    assert_eq!(st.chunks[1].bytes_downloaded, CHUNK_SIZE);

    let part = store.chunks_dir_for(common::TEST_FILE_ID).join("001.part");
    let written = std::fs::read(part).unwrap();
    assert_eq!(written, &payload[64..128]);

    // Exactly one request, for the full chunk range.
    assert_eq!(server.hits(), 1);
    assert_eq!(server.ranges(), vec![Some((64, 127))]);
}

#[tokio::test]
async fn test_resume_from_partial_part_file() {
    let payload = test_payload(FILE_SIZE as usize);
    let server = TestServer::start(payload.clone(), Behavior::Normal).await;
    let (_dir, store, state, downloader) = setup(&server, FILE_SIZE).await;

    // 32 bytes of chunk 1 are already on disk from a previous run.
    let part = store.chunks_dir_for(common::TEST_FILE_ID).join("001.part");
    std::fs::write(&part, &payload[64..96]).unwrap();
    state.lock().unwrap().chunks[1].bytes_downloaded = 32;

    downloader
        .download(&state, 1, &CancellationToken::new())
        .await
        .unwrap();

    // The request started mid-chunk and the part-file is now whole.
    assert_eq!(server.ranges(), vec![Some((96, 127))]);
    assert_eq!(std::fs::read(&part).unwrap(), &payload[64..128]);
    assert_eq!(
        state.lock().unwrap().chunks[1].bytes_downloaded,
        CHUNK_SIZE
    );
}

#[tokio::test]
async fn test_complete_part_file_skips_network() {
    let payload = test_payload(FILE_SIZE as usize);
    let server = TestServer::start(payload.clone(), Behavior::Normal).await;
    let (_dir, store, state, downloader) = setup(&server, FILE_SIZE).await;

    let part = store.chunks_dir_for(common::TEST_FILE_ID).join("000.part");
    std::fs::write(&part, &payload[..64]).unwrap();

    downloader
        .download(&state, 0, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(server.hits(), 0, "no request for a complete part-file");
    assert_eq!(state.lock().unwrap().chunks[0].status, ChunkStatus::Complete);
}

#[tokio::test]
async fn test_zero_size_chunk_creates_empty_part() {
    let server = TestServer::start(Vec::new(), Behavior::Normal).await;
    let (_dir, store, state, downloader) = setup(&server, 0).await;

    downloader
        .download(&state, 0, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(server.hits(), 0);
    let part = store.chunks_dir_for(common::TEST_FILE_ID).join("000.part");
    assert_eq!(std::fs::metadata(part).unwrap().len(), 0);
    assert_eq!(state.lock().unwrap().chunks[0].status, ChunkStatus::Complete);
}

#[tokio::test]
async fn test_range_ignored_truncates_and_recovers() {
    let payload = test_payload(FILE_SIZE as usize);
    let server = TestServer::start(payload.clone(), Behavior::IgnoreRange).await;
    let (_dir, store, state, downloader) = setup(&server, FILE_SIZE).await;

    // Pre-existing partial bytes that the 200 response must not duplicate.
    let part = store.chunks_dir_for(common::TEST_FILE_ID).join("001.part");
    std::fs::write(&part, &payload[64..96]).unwrap();
    state.lock().unwrap().chunks[1].bytes_downloaded = 32;

    downloader
        .download(&state, 1, &CancellationToken::new())
        .await
        .unwrap();

    // The part-file holds exactly this chunk's range of the payload, even
    // though the server sent the whole resource from byte zero.
    assert_eq!(std::fs::read(&part).unwrap(), &payload[64..128]);
    let st = state.lock().unwrap();
    assert_eq!(st.chunks[1].status, ChunkStatus::Complete);
    assert_eq!(st.chunks[1].bytes_downloaded, CHUNK_SIZE);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let payload = test_payload(FILE_SIZE as usize);
    let server = TestServer::start(payload.clone(), Behavior::FailFirst(1)).await;
    let (_dir, store, state, downloader) = setup(&server, FILE_SIZE).await;

    downloader
        .download(&state, 2, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(server.hits(), 2, "one failure, one success");
    let st = state.lock().unwrap();
    assert_eq!(st.chunks[2].status, ChunkStatus::Complete);
    assert_eq!(st.chunks[2].retry_count, 1);

    let part = store.chunks_dir_for(common::TEST_FILE_ID).join("002.part");
    assert_eq!(std::fs::read(part).unwrap(), &payload[128..160]);
}

#[tokio::test]
async fn test_client_error_fails_immediately() {
    let payload = test_payload(FILE_SIZE as usize);
    let server = TestServer::start(payload, Behavior::AlwaysStatus(404)).await;
    let (_dir, _store, state, downloader) = setup(&server, FILE_SIZE).await;

    let err = downloader
        .download(&state, 0, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Api { status: 404, .. }), "got {err:?}");
    assert_eq!(server.hits(), 1, "4xx must not consume retries");
}

#[tokio::test]
async fn test_cancelled_token_stops_before_request() {
    let payload = test_payload(FILE_SIZE as usize);
    let server = TestServer::start(payload, Behavior::Normal).await;
    let (_dir, _store, state, downloader) = setup(&server, FILE_SIZE).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = downloader.download(&state, 0, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(server.hits(), 0);
}
