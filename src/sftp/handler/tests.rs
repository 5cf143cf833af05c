use super::*;
use crate::sftp::IdleTimer;
use crate::store::{ListenerCaps, PathCaps};
use crate::testutil::{fixture, fixture_with_caps, Fixture};
use pretty_assertions::assert_eq;
use russh_sftp::server::Handler as _;

fn handler_for(fx: &Fixture) -> SftpHandler {
    SftpHandler::new(fx.ctx.clone(), fx.principal(), fx.listener.id, Uuid::new_v4(), IdleTimer::new())
}

async fn list_root(handler: &mut SftpHandler) -> Vec<String> {
    let handle = handler.opendir(1, "/".to_string()).await.unwrap().handle;
    let names: Vec<String> = match handler.readdir(2, handle.clone()).await {
        Ok(batch) => batch.files.into_iter().map(|f| f.filename).collect(),
        Err(StatusCode::Eof) => Vec::new(),
        Err(other) => panic!("readdir failed: {:?}", other),
    };
    handler.close(3, handle).await.unwrap();
    names
}

async fn open_rw(handler: &mut SftpHandler, path: &str) -> String {
    handler
        .open(
            1,
            path.to_string(),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            FileAttributes::default(),
        )
        .await
        .unwrap()
        .handle
}

#[tokio::test]
async fn readdir_terminates_after_one_batch_and_eof() {
    // Three entries, one READDIR batch, then EOF, then CLOSE.
    let fx = fixture().await;
    std::fs::write(fx.root.path().join("a.txt"), b"a").unwrap();
    std::fs::write(fx.root.path().join("b.txt"), b"b").unwrap();
    std::fs::create_dir(fx.root.path().join("sub")).unwrap();

    let mut handler = handler_for(&fx);
    let handle = handler.opendir(1, "/".to_string()).await.unwrap().handle;

    let batch = handler.readdir(2, handle.clone()).await.unwrap();
    let names: Vec<&str> = batch.files.iter().map(|f| f.filename.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);

    assert_eq!(handler.readdir(3, handle.clone()).await.unwrap_err(), StatusCode::Eof);
    let status = handler.close(4, handle).await.unwrap();
    assert_eq!(status.status_code, StatusCode::Ok);
}

#[tokio::test]
async fn readdir_paginates_in_batches() {
    let fx = fixture().await;
    for i in 0..250 {
        std::fs::write(fx.root.path().join(format!("file-{:03}", i)), b"x").unwrap();
    }
    let mut handler = handler_for(&fx);
    let handle = handler.opendir(1, "/".to_string()).await.unwrap().handle;

    let mut seen = Vec::new();
    let mut round_trips = 0;
    loop {
        match handler.readdir(2, handle.clone()).await {
            Ok(batch) => {
                round_trips += 1;
                assert!(batch.files.len() <= 100);
                seen.extend(batch.files.into_iter().map(|f| f.filename));
            }
            Err(code) => {
                assert_eq!(code, StatusCode::Eof);
                break;
            }
        }
    }
    assert_eq!(round_trips, 3);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 250);
    handler.close(3, handle).await.unwrap();
}

#[tokio::test]
async fn put_then_get_returns_the_same_bytes() {
    let fx = fixture().await;
    let mut handler = handler_for(&fx);

    let handle = open_rw(&mut handler, "/greeting.txt").await;
    handler.write(2, handle.clone(), 0, b"hello ".to_vec()).await.unwrap();
    handler.write(3, handle.clone(), 6, b"wharf".to_vec()).await.unwrap();
    handler.close(4, handle).await.unwrap();

    let handle = handler
        .open(5, "/greeting.txt".to_string(), OpenFlags::READ, FileAttributes::default())
        .await
        .unwrap()
        .handle;
    let data = handler.read(6, handle.clone(), 0, 1024).await.unwrap();
    assert_eq!(data.data, b"hello wharf");
    assert_eq!(handler.read(7, handle.clone(), 11, 1024).await.unwrap_err(), StatusCode::Eof);
    handler.close(8, handle).await.unwrap();
}

#[tokio::test]
async fn append_handles_ignore_the_client_offset() {
    let fx = fixture().await;
    std::fs::write(fx.root.path().join("log.txt"), b"ab").unwrap();
    let mut handler = handler_for(&fx);

    let handle = handler
        .open(
            1,
            "/log.txt".to_string(),
            OpenFlags::WRITE | OpenFlags::APPEND,
            FileAttributes::default(),
        )
        .await
        .unwrap()
        .handle;
    handler.write(2, handle.clone(), 0, b"cd".to_vec()).await.unwrap();
    handler.close(3, handle).await.unwrap();

    assert_eq!(std::fs::read(fx.root.path().join("log.txt")).unwrap(), b"abcd");
}

#[tokio::test]
async fn exclusive_create_fails_on_existing_file() {
    let fx = fixture().await;
    std::fs::write(fx.root.path().join("here.txt"), b"x").unwrap();
    let mut handler = handler_for(&fx);

    let err = handler
        .open(
            1,
            "/here.txt".to_string(),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUDE,
            FileAttributes::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, StatusCode::Failure);
}

#[tokio::test]
async fn create_without_edit_permits_only_the_first_open() {
    // The create/edit distinction seen from the protocol side.
    let fx = fixture_with_caps(ListenerCaps::CREATE | ListenerCaps::LIST, PathCaps::READ | PathCaps::WRITE | PathCaps::LIST).await;
    let mut handler = handler_for(&fx);

    let handle = open_rw(&mut handler, "/new.txt").await;
    handler.close(2, handle).await.unwrap();

    let err = handler
        .open(
            3,
            "/new.txt".to_string(),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            FileAttributes::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, StatusCode::PermissionDenied);
}

#[tokio::test]
async fn denied_write_is_logged_with_denied_action() {
    let fx = fixture_with_caps(ListenerCaps::all(), PathCaps::READ | PathCaps::LIST).await;
    let mut handler = handler_for(&fx);

    let err = handler
        .open(
            1,
            "/x.txt".to_string(),
            OpenFlags::WRITE | OpenFlags::CREATE,
            FileAttributes::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, StatusCode::PermissionDenied);

    let row = fx.wait_for_activity("UPLOAD_DENIED").await;
    assert!(!row.success);
    assert_eq!(row.username, "alice");
    assert_eq!(row.listener_id, Some(fx.listener.id));
}

#[tokio::test]
async fn traversal_attempt_is_denied_with_activity() {
    let fx = fixture().await;
    let mut handler = handler_for(&fx);

    let err = handler.stat(1, "/../../etc/passwd".to_string()).await.unwrap_err();
    assert_eq!(err, StatusCode::PermissionDenied);
    let row = fx.wait_for_activity("STAT_DENIED").await;
    assert!(!row.success);
}

#[tokio::test]
async fn mkdir_then_rmdir_restores_the_listing() {
    let fx = fixture().await;
    std::fs::write(fx.root.path().join("keep.txt"), b"x").unwrap();
    let mut handler = handler_for(&fx);

    let before = list_root(&mut handler).await;
    handler.mkdir(4, "/newdir".to_string(), FileAttributes::default()).await.unwrap();
    handler.rmdir(5, "/newdir".to_string()).await.unwrap();
    let after = list_root(&mut handler).await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn rmdir_on_populated_directory_fails() {
    let fx = fixture().await;
    std::fs::create_dir(fx.root.path().join("full")).unwrap();
    std::fs::write(fx.root.path().join("full/inner.txt"), b"x").unwrap();
    let mut handler = handler_for(&fx);

    let err = handler.rmdir(1, "/full".to_string()).await.unwrap_err();
    assert_eq!(err, StatusCode::Failure);
}

#[tokio::test]
async fn rename_round_trip_restores_the_name() {
    let fx = fixture().await;
    std::fs::write(fx.root.path().join("a"), b"payload").unwrap();
    let mut handler = handler_for(&fx);

    handler.rename(1, "/a".to_string(), "/b".to_string()).await.unwrap();
    assert!(handler.stat(2, "/a".to_string()).await.is_err());
    handler.rename(3, "/b".to_string(), "/a".to_string()).await.unwrap();

    let attrs = handler.stat(4, "/a".to_string()).await.unwrap();
    assert_eq!(attrs.attrs.size, Some(7));
}

#[tokio::test]
async fn missing_targets_are_no_such_file() {
    let fx = fixture().await;
    let mut handler = handler_for(&fx);

    assert_eq!(handler.stat(1, "/ghost".to_string()).await.unwrap_err(), StatusCode::NoSuchFile);
    assert_eq!(handler.remove(2, "/ghost".to_string()).await.unwrap_err(), StatusCode::NoSuchFile);
    assert_eq!(
        handler
            .open(3, "/ghost".to_string(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap_err(),
        StatusCode::NoSuchFile
    );
}

#[tokio::test]
async fn realpath_is_lexical_and_total() {
    let fx = fixture().await;
    let mut handler = handler_for(&fx);

    let name = handler.realpath(1, "/x/../y".to_string()).await.unwrap();
    assert_eq!(name.files[0].filename, "/y");
    // Paths that do not exist still normalize.
    let name = handler.realpath(2, "deep/./nested".to_string()).await.unwrap();
    assert_eq!(name.files[0].filename, "/deep/nested");
}

#[tokio::test]
async fn handle_books_balance_at_teardown() {
    let fx = fixture().await;
    std::fs::write(fx.root.path().join("a.txt"), b"a").unwrap();
    let mut handler = handler_for(&fx);

    let f = handler
        .open(1, "/a.txt".to_string(), OpenFlags::READ, FileAttributes::default())
        .await
        .unwrap()
        .handle;
    let d = handler.opendir(2, "/".to_string()).await.unwrap().handle;
    handler.close(3, f).await.unwrap();
    handler.close(4, d).await.unwrap();

    let (opened, closed) = handler.handle_totals();
    assert_eq!(opened, 2);
    assert_eq!(opened, closed);
}

#[tokio::test]
async fn foreign_handles_are_rejected() {
    let fx = fixture().await;
    let mut handler = handler_for(&fx);
    assert_eq!(handler.read(1, "f:42".to_string(), 0, 16).await.unwrap_err(), StatusCode::BadMessage);
    assert_eq!(handler.readdir(2, "d:42".to_string()).await.unwrap_err(), StatusCode::BadMessage);
}
