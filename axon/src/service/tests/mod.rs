//! This contains test scenarios that a given [AxonService] needs to pass.
//! We use [rstest] and [rstest_reuse] to provide all services we want to
//! test against, and then apply this template to all test functions.

use rstest::*;
use rstest_reuse::{self, *};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;

use super::AxonService;
use crate::fixtures::{BLOB_A, BLOB_A_DIGEST, BLOB_B, BLOB_B_DIGEST, DUMMY_DIGEST};
use crate::service;
use crate::upload::UploadSession;
use crate::{Error, Sha256Digest};

mod utils;
use self::utils::make_grpc_axon_service_client;

/// This produces a template, which will be applied to all individual test
/// functions. See https://github.com/la10736/rstest/issues/130#issuecomment-968864832
#[template]
#[rstest]
#[case::grpc(make_grpc_axon_service_client().await)]
#[case::redb(service::from_addr("redb://").await.unwrap())]
pub fn axon_services(#[case] axon: Arc<dyn AxonService>) {}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock after epoch")
        .as_millis() as u64
}

async fn read_all(axon: &Arc<dyn AxonService>, digest: &Sha256Digest) -> Vec<u8> {
    axon.get(digest)
        .await
        .expect("get must succeed")
        .try_collect::<Vec<Bytes>>()
        .await
        .expect("stream must not fail")
        .concat()
}

/// Using has on a non-existing blob should return false.
#[apply(axon_services)]
#[tokio::test]
async fn has_nonexistent_false(axon: Arc<dyn AxonService>) {
    assert!(!axon.has(&BLOB_A_DIGEST).await.expect("must not fail"));
}

/// Getting a non-existing blob fails with NoSuchFile carrying the hex digest.
#[apply(axon_services)]
#[tokio::test]
async fn get_missing_fails(axon: Arc<dyn AxonService>) {
    match axon.get(&DUMMY_DIGEST).await {
        Err(Error::NoSuchFile(hex)) => assert_eq!(hex, DUMMY_DIGEST.to_hex()),
        other => panic!("expected NoSuchFile, got {:?}", other.map(|_| ())),
    }
}

/// Put a small blob, check has, stream it back, check the counters.
#[apply(axon_services)]
#[tokio::test]
async fn put_has_get_small(axon: Arc<dyn AxonService>) {
    let (size, digest) = axon.put(BLOB_A.clone()).await.expect("put must succeed");
    assert_eq!(size, BLOB_A.len() as u64);
    assert_eq!(digest, *BLOB_A_DIGEST);

    assert!(axon.has(&digest).await.expect("must not fail"));
    assert_eq!(read_all(&axon, &digest).await, BLOB_A.to_vec());

    let metrics = axon.metrics().await.expect("metrics must succeed");
    assert_eq!(metrics.file_count, 1);
    assert_eq!(metrics.size_bytes, BLOB_A.len() as u64);
}

/// Putting the same bytes twice yields the same digest, and neither the
/// sync sequence nor the counters grow a second time.
#[apply(axon_services)]
#[tokio::test]
async fn put_twice_dedups(axon: Arc<dyn AxonService>) {
    let first = axon.put(BLOB_A.clone()).await.expect("put must succeed");
    let second = axon.put(BLOB_A.clone()).await.expect("put must succeed");
    assert_eq!(first, second);

    let entries: Vec<_> = axon
        .hashes(0)
        .await
        .expect("hashes must succeed")
        .try_collect()
        .await
        .expect("stream must not fail");
    assert_eq!(entries.len(), 1);

    let metrics = axon.metrics().await.expect("metrics must succeed");
    assert_eq!(metrics.file_count, 1);
    assert_eq!(metrics.size_bytes, BLOB_A.len() as u64);
}

/// puts returns positional results.
#[apply(axon_services)]
#[tokio::test]
async fn puts_batch_is_positional(axon: Arc<dyn AxonService>) {
    let results = axon
        .puts(vec![BLOB_A.clone(), BLOB_B.clone()])
        .await
        .expect("puts must succeed");

    assert_eq!(
        results,
        vec![
            (BLOB_A.len() as u64, BLOB_A_DIGEST.clone()),
            (BLOB_B.len() as u64, BLOB_B_DIGEST.clone()),
        ]
    );
}

/// wants returns exactly the absent digests, in input order.
#[apply(axon_services)]
#[tokio::test]
async fn wants_returns_missing_in_order(axon: Arc<dyn AxonService>) {
    axon.put(BLOB_A.clone()).await.expect("put must succeed");

    let missing = axon
        .wants(vec![BLOB_A_DIGEST.clone(), BLOB_B_DIGEST.clone()])
        .await
        .expect("wants must succeed");
    assert_eq!(missing, vec![BLOB_B_DIGEST.clone()]);

    let missing = axon
        .wants(vec![BLOB_B_DIGEST.clone(), BLOB_A_DIGEST.clone()])
        .await
        .expect("wants must succeed");
    assert_eq!(missing, vec![BLOB_B_DIGEST.clone()]);
}

/// Sync sequence offsets are dense and iterable from any offset.
#[apply(axon_services)]
#[tokio::test]
async fn hashes_offsets_are_dense(axon: Arc<dyn AxonService>) {
    let blobs = [
        Bytes::from_static(b"one"),
        Bytes::from_static(b"two"),
        Bytes::from_static(b"three"),
    ];
    let mut digests = Vec::new();
    for byts in &blobs {
        let (_, digest) = axon.put(byts.clone()).await.expect("put must succeed");
        digests.push(digest);
    }

    let entries: Vec<_> = axon
        .hashes(0)
        .await
        .expect("hashes must succeed")
        .try_collect()
        .await
        .expect("stream must not fail");

    assert_eq!(entries.iter().map(|e| e.offset).collect::<Vec<_>>(), [0, 1, 2]);
    assert_eq!(
        entries.iter().map(|e| e.digest.clone()).collect::<Vec<_>>(),
        digests
    );
    assert_eq!(
        entries.iter().map(|e| e.size).collect::<Vec<_>>(),
        blobs.iter().map(|b| b.len() as u64).collect::<Vec<_>>()
    );

    let tail: Vec<_> = axon
        .hashes(1)
        .await
        .expect("hashes must succeed")
        .try_collect()
        .await
        .expect("stream must not fail");
    assert_eq!(tail.iter().map(|e| e.offset).collect::<Vec<_>>(), [1, 2]);

    let empty: Vec<_> = axon
        .hashes(100)
        .await
        .expect("hashes must succeed")
        .try_collect()
        .await
        .expect("stream must not fail");
    assert!(empty.is_empty());
}

/// History carves by time range: [tick, tock) with an open end.
#[apply(axon_services)]
#[tokio::test]
async fn history_carves_time_ranges(axon: Arc<dyn AxonService>) {
    let tick = now_millis();
    axon.put(BLOB_A.clone()).await.expect("put must succeed");

    tokio::time::sleep(Duration::from_millis(5)).await;
    let tock = now_millis();
    tokio::time::sleep(Duration::from_millis(5)).await;

    axon.put(BLOB_B.clone()).await.expect("put must succeed");

    let bounded: Vec<_> = axon
        .history(tick, Some(tock))
        .await
        .expect("history must succeed")
        .try_collect()
        .await
        .expect("stream must not fail");
    assert_eq!(
        bounded.iter().map(|e| e.digest.clone()).collect::<Vec<_>>(),
        vec![BLOB_A_DIGEST.clone()]
    );

    let open: Vec<_> = axon
        .history(tick, None)
        .await
        .expect("history must succeed")
        .try_collect()
        .await
        .expect("stream must not fail");
    assert_eq!(
        open.iter().map(|e| e.digest.clone()).collect::<Vec<_>>(),
        vec![BLOB_A_DIGEST.clone(), BLOB_B_DIGEST.clone()]
    );
    assert!(open.windows(2).all(|w| w[0].time <= w[1].time));
}

/// Upload a blob through a session in small slices, and read it back.
#[apply(axon_services)]
#[tokio::test]
async fn upload_session_roundtrip(axon: Arc<dyn AxonService>) {
    let mut upload = UploadSession::new(axon.clone());
    for slice in BLOB_B.chunks(64 * 1024) {
        upload.write(slice).await.expect("write must succeed");
    }

    let (size, digest) = upload.save().await.expect("save must succeed");
    assert_eq!(size, BLOB_B.len() as u64);
    assert_eq!(digest, *BLOB_B_DIGEST);

    assert_eq!(read_all(&axon, &digest).await, BLOB_B.to_vec());
}

/// Counters accumulate over distinct blobs.
#[apply(axon_services)]
#[tokio::test]
async fn metrics_accumulate(axon: Arc<dyn AxonService>) {
    axon.put(BLOB_A.clone()).await.expect("put must succeed");
    axon.put(BLOB_B.clone()).await.expect("put must succeed");

    let metrics = axon.metrics().await.expect("metrics must succeed");
    assert_eq!(metrics.file_count, 2);
    assert_eq!(metrics.size_bytes, (BLOB_A.len() + BLOB_B.len()) as u64);
}
