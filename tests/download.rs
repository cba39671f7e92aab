mod common;

use std::sync::Arc;
use std::time::Duration;

use flashkit::cache::ImageCache;
use flashkit::config::DownloadConfig;
use flashkit::download::{DownloadError, DownloadOptions, Downloader, FetchRequest, RetryPolicy};
use flashkit::images::{Checksum, CompressionKind};
use flashkit::utils::CancelToken;

use common::{payload, sha256_hex, Route, TestServer};

fn downloader(cache: Arc<ImageCache>) -> Downloader {
    Downloader::new(cache, &DownloadConfig::default()).unwrap()
}

fn options(retry: RetryPolicy) -> DownloadOptions {
    DownloadOptions {
        retry,
        ..DownloadOptions::default()
    }
}

#[tokio::test]
async fn test_cancelled_download_resumes_with_range() {
    let server = TestServer::start().await;
    let body = payload(256 * 1024);
    server.route(
        "/os.img",
        Route::body(body.clone()).slow(8 * 1024, Duration::from_millis(5)),
    );

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ImageCache::open(dir.path()).unwrap());
    let downloader = downloader(Arc::clone(&cache));
    let checksum: Checksum = format!("sha256:{}", sha256_hex(&body)).parse().unwrap();
    let url = server.url("/os.img");
    let request = FetchRequest {
        url: &url,
        checksum: Some(&checksum),
        compression: CompressionKind::None,
    };

    let cancel = CancelToken::new();
    let err = downloader
        .fetch(&request, &options(RetryPolicy::none()), &cancel, |p| {
            if p.bytes_written >= 64 * 1024 {
                cancel.cancel();
            }
        })
        .await
        .unwrap_err();
    let DownloadError::Cancelled { bytes_written } = err else {
        panic!("expected cancellation, got {:?}", err);
    };

    let kept = cache.partial_len(&request.partial_key());
    assert_eq!(kept, bytes_written);
    assert!(kept >= 64 * 1024 && kept < body.len() as u64);
    assert!(cache.lookup(&checksum).is_none());

    server.route("/os.img", Route::body(body.clone()));
    let entry = downloader
        .fetch(
            &request,
            &options(RetryPolicy::none()),
            &CancelToken::new(),
            |_| {},
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(&entry.path).unwrap(), body);
    let hits = server.hits("/os.img");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].range_start, None);
    assert_eq!(hits[1].range_start, Some(kept));
    assert_eq!(cache.partial_len(&request.partial_key()), 0);
}

#[tokio::test]
async fn test_transient_503_is_retried() {
    let server = TestServer::start().await;
    let body = payload(10_000);
    server.route("/flaky.img", Route::body(body.clone()).failing_first(2));

    let dir = tempfile::tempdir().unwrap();
    let downloader = downloader(Arc::new(ImageCache::open(dir.path()).unwrap()));
    let url = server.url("/flaky.img");
    let request = FetchRequest {
        url: &url,
        checksum: None,
        compression: CompressionKind::None,
    };

    let entry = downloader
        .fetch(
            &request,
            &options(RetryPolicy::exponential(3, Duration::from_millis(1))),
            &CancelToken::new(),
            |_| {},
        )
        .await
        .unwrap();

    assert_eq!(entry.size, body.len() as u64);
    assert_eq!(entry.checksum.digest, sha256_hex(&body));
    assert_eq!(server.hits("/flaky.img").len(), 3);
}

#[tokio::test]
async fn test_retries_exhausted_is_network_error() {
    let server = TestServer::start().await;
    server.route("/down.img", Route::status(503));

    let dir = tempfile::tempdir().unwrap();
    let downloader = downloader(Arc::new(ImageCache::open(dir.path()).unwrap()));
    let url = server.url("/down.img");
    let request = FetchRequest {
        url: &url,
        checksum: None,
        compression: CompressionKind::None,
    };

    let err = downloader
        .fetch(
            &request,
            &options(RetryPolicy::exponential(2, Duration::from_millis(1))),
            &CancelToken::new(),
            |_| {},
        )
        .await
        .unwrap_err();

    assert!(err.is_network());
    assert!(matches!(err, DownloadError::Network { attempts: 2, .. }));
    assert_eq!(server.hits("/down.img").len(), 2);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = TestServer::start().await;

    let dir = tempfile::tempdir().unwrap();
    let downloader = downloader(Arc::new(ImageCache::open(dir.path()).unwrap()));
    let url = server.url("/missing.img");
    let request = FetchRequest {
        url: &url,
        checksum: None,
        compression: CompressionKind::None,
    };

    let err = downloader
        .fetch(
            &request,
            &options(RetryPolicy::exponential(5, Duration::from_millis(1))),
            &CancelToken::new(),
            |_| {},
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
    assert_eq!(server.hits("/missing.img").len(), 1);
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_download() {
    let server = TestServer::start().await;
    let body = payload(128 * 1024);
    server.route(
        "/shared.img",
        Route::body(body.clone()).slow(8 * 1024, Duration::from_millis(2)),
    );

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ImageCache::open(dir.path()).unwrap());
    let downloader = Arc::new(downloader(Arc::clone(&cache)));
    let checksum: Checksum = format!("sha256:{}", sha256_hex(&body)).parse().unwrap();
    let url = server.url("/shared.img");

    let fetch = |downloader: Arc<Downloader>, checksum: Checksum, url: String| async move {
        let request = FetchRequest {
            url: &url,
            checksum: Some(&checksum),
            compression: CompressionKind::None,
        };
        downloader
            .fetch(&request, &DownloadOptions::default(), &CancelToken::new(), |_| {})
            .await
    };
    let (first, second) = tokio::join!(
        fetch(Arc::clone(&downloader), checksum.clone(), url.clone()),
        fetch(Arc::clone(&downloader), checksum.clone(), url.clone()),
    );

    assert_eq!(first.unwrap().path, second.unwrap().path);
    assert_eq!(server.hits("/shared.img").len(), 1);
    assert_eq!(std::fs::read(&cache.lookup(&checksum).unwrap().path).unwrap(), body);
}

#[tokio::test]
async fn test_corrupted_body_is_not_cached() {
    let server = TestServer::start().await;
    let published = payload(4096);
    let mut served = published.clone();
    served[100] ^= 0xff;
    server.route("/flipped.img", Route::body(served));

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ImageCache::open(dir.path()).unwrap());
    let downloader = downloader(Arc::clone(&cache));
    let checksum: Checksum = format!("sha256:{}", sha256_hex(&published)).parse().unwrap();
    let url = server.url("/flipped.img");
    let request = FetchRequest {
        url: &url,
        checksum: Some(&checksum),
        compression: CompressionKind::None,
    };

    let err = downloader
        .fetch(&request, &DownloadOptions::default(), &CancelToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
    assert!(cache.lookup(&checksum).is_none());
    assert_eq!(cache.partial_len(&request.partial_key()), 0);
}
