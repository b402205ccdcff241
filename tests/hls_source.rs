//! HLS pull source against a local HTTP server

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use relay_rs::{PathConfig, PathError, PathManager, PathState, Protocol, RelayConfig};
use tokio::time::timeout;

use common::{
    annex_b, broken_body, delayed_body, idr_segment, next_coded_frame, playlist, serve, TsWriter,
    VIDEO_PID,
};

#[tokio::test]
async fn test_reader_receives_streamed_segment() {
    common::init_tracing();

    let app = Router::new()
        .route(
            "/stream.m3u8",
            get(|| async { playlist(0, &["segment.ts"], false) }),
        )
        .route(
            "/segment.ts",
            get(|| async {
                let mut ts = TsWriter::new(VIDEO_PID);
                let mut first = ts.tables();
                first.extend(ts.pes(90_000, &annex_b(&[&[7, 1, 2, 3], &[8]]), false));
                let second = ts.pes(180_000, &annex_b(&[&[5]]), false);
                // the second half arrives while the segment is still downloading
                delayed_body(vec![
                    (Duration::ZERO, first),
                    (Duration::from_secs(1), second),
                ])
            }),
        );
    let base = serve(app).await;

    let config = RelayConfig::default()
        .disable(Protocol::Hls)
        .disable(Protocol::Rtmp)
        .path(
            PathConfig::hls("proxied", &format!("{}/stream.m3u8", base))
                .unwrap()
                .on_demand(true),
        );
    let manager = PathManager::new(config).unwrap();

    let mut reader = timeout(Duration::from_secs(5), manager.read("proxied", Protocol::Rtsp))
        .await
        .unwrap()
        .unwrap();

    let track = reader.track().cloned().unwrap();
    assert_eq!(&track.sps[..], &[7, 1, 2, 3]);
    assert_eq!(&track.pps[..], &[8]);

    let frame = timeout(Duration::from_secs(3), next_coded_frame(&mut reader))
        .await
        .unwrap()
        .unwrap();
    assert!(frame.is_keyframe());

    let packet = frame.packet().unwrap();
    assert_eq!(&packet.payload[..], &[0x05]);
    assert_eq!(packet.payload_type, 96);
    assert_eq!(packet.timestamp, 180_000);
    assert!(packet.marker);

    drop(reader);
    manager.close().await;
}

#[tokio::test]
async fn test_master_playlist_until_end_list() {
    common::init_tracing();

    let app = Router::new()
        .route(
            "/master.m3u8",
            get(|| async {
                "#EXTM3U\n\
                 #EXT-X-VERSION:3\n\
                 #EXT-X-STREAM-INF:BANDWIDTH=500000\n\
                 low/index.m3u8\n\
                 #EXT-X-STREAM-INF:BANDWIDTH=3000000\n\
                 high/index.m3u8\n"
            }),
        )
        .route(
            "/high/index.m3u8",
            get(|| async { playlist(7, &["a.ts", "b.ts"], true) }),
        )
        .route(
            "/high/a.ts",
            get(|| async { delayed_body(vec![(Duration::from_millis(200), idr_segment(0))]) }),
        )
        .route("/high/b.ts", get(|| async { idr_segment(2 * 90_000) }));
    let base = serve(app).await;

    let config = RelayConfig::default().path(
        PathConfig::hls("vod", &format!("{}/master.m3u8", base))
            .unwrap()
            .on_demand(true),
    );
    let manager = PathManager::new(config).unwrap();
    let path = manager.resolve_path("vod").await.unwrap();

    let mut reader = timeout(Duration::from_secs(5), path.attach())
        .await
        .unwrap()
        .unwrap();

    let mut timestamps = Vec::new();
    while let Ok(Some(frame)) = timeout(Duration::from_secs(5), reader.recv()).await {
        if frame.is_keyframe() {
            timestamps.push(frame.timestamp);
        }
    }
    // both segments, then the end of the playlist closes the reader
    assert_eq!(timestamps, vec![90_000, 3 * 90_000]);

    timeout(Duration::from_secs(2), path.wait_for_state(PathState::Idle))
        .await
        .unwrap()
        .unwrap();

    let stats = path.stats().await.unwrap();
    assert_eq!(stats.source.segments, 2);
    assert_eq!(stats.source.keyframes, 2);
    assert!(stats.source.playlists >= 2);
    assert_eq!(stats.source_failures, 0);
    assert!(stats.last_error.unwrap().is_termination());

    manager.close().await;
}

#[tokio::test]
async fn test_malformed_segment_is_skipped() {
    common::init_tracing();

    let app = Router::new()
        .route(
            "/stream.m3u8",
            get(|| async { playlist(0, &["bad.ts", "good.ts"], true) }),
        )
        .route(
            "/bad.ts",
            get(|| async {
                // adaptation field longer than the packet
                let mut garbage = vec![0x47u8; 188];
                garbage[1] = 0x00;
                garbage[3] = 0x30;
                garbage[4] = 250;
                garbage
            }),
        )
        .route("/good.ts", get(|| async { idr_segment(0) }));
    let base = serve(app).await;

    let config = RelayConfig::default().path(
        PathConfig::hls("flaky", &format!("{}/stream.m3u8", base))
            .unwrap()
            .on_demand(true),
    );
    let manager = PathManager::new(config).unwrap();

    let mut reader = timeout(Duration::from_secs(5), manager.read("flaky", Protocol::Rtsp))
        .await
        .unwrap()
        .unwrap();
    let frame = timeout(Duration::from_secs(3), next_coded_frame(&mut reader))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&frame.packet().unwrap().payload[..], &[0x05]);

    let stats = manager.get_path("flaky").await.unwrap().stats().await.unwrap();
    assert!(stats.source.parse_errors >= 1);
    assert_eq!(stats.source.keyframes, 1);

    drop(reader);
    manager.close().await;
}

#[tokio::test]
async fn test_broken_download_while_running_resumes_without_duplicates() {
    common::init_tracing();

    let fetches = Arc::new(AtomicUsize::new(0));
    let segment_fetches = Arc::clone(&fetches);
    let playlist_fetches = Arc::clone(&fetches);

    let app = Router::new()
        .route(
            "/stream.m3u8",
            get(move || {
                let fetches = Arc::clone(&playlist_fetches);
                async move {
                    // a new segment shows up once the broken one was re-fetched
                    if fetches.load(Ordering::SeqCst) >= 2 {
                        playlist(0, &["segment.ts", "next.ts"], false)
                    } else {
                        playlist(0, &["segment.ts"], false)
                    }
                }
            }),
        )
        .route(
            "/segment.ts",
            get(move || {
                let fetches = Arc::clone(&segment_fetches);
                async move {
                    let mut ts = TsWriter::new(VIDEO_PID);
                    let mut data = ts.tables();
                    data.extend(ts.pes(180_000, &annex_b(&[&[7, 1, 2, 3], &[8], &[5]]), false));
                    data.extend(ts.pes(183_000, &annex_b(&[&[0x41, 1]]), false));

                    if fetches.fetch_add(1, Ordering::SeqCst) == 0 {
                        broken_body(data, Duration::from_millis(300))
                    } else {
                        data.into()
                    }
                }
            }),
        )
        .route(
            "/next.ts",
            get(|| async {
                let mut ts = TsWriter::new(VIDEO_PID);
                let mut data = ts.tables();
                data.extend(ts.pes(186_000, &annex_b(&[&[0x41, 2]]), false));
                data
            }),
        );
    let base = serve(app).await;

    let config = RelayConfig::default()
        .source_retry_pause(Duration::from_millis(100))
        .source_poll_interval(Duration::from_millis(100), Duration::from_millis(200))
        .path(
            PathConfig::hls("live", &format!("{}/stream.m3u8", base))
                .unwrap()
                .on_demand(true),
        );
    let manager = PathManager::new(config).unwrap();

    let mut reader = timeout(Duration::from_secs(5), manager.read("live", Protocol::Rtsp))
        .await
        .unwrap()
        .unwrap();
    let path = manager.get_path("live").await.unwrap();
    assert_eq!(path.state(), PathState::Running);

    let mut timestamps = Vec::new();
    while !timestamps.contains(&186_000) {
        let frame = timeout(Duration::from_secs(5), next_coded_frame(&mut reader))
            .await
            .unwrap()
            .unwrap();
        timestamps.push(frame.timestamp);
    }

    assert!(
        timestamps.windows(2).all(|w| w[0] < w[1]),
        "frames repeated or out of order: {:?}",
        timestamps
    );
    assert!(timestamps.contains(&183_000));
    assert_eq!(fetches.load(Ordering::SeqCst), 2);

    let stats = path.stats().await.unwrap();
    assert_eq!(stats.state, PathState::Running);
    assert_eq!(stats.source.fetch_errors, 1);
    assert_eq!(stats.source_failures, 0);

    drop(reader);
    manager.close().await;
}

#[tokio::test]
async fn test_broken_download_reports_read_error() {
    common::init_tracing();

    let app = Router::new()
        .route(
            "/stream.m3u8",
            get(|| async { playlist(0, &["broken.ts"], false) }),
        )
        .route(
            "/broken.ts",
            get(|| async {
                let tables = TsWriter::new(VIDEO_PID).tables();
                broken_body(tables, Duration::from_millis(50))
            }),
        );
    let base = serve(app).await;

    let config = RelayConfig::default()
        .source_max_failures(1)
        .path(
            PathConfig::hls("cut", &format!("{}/stream.m3u8", base))
                .unwrap()
                .on_demand(true),
        );
    let manager = PathManager::new(config).unwrap();

    let err = timeout(Duration::from_secs(5), manager.read("cut", Protocol::Rtsp))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        PathError::StartFailed { reason, .. } => {
            let expected = format!("last: read error on {}/broken.ts: ", base);
            assert!(reason.contains(&expected), "{}", reason);
        }
        other => panic!("unexpected error: {:?}", other),
    }

    manager.close().await;
}
