//! Shared helpers for integration tests

#![allow(dead_code)]

use std::time::Duration;

use axum::body::Body;
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use relay_rs::{Reader, RtpFrame};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[path = "../../src/testutil.rs"]
mod mux;

pub use mux::{annex_b, TsWriter};

pub const VIDEO_PID: u16 = 256;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay_rs=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Serve `app` on an ephemeral port; returns the base URL
pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{}", addr.port())
}

/// A port nothing listens on
pub async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Media playlist listing `segments` (2 s each) starting at `sequence`
pub fn playlist(sequence: u64, segments: &[&str], end_list: bool) -> String {
    let mut out = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:{}\n",
        sequence
    );
    for segment in segments {
        out.push_str(&format!("#EXTINF:2.0,\n{}\n", segment));
    }
    if end_list {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

/// Segment with SPS {7,1,2,3}, PPS {8} and IDR {5}
pub fn idr_segment(pts: i64) -> Vec<u8> {
    let mut ts = TsWriter::new(VIDEO_PID);
    let mut out = ts.tables();
    out.extend(ts.pes(pts, &annex_b(&[&[7, 1, 2, 3], &[8]]), false));
    out.extend(ts.pes(pts + 90_000, &annex_b(&[&[5]]), false));
    out
}

/// Response body sent as chunks with a delay before each
pub fn delayed_body(chunks: Vec<(Duration, Vec<u8>)>) -> Body {
    let stream = futures::stream::iter(chunks).then(|(delay, chunk)| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, std::io::Error>(Bytes::from(chunk))
    });
    Body::from_stream(stream)
}

/// Response body that sends `data`, then fails the transfer after `after`
pub fn broken_body(data: Vec<u8>, after: Duration) -> Body {
    let items = vec![
        Ok(Bytes::from(data)),
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "upstream reset",
        )),
    ];
    let stream = futures::stream::iter(items).then(move |item| async move {
        if item.is_err() {
            tokio::time::sleep(after).await;
        }
        item
    });
    Body::from_stream(stream)
}

/// Next frame that is not a parameter set
pub async fn next_coded_frame(reader: &mut Reader) -> Option<RtpFrame> {
    loop {
        let frame = reader.recv().await?;
        if !frame.is_parameter_set() {
            return Some(frame);
        }
    }
}
