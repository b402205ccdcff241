//! HLS pull source
//!
//! Polls a media playlist and streams every new MPEG-TS segment, in
//! sequence order, into the ingest pipeline. Segment bodies are fed as they
//! arrive, so frames reach readers before the download completes.
//!
//! Failure accounting: a failed fetch is retried (same segment) after the
//! retry pause; a segment that yields nothing but parse errors is skipped.
//! Both count towards a consecutive failure streak that any successful
//! segment resets. The source gives up once the streak reaches
//! `max_failures`, and ends cleanly after the last segment of a playlist
//! carrying `#EXT-X-ENDLIST`.

use std::time::Duration;

use futures::StreamExt;
use hls_m3u8::tags::VariantStream;
use hls_m3u8::{MasterPlaylist, MediaPlaylist};
use url::Url;

use crate::error::SourceError;

use super::ingest::Ingest;

/// Live playlists are joined this many segments behind the edge
const LIVE_START_SEGMENTS: usize = 3;

/// Master playlists followed before giving up
const MAX_MASTER_REDIRECTS: usize = 4;

/// One segment entry of a media playlist
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRef {
    /// Media sequence number
    pub sequence: u64,
    /// Absolute segment URL
    pub url: Url,
    pub duration: Duration,
}

/// Parsed media playlist
#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    pub target_duration: Duration,
    pub media_sequence: u64,
    /// `#EXT-X-ENDLIST` present: no segment will be added
    pub end_list: bool,
    pub segments: Vec<SegmentRef>,
}

/// A fetched playlist document
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistDocument {
    /// Master playlist; the URL of the chosen variant
    Master(Url),
    Media(Playlist),
}

impl PlaylistDocument {
    /// Parse a playlist, resolving relative URIs against `base`
    pub fn parse(input: &str, base: &Url) -> Result<Self, SourceError> {
        if input.contains("#EXT-X-STREAM-INF") {
            return parse_master(input, base).map(PlaylistDocument::Master);
        }
        parse_media(input, base).map(PlaylistDocument::Media)
    }
}

fn parse_master(input: &str, base: &Url) -> Result<Url, SourceError> {
    let master =
        MasterPlaylist::try_from(input).map_err(|e| SourceError::Playlist(e.to_string()))?;

    // highest advertised bandwidth wins
    let uri = master
        .variant_streams
        .iter()
        .filter_map(|variant| match variant {
            VariantStream::ExtXStreamInf {
                uri, stream_data, ..
            } => Some((stream_data.bandwidth(), uri.to_string())),
            VariantStream::ExtXIFrame { .. } => None,
        })
        .max_by_key(|(bandwidth, _)| *bandwidth)
        .map(|(_, uri)| uri)
        .ok_or_else(|| SourceError::Playlist("master playlist without variants".into()))?;

    base.join(&uri)
        .map_err(|e| SourceError::Playlist(format!("invalid variant URI {}: {}", uri, e)))
}

fn parse_media(input: &str, base: &Url) -> Result<Playlist, SourceError> {
    let media =
        MediaPlaylist::try_from(input).map_err(|e| SourceError::Playlist(e.to_string()))?;

    let media_sequence = media.media_sequence as u64;
    let segments = media
        .segments
        .iter()
        .enumerate()
        .map(|(index, (_idx, segment))| {
            let uri: &str = segment.uri();
            let url = base.join(uri).map_err(|e| {
                SourceError::Playlist(format!("invalid segment URI {}: {}", uri, e))
            })?;
            Ok(SegmentRef {
                sequence: media_sequence + index as u64,
                url,
                duration: segment.duration.duration(),
            })
        })
        .collect::<Result<Vec<_>, SourceError>>()?;

    Ok(Playlist {
        target_duration: media.target_duration,
        media_sequence,
        end_list: input.contains("#EXT-X-ENDLIST"),
        segments,
    })
}

impl Playlist {
    /// First sequence to fetch when joining this playlist
    fn start_sequence(&self) -> u64 {
        if self.end_list {
            return self.media_sequence;
        }
        let skip = self.segments.len().saturating_sub(LIVE_START_SEGMENTS);
        self.media_sequence + skip as u64
    }

    /// Sequence following the last listed segment
    fn end_sequence(&self) -> u64 {
        self.media_sequence + self.segments.len() as u64
    }
}

/// Pulls an HLS playlist
#[derive(Debug, Clone)]
pub struct HlsSource {
    url: Url,
}

impl HlsSource {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) async fn run(self, ingest: &mut Ingest) -> Result<(), SourceError> {
        let settings = ingest.context().settings.clone();
        let client = reqwest::Client::builder()
            .connect_timeout(settings.read_timeout)
            .build()
            .map_err(|e| SourceError::http(self.url.as_str(), e))?;

        let mut poller = Poller {
            client,
            playlist_url: self.url,
            read_timeout: settings.read_timeout,
            retry_pause: settings.retry_pause,
            max_failures: settings.max_failures.max(1),
            poll_min: settings.poll_min,
            poll_max: settings.poll_max,
            next_sequence: None,
            failures: 0,
            redirects: 0,
        };
        poller.run(ingest).await
    }
}

struct Poller {
    client: reqwest::Client,
    playlist_url: Url,
    read_timeout: Duration,
    retry_pause: Duration,
    max_failures: u32,
    poll_min: Duration,
    poll_max: Duration,
    next_sequence: Option<u64>,
    failures: u32,
    redirects: usize,
}

impl Poller {
    async fn run(&mut self, ingest: &mut Ingest) -> Result<(), SourceError> {
        loop {
            let playlist = match self.load_playlist(ingest).await {
                Ok(Some(playlist)) => playlist,
                // followed a master playlist
                Ok(None) => continue,
                Err(e) => {
                    ingest.context().metrics.add_fetch_error();
                    self.fail(ingest, e)?;
                    tokio::time::sleep(self.retry_pause).await;
                    continue;
                }
            };

            let start = self.cursor(ingest, &playlist);
            let mut next = start;
            let mut fetch_failed = false;

            for segment in playlist.segments.iter().filter(|s| s.sequence >= start) {
                if let Err(e) = self.fetch_segment(ingest, &segment.url).await {
                    ingest.discard_segment();
                    ingest.context().metrics.add_fetch_error();
                    self.fail(ingest, e)?;
                    fetch_failed = true;
                    break;
                }

                let outcome = ingest.end_segment();
                next = segment.sequence + 1;
                self.next_sequence = Some(next);

                if outcome.is_failure() {
                    self.fail(
                        ingest,
                        SourceError::MalformedSegment {
                            url: segment.url.to_string(),
                            errors: outcome.errors,
                        },
                    )?;
                } else {
                    self.failures = 0;
                    tracing::debug!(
                        path = %ingest.context().path,
                        sequence = segment.sequence,
                        duration = ?segment.duration,
                        units = outcome.units,
                        errors = outcome.errors,
                        "Segment ingested"
                    );
                }
            }

            if fetch_failed {
                tokio::time::sleep(self.retry_pause).await;
                continue;
            }

            if playlist.end_list && next >= playlist.end_sequence() {
                tracing::info!(
                    path = %ingest.context().path,
                    url = %self.playlist_url,
                    "Playlist ended"
                );
                return Err(SourceError::Terminated);
            }

            let pause = playlist.target_duration.clamp(self.poll_min, self.poll_max);
            tokio::time::sleep(pause).await;
        }
    }

    /// Fetch and parse the playlist; `None` after switching to a variant
    async fn load_playlist(&mut self, ingest: &Ingest) -> Result<Option<Playlist>, SourceError> {
        let response = self.request(&self.playlist_url).await?;
        let text = tokio::time::timeout(self.read_timeout, response.text())
            .await
            .map_err(|_| self.read_timed_out(&self.playlist_url))?
            .map_err(|e| SourceError::http(self.playlist_url.as_str(), e))?;
        ingest.context().metrics.add_playlist();

        match PlaylistDocument::parse(&text, &self.playlist_url)? {
            PlaylistDocument::Media(playlist) => Ok(Some(playlist)),
            PlaylistDocument::Master(variant) => {
                self.redirects += 1;
                if self.redirects > MAX_MASTER_REDIRECTS {
                    return Err(SourceError::Playlist("too many nested master playlists".into()));
                }
                tracing::info!(
                    path = %ingest.context().path,
                    variant = %variant,
                    "Following master playlist variant"
                );
                self.playlist_url = variant;
                Ok(None)
            }
        }
    }

    /// Where to resume in this playlist
    fn cursor(&mut self, ingest: &Ingest, playlist: &Playlist) -> u64 {
        match self.next_sequence {
            // upstream restarted its numbering
            Some(next) if playlist.end_sequence() < next => {
                let start = playlist.start_sequence();
                tracing::warn!(
                    path = %ingest.context().path,
                    expected = next,
                    restart = start,
                    "Media sequence went backwards, rejoining playlist"
                );
                self.next_sequence = Some(start);
                start
            }
            Some(next) => {
                if next < playlist.media_sequence {
                    tracing::warn!(
                        path = %ingest.context().path,
                        missed = playlist.media_sequence - next,
                        "Segments expired before they were fetched"
                    );
                }
                if next >= playlist.end_sequence() {
                    // nothing new, but the upstream is alive
                    self.failures = 0;
                }
                next
            }
            None => {
                let start = playlist.start_sequence();
                self.next_sequence = Some(start);
                start
            }
        }
    }

    async fn fetch_segment(&self, ingest: &mut Ingest, url: &Url) -> Result<(), SourceError> {
        let response = self.request(url).await?;
        let mut body = response.bytes_stream();

        loop {
            match tokio::time::timeout(self.read_timeout, body.next()).await {
                Err(_) => return Err(self.read_timed_out(url)),
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(SourceError::http(url.as_str(), e)),
                Ok(Some(Ok(chunk))) => ingest.feed(&chunk),
            }
        }
    }

    async fn request(&self, url: &Url) -> Result<reqwest::Response, SourceError> {
        let response = tokio::time::timeout(self.read_timeout, self.client.get(url.clone()).send())
            .await
            .map_err(|_| self.read_timed_out(url))?
            .map_err(|e| SourceError::http(url.as_str(), e))?;
        response
            .error_for_status()
            .map_err(|e| SourceError::http(url.as_str(), e))
    }

    fn read_timed_out(&self, url: &Url) -> SourceError {
        SourceError::Connect {
            url: url.to_string(),
            reason: format!("no response within {:?}", self.read_timeout),
        }
    }

    /// Count a failure; gives up once the streak reaches the maximum
    fn fail(&mut self, ingest: &Ingest, err: SourceError) -> Result<(), SourceError> {
        self.failures += 1;
        tracing::warn!(
            path = %ingest.context().path,
            error = %err,
            failures = self.failures,
            max = self.max_failures,
            "Source attempt failed"
        );
        if self.failures >= self.max_failures {
            return Err(SourceError::TooManyFailures {
                count: self.failures,
                last: Box::new(err),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://example.com/live/stream.m3u8").unwrap()
    }

    fn media(parsed: PlaylistDocument) -> Playlist {
        match parsed {
            PlaylistDocument::Media(p) => p,
            other => panic!("expected media playlist, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_live_playlist() {
        let input = "#EXTM3U\n\
            #EXT-X-VERSION:3\n\
            #EXT-X-TARGETDURATION:2\n\
            #EXT-X-MEDIA-SEQUENCE:10\n\
            #EXTINF:2.0,\n\
            a.ts\n\
            #EXTINF:2.0,\n\
            b.ts\n\
            #EXTINF:1.5,\n\
            http://cdn.example.com/c.ts\n";

        let playlist = media(PlaylistDocument::parse(input, &base()).unwrap());
        assert_eq!(playlist.target_duration, Duration::from_secs(2));
        assert_eq!(playlist.media_sequence, 10);
        assert!(!playlist.end_list);

        let urls: Vec<&str> = playlist.segments.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "http://example.com/live/a.ts",
                "http://example.com/live/b.ts",
                "http://cdn.example.com/c.ts",
            ]
        );
        assert_eq!(playlist.segments[2].sequence, 12);
        assert_eq!(playlist.segments[2].duration, Duration::from_millis(1500));
        assert_eq!(playlist.end_sequence(), 13);
    }

    #[test]
    fn test_start_sequence() {
        let mut input = String::from(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:100\n",
        );
        for i in 0..6 {
            input.push_str(&format!("#EXTINF:2.0,\nseg{}.ts\n", i));
        }

        // live: join near the edge
        let live = media(PlaylistDocument::parse(&input, &base()).unwrap());
        assert_eq!(live.start_sequence(), 103);

        // finished: play everything
        input.push_str("#EXT-X-ENDLIST\n");
        let vod = media(PlaylistDocument::parse(&input, &base()).unwrap());
        assert!(vod.end_list);
        assert_eq!(vod.start_sequence(), 100);
    }

    #[test]
    fn test_master_picks_highest_bandwidth() {
        let input = "#EXTM3U\n\
            #EXT-X-VERSION:3\n\
            #EXT-X-STREAM-INF:BANDWIDTH=800000\n\
            low/index.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=2400000\n\
            high/index.m3u8\n";

        match PlaylistDocument::parse(input, &base()).unwrap() {
            PlaylistDocument::Master(url) => {
                assert_eq!(url.as_str(), "http://example.com/live/high/index.m3u8")
            }
            other => panic!("expected master playlist, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_playlist() {
        let err = PlaylistDocument::parse("not a playlist", &base()).unwrap_err();
        assert!(matches!(err, SourceError::Playlist(_)));
    }
}
