//! The Stream fan-out substrate: one publisher, many lossy readers.
//!
//! Each track (a `(Media, Format)` pair) gets its own `tokio::sync::broadcast`
//! channel. A slow reader that falls behind the channel's capacity loses the
//! oldest unqueued units automatically — `broadcast` drops them for us and
//! reports `RecvError::Lagged(n)` on the next `recv`, which we fold into a
//! discard counter rather than treating as fatal. New readers additionally
//! receive a snapshot of the track's "recent units ring" so they don't have
//! to wait for the next publisher write to see anything.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::{PathmuxError, PathmuxResult};
use crate::sample::{Format, SampleUnit, SessionDescription};

/// Identifies one reader attached to a [`Stream`].
pub type ReaderId = u64;

/// Identifies one `(Media, Format)` track within a [`Stream`], assigned at
/// stream creation by flattening the session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackKey(pub usize);

struct Track {
    media_index: usize,
    format: Format,
    tx: broadcast::Sender<Arc<SampleUnit>>,
    ring: RwLock<VecDeque<Arc<SampleUnit>>>,
    ring_window: usize,
    units_written: AtomicU64,
    first_unit_written: AtomicBool,
}

impl Track {
    fn new(media_index: usize, format: Format, queue_capacity: usize, recent_units_window: Option<usize>) -> Self {
        let ring_window = recent_units_window.unwrap_or_else(|| recent_units_window_for(&format));
        let (tx, _rx) = broadcast::channel(queue_capacity.max(1));
        Self {
            media_index,
            format,
            tx,
            ring: RwLock::new(VecDeque::with_capacity(ring_window)),
            ring_window,
            units_written: AtomicU64::new(0),
            first_unit_written: AtomicBool::new(false),
        }
    }

    fn push(&self, unit: Arc<SampleUnit>) {
        {
            let mut ring = self.ring.write();
            ring.push_back(Arc::clone(&unit));
            while ring.len() > self.ring_window {
                ring.pop_front();
            }
        }
        self.units_written.fetch_add(1, Ordering::Relaxed);
        self.first_unit_written.store(true, Ordering::Release);
        // No receivers is not an error: a publisher may write before any
        // reader attaches.
        let _ = self.tx.send(unit);
    }

    /// Subscribes to live units and snapshots the recent-units ring
    /// atomically, so the reader sees no gap and no duplicate between the
    /// prefill and the first live unit.
    fn subscribe(&self) -> (VecDeque<Arc<SampleUnit>>, broadcast::Receiver<Arc<SampleUnit>>) {
        let ring = self.ring.read();
        let prefill = ring.clone();
        let rx = self.tx.subscribe();
        (prefill, rx)
    }
}

/// The default recent-units ring window for a format: one GOP's worth of
/// frames for GOP-structured video codecs, the single most recent unit for
/// everything else. Overridable per path via `PathConfig::recent_units_window`
/// (see `config.rs`); this is the fallback when that field is unset.
fn recent_units_window_for(format: &Format) -> usize {
    if format.is_gop_based_video() {
        DEFAULT_GOP_RING_WINDOW
    } else {
        1
    }
}

/// Conservative default assuming a GOP no longer than two seconds at 30fps.
const DEFAULT_GOP_RING_WINDOW: usize = 60;

struct ReaderInfo {
    track: TrackKey,
    started: AtomicBool,
    discards: Arc<AtomicU64>,
}

/// A handle returned by [`Stream::start_reader`]. The owning front-end task
/// drives this with `recv().await` in a loop and forwards each unit to its
/// transport; `None` means the stream closed or the reader was removed.
pub struct ReaderHandle {
    prefill: VecDeque<Arc<SampleUnit>>,
    rx: broadcast::Receiver<Arc<SampleUnit>>,
    discards: Arc<AtomicU64>,
}

impl ReaderHandle {
    pub async fn recv(&mut self) -> Option<Arc<SampleUnit>> {
        if let Some(unit) = self.prefill.pop_front() {
            return Some(unit);
        }
        loop {
            match self.rx.recv().await {
                Ok(unit) => return Some(unit),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.discards.fetch_add(skipped, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Units dropped for this reader because it could not keep up.
    pub fn discard_count(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }
}

/// Owned by a Path while a publisher is bound. Accepts writes from that one
/// publisher and fans them out to every attached, started reader.
pub struct Stream {
    description: SessionDescription,
    tracks: Vec<Track>,
    readers: DashMap<ReaderId, ReaderInfo>,
    next_reader_id: AtomicU64,
    queue_capacity: usize,
    closed: AtomicBool,
}

impl Stream {
    /// Builds a Stream from a publisher's announced description.
    /// `queue_capacity` is the per-track broadcast channel size
    /// (`writeQueueSize`, a power of two). `recent_units_window` overrides
    /// every track's recent-units ring size (`PathConfig::recent_units_window`);
    /// `None` falls back to the per-format default.
    pub fn new(description: SessionDescription, queue_capacity: usize, recent_units_window: Option<usize>) -> Self {
        let mut tracks = Vec::new();
        for (media_index, media) in description.medias.iter().enumerate() {
            for format in &media.formats {
                tracks.push(Track::new(
                    media_index,
                    format.clone(),
                    queue_capacity,
                    recent_units_window,
                ));
            }
        }
        Self {
            description,
            tracks,
            readers: DashMap::new(),
            next_reader_id: AtomicU64::new(1),
            queue_capacity,
            closed: AtomicBool::new(false),
        }
    }

    pub fn description(&self) -> &SessionDescription {
        &self.description
    }

    /// Introspection: every `(TrackKey, Format)` pair this stream carries.
    pub fn formats(&self) -> Vec<(TrackKey, &Format)> {
        self.tracks
            .iter()
            .enumerate()
            .map(|(i, t)| (TrackKey(i), &t.format))
            .collect()
    }

    fn find_track(&self, media_index: usize, format: &Format) -> Option<TrackKey> {
        self.tracks.iter().enumerate().find_map(|(i, t)| {
            if t.media_index == media_index && &t.format == format {
                Some(TrackKey(i))
            } else {
                None
            }
        })
    }

    /// Registers a reader on `(media_index, format)`. The format MUST be one
    /// the publisher advertised; this is validated against the session
    /// description rather than trusted from the caller. Returns a
    /// `(ReaderId, TrackKey)` pair; call `start_reader` to begin delivery.
    pub fn add_reader(&self, media_index: usize, format: &Format) -> PathmuxResult<(ReaderId, TrackKey)> {
        let track = self.find_track(media_index, format).ok_or_else(|| {
            PathmuxError::ProtocolError(format!(
                "reader requested format not advertised by publisher: media {media_index}"
            ))
        })?;
        let reader_id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        self.readers.insert(
            reader_id,
            ReaderInfo {
                track,
                started: AtomicBool::new(false),
                discards: Arc::new(AtomicU64::new(0)),
            },
        );
        Ok((reader_id, track))
    }

    /// Idempotent detach. Safe to call more than once for the same reader.
    pub fn remove_reader(&self, reader_id: ReaderId) {
        self.readers.remove(&reader_id);
    }

    /// Begins delivery to a reader previously registered with `add_reader`.
    /// Units written before this call are not delivered live, but the
    /// reader receives the track's recent-units ring as a prefill.
    pub fn start_reader(&self, reader_id: ReaderId) -> PathmuxResult<ReaderHandle> {
        let info = self
            .readers
            .get(&reader_id)
            .ok_or_else(|| PathmuxError::ProtocolError("unknown reader".into()))?;
        let track = &self.tracks[info.track.0];
        let (prefill, rx) = track.subscribe();
        info.started.store(true, Ordering::Release);
        Ok(ReaderHandle {
            prefill,
            rx,
            discards: Arc::clone(&info.discards),
        })
    }

    /// Publisher write. Never blocks; a slow reader loses units rather than
    /// stalling the publisher. Writing after `close()` is a caller bug.
    pub fn write_unit(&self, media_index: usize, format: &Format, unit: SampleUnit) -> PathmuxResult<()> {
        assert!(
            !self.closed.load(Ordering::Acquire),
            "write_unit called on a closed Stream"
        );
        let track = self.find_track(media_index, format).ok_or_else(|| {
            PathmuxError::ProtocolError(format!(
                "write_unit for format not in session description: media {media_index}"
            ))
        })?;
        self.tracks[track.0].push(Arc::new(unit));
        Ok(())
    }

    /// Total reader count currently attached (started or not).
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    pub fn units_written(&self, track: TrackKey) -> u64 {
        self.tracks[track.0].units_written.load(Ordering::Relaxed)
    }

    /// Closes the stream: every reader's next `recv()` returns `None`
    /// (end-of-stream) once its prefill and any already-broadcast units are
    /// drained. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders would require `&mut self`; instead readers
        // observe closure once `Path` drops this `Stream` entirely (the
        // `broadcast::Sender` then drops and pending `recv`s resolve to
        // `Closed`). Marking `closed` here guards `write_unit` immediately.
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{CodecParameters, Media, MediaKind, Payload};

    fn h264_format() -> Format {
        Format::new(
            90_000,
            CodecParameters::H264 {
                sps: vec![1, 2],
                pps: vec![3],
            },
        )
    }

    fn one_track_description() -> SessionDescription {
        SessionDescription::new(vec![Media::new(MediaKind::Video, vec![h264_format()])])
    }

    #[tokio::test]
    async fn reader_receives_units_in_order() {
        let stream = Stream::new(one_track_description(), 64, None);
        let format = h264_format();
        let (reader_id, _) = stream.add_reader(0, &format).unwrap();
        let mut handle = stream.start_reader(reader_id).unwrap();

        for i in 0..5 {
            stream
                .write_unit(0, &format, SampleUnit::new(i, Payload::H264(vec![])))
                .unwrap();
        }

        for expected in 0..5 {
            let unit = handle.recv().await.expect("unit");
            assert_eq!(unit.pts, expected);
        }
    }

    #[tokio::test]
    async fn late_reader_gets_ring_prefill() {
        let stream = Stream::new(one_track_description(), 64, None);
        let format = h264_format();

        for i in 0..3 {
            stream
                .write_unit(0, &format, SampleUnit::new(i, Payload::H264(vec![])))
                .unwrap();
        }

        let (reader_id, _) = stream.add_reader(0, &format).unwrap();
        let mut handle = stream.start_reader(reader_id).unwrap();
        let first = handle.recv().await.expect("prefilled unit");
        // The ring holds up to DEFAULT_GOP_RING_WINDOW units; with only 3
        // written the prefill starts at the oldest, pts=0.
        assert_eq!(first.pts, 0);
    }

    #[tokio::test]
    async fn reader_rejects_unadvertised_format() {
        let stream = Stream::new(one_track_description(), 64, None);
        let other = Format::new(48_000, CodecParameters::Opus { channels: 2 });
        assert!(stream.add_reader(0, &other).is_err());
    }

    #[tokio::test]
    async fn slow_reader_drops_oldest_and_counts_discards() {
        let stream = Stream::new(one_track_description(), 2, None);
        let format = h264_format();
        let (reader_id, _) = stream.add_reader(0, &format).unwrap();
        let mut handle = stream.start_reader(reader_id).unwrap();

        for i in 0..10 {
            stream
                .write_unit(0, &format, SampleUnit::new(i, Payload::H264(vec![])))
                .unwrap();
        }

        // Drain whatever is left; some units were dropped because the
        // reader never called recv() between writes.
        let mut seen = 0;
        while tokio::time::timeout(std::time::Duration::from_millis(10), handle.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            seen += 1;
        }
        assert!(seen < 10);
        assert!(handle.discard_count() > 0);
    }

    #[tokio::test]
    async fn remove_reader_is_idempotent() {
        let stream = Stream::new(one_track_description(), 64, None);
        let format = h264_format();
        let (reader_id, _) = stream.add_reader(0, &format).unwrap();
        stream.remove_reader(reader_id);
        stream.remove_reader(reader_id);
        assert_eq!(stream.reader_count(), 0);
    }
}
