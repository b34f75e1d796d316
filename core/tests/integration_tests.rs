//! Cross-module end-to-end scenarios exercising `Path`, `PathManager`,
//! `Stream`, `Authenticator`, and `PathmuxConfig` wired together rather than
//! in isolation.
//!
//! Run with: cargo test --test integration_tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use pathmux_core::{
    AttachReaderOutcome, AuthRequest, Authenticator, CodecParameters, ConfigWatcher, Format, Media,
    MediaKind, MtxDuration, PathConfig, PathManager, PathmuxConfig, Payload, SampleUnit,
    SessionDescription, StaticSource, StaticSourceContext, StaticSourceFactory, StaticSourceHandle,
    TokioSpawner, Transport,
};
use pathmux_core::config::{Action, SourceKind};
use pathmux_core::error::{PathmuxError, PathmuxResult};

fn h264_description() -> SessionDescription {
    SessionDescription::new(vec![Media::new(
        MediaKind::Video,
        vec![Format::new(
            90_000,
            CodecParameters::H264 {
                sps: vec![],
                pps: vec![],
            },
        )],
    )])
}

fn h264_format() -> Format {
    Format::new(
        90_000,
        CodecParameters::H264 {
            sps: vec![],
            pps: vec![],
        },
    )
}

fn manager(config: PathmuxConfig) -> Arc<PathManager> {
    let spawner = Arc::new(TokioSpawner::current());
    PathManager::new(config, spawner)
}

/// Scenario 1: one publisher, one reader, 100 access units delivered in order.
#[tokio::test]
async fn publisher_and_reader_exchange_one_hundred_units_in_order() {
    let mut config = PathmuxConfig::default();
    config.paths.insert("cam1".into(), PathConfig::default());
    let manager = manager(config);

    let path = manager.get_or_create("cam1").unwrap();
    let (_pub_guard, stream) = path
        .attach_publisher(h264_description(), None, Transport::Rtsp)
        .await
        .unwrap();

    let (_reader_guard, outcome) = path.attach_reader(None, Transport::Hls).await.unwrap();
    let reader_stream = match outcome {
        AttachReaderOutcome::Ready(stream) => stream,
        _ => panic!("publisher is already attached, reader should be Ready immediately"),
    };
    let format = h264_format();
    let (reader_id, _) = reader_stream.add_reader(0, &format).unwrap();
    let mut handle = reader_stream.start_reader(reader_id).unwrap();

    for pts in 0..100i64 {
        stream
            .write_unit(0, &format, SampleUnit::new(pts, Payload::H264(vec![])))
            .unwrap();
    }

    for expected in 0..100i64 {
        let unit = handle.recv().await.expect("unit");
        assert_eq!(unit.pts, expected);
    }
}

/// A static source double that becomes ready almost immediately and stays
/// connected until cancelled, for scenario 2.
struct InstantSource;

#[async_trait]
impl StaticSource for InstantSource {
    async fn run(&self, ctx: StaticSourceContext, parent: StaticSourceHandle) -> PathmuxResult<()> {
        parent.set_ready(h264_description()).await?;
        ctx.cancelled().await;
        Ok(())
    }

    fn describe(&self) -> &'static str {
        "instant-test-source"
    }
}

struct InstantSourceFactory;

impl StaticSourceFactory for InstantSourceFactory {
    fn create(
        &self,
        _source: &SourceKind,
        _captures: &[String],
    ) -> PathmuxResult<Arc<dyn StaticSource>> {
        Ok(Arc::new(InstantSource))
    }
}

/// Scenario 2: an on-demand static source starts on first reader arrival and
/// is torn down once idle for `sourceOnDemandCloseAfter`.
#[tokio::test]
async fn on_demand_source_starts_on_reader_and_closes_when_idle() {
    let mut config = PathmuxConfig::default();
    config.paths.insert(
        "stream1".into(),
        PathConfig {
            source: SourceKind::Url("rtsp://origin/live".into()),
            source_on_demand: true,
            source_on_demand_close_after: MtxDuration::from(Duration::from_millis(30)),
            ..Default::default()
        },
    );
    let spawner = Arc::new(TokioSpawner::current());
    let manager = PathManager::with_source_factory(config, spawner, Arc::new(InstantSourceFactory));

    let path = manager.get_or_create("stream1").unwrap();
    assert_eq!(path.describe().state, "idle");

    let (reader_guard, outcome) = path.attach_reader(None, Transport::Rtsp).await.unwrap();
    let mut rx = match outcome {
        AttachReaderOutcome::Pending(rx) => rx,
        _ => panic!("on-demand source has not announced yet, reader should be Pending"),
    };
    rx.changed().await.unwrap();
    assert!(matches!(
        *rx.borrow(),
        pathmux_core::SourceSignal::Ready(_)
    ));
    assert_eq!(path.describe().state, "ready");

    reader_guard.detach();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(path.describe().state, "idle");
}

/// Scenario 3: an overriding publisher evicts the previous one, who observes
/// `Replaced`; a reader attached beforehand sees end-of-stream, then picks up
/// the new publisher's data after reattaching.
#[tokio::test]
async fn overriding_publisher_evicts_previous_and_reader_reattaches() {
    let mut config = PathmuxConfig::default();
    config.paths.insert(
        "cam1".into(),
        PathConfig {
            override_publisher: true,
            ..Default::default()
        },
    );
    let manager = manager(config);
    let path = manager.get_or_create("cam1").unwrap();

    let (guard_a, stream_a) = path
        .attach_publisher(h264_description(), None, Transport::Rtsp)
        .await
        .unwrap();
    let (reader_guard, outcome) = path.attach_reader(None, Transport::Hls).await.unwrap();
    let stream_for_reader = match outcome {
        AttachReaderOutcome::Ready(stream) => stream,
        _ => panic!("publisher already attached"),
    };
    let format = h264_format();
    let (reader_id, _) = stream_for_reader.add_reader(0, &format).unwrap();
    let mut handle = stream_for_reader.start_reader(reader_id).unwrap();

    stream_a
        .write_unit(0, &format, SampleUnit::new(0, Payload::H264(vec![])))
        .unwrap();
    assert_eq!(handle.recv().await.unwrap().pts, 0);

    // A real front-end drops its Stream handle once the reader handle is
    // established; dropping it here lets the old Stream's broadcast sender
    // go away the moment the actor's own reference is replaced below, which
    // is what actually delivers end-of-stream to `handle`.
    drop(stream_a);
    drop(stream_for_reader);

    let (guard_b, stream_b) = path
        .attach_publisher(h264_description(), None, Transport::Rtsp)
        .await
        .unwrap();

    let reason = tokio::time::timeout(Duration::from_millis(100), guard_a.wait_terminated())
        .await
        .expect("evicted publisher should be notified promptly");
    assert!(matches!(reason, PathmuxError::Replaced));

    assert!(
        handle.recv().await.is_none(),
        "reader attached before the override should observe end-of-stream"
    );

    let (_reader_guard2, outcome2) = path.attach_reader(None, Transport::Hls).await.unwrap();
    let stream_for_reattach = match outcome2 {
        AttachReaderOutcome::Ready(stream) => stream,
        _ => panic!("publisher B is attached, reader should be Ready"),
    };
    let (reader_id2, _) = stream_for_reattach.add_reader(0, &format).unwrap();
    let mut handle2 = stream_for_reattach.start_reader(reader_id2).unwrap();
    stream_b
        .write_unit(0, &format, SampleUnit::new(42, Payload::H264(vec![])))
        .unwrap();
    assert_eq!(handle2.recv().await.unwrap().pts, 42);

    drop(reader_guard);
    drop(guard_b);
}

/// Scenario 4: applying a new config restarts a path whose source changed,
/// removes one dropped from the table, and eagerly starts one newly added
/// with a static source; sessions on the restarted path see end-of-stream.
#[tokio::test]
async fn apply_config_restarts_removes_and_starts_paths_with_brief_eof() {
    let mut config = PathmuxConfig::default();
    config.paths.insert("a".into(), PathConfig::default());
    config.paths.insert("b".into(), PathConfig::default());
    let manager = manager(config);

    let path_a = manager.get_or_create("a").unwrap();
    manager.get_or_create("b").unwrap();

    let (_pub_guard, stream_a) = path_a
        .attach_publisher(h264_description(), None, Transport::Rtsp)
        .await
        .unwrap();
    let (_reader_guard, outcome) = path_a.attach_reader(None, Transport::Hls).await.unwrap();
    let stream_for_reader = match outcome {
        AttachReaderOutcome::Ready(stream) => stream,
        _ => panic!("publisher already attached on a"),
    };
    let format = h264_format();
    let (reader_id, _) = stream_for_reader.add_reader(0, &format).unwrap();
    let mut handle = stream_for_reader.start_reader(reader_id).unwrap();
    drop(stream_a);
    drop(stream_for_reader);

    let mut next = PathmuxConfig::default();
    next.paths.insert(
        "a".into(),
        PathConfig {
            source: SourceKind::Url("rtsp://origin/live".into()),
            ..Default::default()
        },
    );
    next.paths.insert("c".into(), PathConfig::default());

    let diff = manager.apply_config(next);
    assert_eq!(diff.restarted, vec!["a".to_string()]);
    assert_eq!(diff.removed, vec!["b".to_string()]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.find("b").is_none());
    assert!(
        handle.recv().await.is_none(),
        "sessions on a restarted path should see end-of-stream"
    );
}

/// Scenario 5: an internal auth rule keyed on a sha256-hashed password
/// accepts the right user/password/action and rejects every variation.
#[tokio::test]
async fn sha256_auth_rule_accepts_matching_credentials_and_rejects_others() {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(b"correct horse");
    let digest_b64 = BASE64.encode(hasher.finalize());

    let mut config = PathmuxConfig::default();
    config.auth_internal_users.push(pathmux_core::config::AuthRule {
        user: pathmux_core::config::UserMatch::Exact("alice".into()),
        pass: Some(format!("sha256:{digest_b64}")),
        ips: vec![],
        action: Action::Publish,
        path: "cam1".into(),
    });
    let auth = Authenticator::new(&config);

    let ok = AuthRequest::new(Action::Publish, "cam1").with_credentials("alice", "correct horse");
    assert!(auth.authorize(&ok).await.is_ok());

    let wrong_user =
        AuthRequest::new(Action::Publish, "cam1").with_credentials("bob", "correct horse");
    assert!(auth.authorize(&wrong_user).await.is_err());

    let wrong_pass =
        AuthRequest::new(Action::Publish, "cam1").with_credentials("alice", "wrong horse");
    assert!(auth.authorize(&wrong_pass).await.is_err());

    let wrong_action =
        AuthRequest::new(Action::Read, "cam1").with_credentials("alice", "correct horse");
    assert!(auth.authorize(&wrong_action).await.is_err());
}

/// Scenario 6: YAML with an unknown field is rejected, and a running
/// `ConfigWatcher`'s configuration is left untouched by the failed apply.
#[tokio::test]
async fn unknown_yaml_field_is_rejected_and_running_config_is_unchanged() {
    let err = PathmuxConfig::load_from_str("paths:\n  cam: { invalid: 1 }\n").unwrap_err();
    assert!(matches!(err, PathmuxError::ConfigInvalid(_)));
    assert!(err.to_string().contains("invalid"));

    let manager = manager(PathmuxConfig::default());
    let watcher = ConfigWatcher::new(PathmuxConfig::default(), manager);
    let before = watcher.current().write_queue_size;

    let mut invalid = PathmuxConfig::default();
    invalid.write_queue_size = 100;
    assert!(watcher.apply(invalid).is_err());
    assert_eq!(watcher.current().write_queue_size, before);
}
