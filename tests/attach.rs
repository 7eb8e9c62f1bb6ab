mod support;

use agent_terminals::{
    AttachOutcome, AttachmentPhase, ChannelView, SessionEnd, SessionKey, SessionRegistry,
    SpawnOptions, TerminalConfig, TerminalError, TerminalEvent, TerminalSize, ViewAttachments,
    ViewId,
};
use std::sync::Arc;
use support::{wait_until, FakeBackend, RecordingView};

const GRID: TerminalSize = TerminalSize::new(80, 24);

fn attachments(backend: &Arc<FakeBackend>) -> Arc<ViewAttachments> {
    let registry = SessionRegistry::new(backend.clone(), TerminalConfig::default());
    Arc::new(ViewAttachments::new(registry))
}

fn options() -> SpawnOptions {
    SpawnOptions::new("/repo")
}

#[tokio::test]
async fn reopened_dialog_sees_history_once() {
    let backend = FakeBackend::new();
    let attachments = attachments(&backend);
    let key = SessionKey::primary("agent-7");

    let first = RecordingView::sized("dialog-1", Some(GRID));
    let outcome = attachments
        .attach(key.clone(), first.clone(), options())
        .await
        .expect("attach");
    let session_id = match outcome {
        AttachOutcome::Attached {
            session_id,
            reconnected: false,
            replayed: 0,
        } => session_id,
        other => panic!("unexpected outcome {other:?}"),
    };

    attachments.input(&key, b"hello").await.expect("input");
    let handle = backend.last_handle();
    assert_eq!(backend.writes(), vec![(handle, b"hello".to_vec())]);
    backend.emit_output(handle, b"hello\n");
    assert_eq!(first.output_text(), vec!["hello\n"]);

    assert!(attachments.detach(&key));
    assert!(!attachments.detach(&key), "second detach is a no-op");
    assert_eq!(first.disposed(), 1);
    assert!(backend.kills().is_empty());
    assert!(attachments.registry().get(&key).is_some());

    let second = RecordingView::sized("dialog-2", Some(GRID));
    let outcome = attachments
        .attach(key.clone(), second.clone(), options())
        .await
        .expect("reattach");
    assert_eq!(
        outcome,
        AttachOutcome::Attached {
            session_id,
            reconnected: true,
            replayed: 1,
        }
    );
    assert_eq!(second.output_text(), vec!["hello\n"]);
    assert_eq!(second.readies().len(), 1);
    assert!(second.readies()[0].reconnected);
    assert_eq!(backend.spawn_count(), 1);
    assert_eq!(first.output_text(), vec!["hello\n"], "old view gets nothing new");
}

#[tokio::test]
async fn replay_precedes_live_output() {
    let backend = FakeBackend::new();
    let attachments = attachments(&backend);
    let key = SessionKey::shell("agent-1");

    let first = RecordingView::sized("w1", Some(GRID));
    attachments
        .attach(key.clone(), first.clone(), options())
        .await
        .expect("attach");
    let handle = backend.last_handle();
    backend.emit_output(handle, b"a");
    assert!(attachments.detach(&key));

    backend.emit_output(handle, b"b");
    backend.emit_output(handle, b"c");

    let second = RecordingView::sized("w2", Some(GRID));
    attachments
        .attach(key.clone(), second.clone(), options())
        .await
        .expect("reattach");
    backend.emit_output(handle, b"d");

    assert_eq!(second.output_text(), vec!["a", "b", "c", "d"]);
    assert_eq!(first.output_text(), vec!["a"]);
}

#[tokio::test]
async fn repeated_attach_while_initializing_is_ignored() {
    let backend = FakeBackend::gated_spawns();
    let attachments = attachments(&backend);
    let key = SessionKey::primary("agent-2");
    let view = RecordingView::sized("w1", Some(GRID));

    let first = {
        let (attachments, key, view) = (attachments.clone(), key.clone(), view.clone());
        tokio::spawn(async move { attachments.attach(key, view, options()).await })
    };
    wait_until(|| backend.spawn_count() == 1).await;
    assert_eq!(attachments.phase(&key), AttachmentPhase::Initializing);

    let again = attachments
        .attach(key.clone(), view.clone(), options())
        .await
        .expect("second attach");
    assert_eq!(again, AttachOutcome::AlreadyAttached);

    backend.release_spawns(1);
    let outcome = first.await.expect("join").expect("attach");
    assert!(matches!(outcome, AttachOutcome::Attached { .. }));
    assert_eq!(backend.spawn_count(), 1);
    assert_eq!(view.readies().len(), 1);

    let once_more = attachments
        .attach(key.clone(), view.clone(), options())
        .await
        .expect("attach while live");
    assert_eq!(once_more, AttachOutcome::AlreadyAttached);
}

#[tokio::test]
async fn phases_follow_the_view_lifecycle() {
    let backend = FakeBackend::gated_spawns();
    let attachments = attachments(&backend);
    let key = SessionKey::primary("agent-3");
    assert_eq!(attachments.phase(&key), AttachmentPhase::Unmounted);

    let view = RecordingView::sized("w1", Some(GRID));
    let pending = {
        let (attachments, key, view) = (attachments.clone(), key.clone(), view.clone());
        tokio::spawn(async move { attachments.attach(key, view, options()).await })
    };
    wait_until(|| backend.spawn_count() == 1).await;
    assert_eq!(attachments.phase(&key), AttachmentPhase::Initializing);

    backend.release_spawns(1);
    let first_id = match pending.await.expect("join").expect("attach") {
        AttachOutcome::Attached { session_id, .. } => session_id,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(attachments.phase(&key), AttachmentPhase::Live);

    attachments.detach(&key);
    assert_eq!(attachments.phase(&key), AttachmentPhase::Detached);

    attachments
        .attach(key.clone(), view.clone(), options())
        .await
        .expect("reattach");
    assert_eq!(attachments.phase(&key), AttachmentPhase::Live);

    attachments.terminate(&key).await.expect("terminate");
    assert_eq!(attachments.phase(&key), AttachmentPhase::Terminated);
    assert_eq!(view.ends().len(), 1);
    assert_eq!(view.ends()[0].end, SessionEnd::Terminated);
    assert_eq!(backend.kills().len(), 1);

    backend.release_spawns(1);
    let outcome = attachments
        .attach(key.clone(), view.clone(), options())
        .await
        .expect("fresh session");
    match outcome {
        AttachOutcome::Attached {
            session_id,
            reconnected: false,
            replayed: 0,
        } => assert_ne!(session_id, first_id),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(backend.spawn_count(), 2);
    assert_eq!(attachments.phase(&key), AttachmentPhase::Live);
}

#[tokio::test]
async fn process_exit_reaches_attached_view_once() {
    let backend = FakeBackend::new();
    let attachments = attachments(&backend);
    let key = SessionKey::primary("agent-4");
    let view = RecordingView::sized("w1", Some(GRID));

    attachments
        .attach(key.clone(), view.clone(), options())
        .await
        .expect("attach");
    let handle = backend.last_handle();
    backend.emit_output(handle, b"panic: out of tokens\n");
    backend.emit_exit(handle, 1);
    backend.emit_exit(handle, 1);

    let ends = view.ends();
    assert_eq!(ends.len(), 1);
    match &ends[0].end {
        SessionEnd::Exited(exit) => assert_eq!(exit.exit_code, Some(1)),
        other => panic!("unexpected end {other:?}"),
    }
    assert_eq!(ends[0].last_output, vec!["panic: out of tokens"]);
    assert_eq!(attachments.phase(&key), AttachmentPhase::Terminated);
    assert!(!attachments.registry().contains(&key));

    let err = attachments.input(&key, b"x").await.expect_err("no session");
    assert!(matches!(err, TerminalError::SessionNotFound(_)));
}

#[tokio::test]
async fn terminate_is_not_followed_by_exit_notification() {
    let backend = FakeBackend::new();
    let attachments = attachments(&backend);
    let key = SessionKey::shell("agent-5");
    let view = RecordingView::sized("w1", Some(GRID));

    attachments
        .attach(key.clone(), view.clone(), options())
        .await
        .expect("attach");
    let handle = backend.last_handle();
    attachments.terminate(&key).await.expect("terminate");
    backend.emit_exit(handle, 143);

    assert_eq!(view.ends().len(), 1);
    assert_eq!(view.ends()[0].end, SessionEnd::Terminated);
    assert_eq!(view.disposed(), 1);
    assert!(backend.is_killed(handle));
}

#[tokio::test]
async fn second_view_replaces_the_first() {
    let backend = FakeBackend::new();
    let attachments = attachments(&backend);
    let key = SessionKey::primary("agent-6");

    let first = RecordingView::sized("w1", Some(GRID));
    let second = RecordingView::sized("w2", Some(GRID));
    attachments
        .attach(key.clone(), first.clone(), options())
        .await
        .expect("first");
    attachments
        .attach(key.clone(), second.clone(), options())
        .await
        .expect("second");

    assert_eq!(first.disposed(), 1);
    assert_eq!(second.disposed(), 0);

    backend.emit_output(backend.last_handle(), b"only once");
    assert!(first.output().is_empty());
    assert_eq!(second.output_text(), vec!["only once"]);
    assert_eq!(backend.spawn_count(), 1);
}

#[tokio::test]
async fn detach_during_spawn_abandons_the_attach() {
    let backend = FakeBackend::gated_spawns();
    let attachments = attachments(&backend);
    let key = SessionKey::primary("agent-8");
    let view = RecordingView::sized("w1", Some(GRID));

    let pending = {
        let (attachments, key, view) = (attachments.clone(), key.clone(), view.clone());
        tokio::spawn(async move { attachments.attach(key, view, options()).await })
    };
    wait_until(|| backend.spawn_count() == 1).await;
    assert!(attachments.detach(&key));

    backend.release_spawns(1);
    let outcome = pending.await.expect("join").expect("attach");
    assert_eq!(outcome, AttachOutcome::Abandoned);

    let session = attachments.registry().get(&key).expect("session kept");
    assert!(!session.has_view());
    assert!(view.readies().is_empty());
    assert_eq!(attachments.phase(&key), AttachmentPhase::Detached);
}

#[tokio::test]
async fn write_failure_keeps_session_alive() {
    let backend = FakeBackend::new();
    let attachments = attachments(&backend);
    let key = SessionKey::shell("agent-9");
    let view = RecordingView::sized("w1", Some(GRID));
    attachments
        .attach(key.clone(), view.clone(), options())
        .await
        .expect("attach");

    backend.fail_writes(true);
    let err = attachments.input(&key, b"ls\r").await.expect_err("write fails");
    assert!(matches!(err, TerminalError::WriteFailed(_)));
    assert_eq!(attachments.phase(&key), AttachmentPhase::Live);
    assert!(view.ends().is_empty());
}

#[tokio::test]
async fn failed_spawn_leaves_view_unmounted() {
    let backend = FakeBackend::new();
    let attachments = attachments(&backend);
    let key = SessionKey::primary("agent-10");
    let view = RecordingView::sized("w1", Some(GRID));
    backend.fail_next_spawn("no such file");

    let err = attachments
        .attach(key.clone(), view.clone(), options())
        .await
        .expect_err("spawn fails");
    assert!(matches!(err, TerminalError::BackendUnavailable(_)));
    assert_eq!(attachments.phase(&key), AttachmentPhase::Unmounted);

    attachments
        .attach(key.clone(), view.clone(), options())
        .await
        .expect("retry");
    assert_eq!(attachments.phase(&key), AttachmentPhase::Live);
}

#[tokio::test]
async fn mount_fit_resizes_to_view_grid() {
    let backend = FakeBackend::new();
    let attachments = attachments(&backend);
    let key = SessionKey::primary("agent-11");
    let view = RecordingView::sized("w1", Some(TerminalSize::new(132, 40)));

    attachments
        .attach(key.clone(), view.clone(), options())
        .await
        .expect("attach");

    assert_eq!(
        backend.resizes(),
        vec![(backend.last_handle(), TerminalSize::new(132, 40))]
    );
    let session = attachments.registry().get(&key).expect("session");
    assert_eq!(session.last_known_size(), Some(TerminalSize::new(132, 40)));
}

#[tokio::test]
async fn channel_view_receives_ready_then_data() {
    let backend = FakeBackend::new();
    let attachments = attachments(&backend);
    let key = SessionKey::shell("agent-12");
    let (view, mut events) = ChannelView::channel(ViewId::new("frontend"), Some(GRID));

    attachments
        .attach(key.clone(), view.clone(), options())
        .await
        .expect("attach");
    backend.emit_output(backend.last_handle(), b"$ ");
    backend.emit_exit(backend.last_handle(), 0);

    match events.try_recv().expect("ready event") {
        TerminalEvent::Ready {
            reconnected: false, ..
        } => {}
        other => panic!("unexpected event {other:?}"),
    }
    let data = events.try_recv().expect("data event");
    assert_eq!(data.decode_data().as_deref(), Some(&b"$ "[..]));
    assert_eq!(
        events.try_recv().expect("exit event"),
        TerminalEvent::Exit {
            exit_code: Some(0),
            terminated: false,
            last_output: vec!["$ ".to_string()],
        }
    );
}

#[tokio::test]
async fn detach_during_replay_does_not_leave_view_attached() {
    let backend = FakeBackend::new();
    let attachments = attachments(&backend);
    let key = SessionKey::primary("agent-13");
    let view = RecordingView::sized("w1", Some(GRID));
    {
        let attachments = Arc::downgrade(&attachments);
        let key = key.clone();
        view.on_ready_run(move || {
            if let Some(attachments) = attachments.upgrade() {
                attachments.detach(&key);
            }
        });
    }

    let outcome = attachments
        .attach(key.clone(), view.clone(), options())
        .await
        .expect("attach");
    assert_eq!(outcome, AttachOutcome::Abandoned);
    assert_eq!(attachments.phase(&key), AttachmentPhase::Detached);
    assert_eq!(view.disposed(), 1);

    let session = attachments.registry().get(&key).expect("session kept");
    assert!(!session.has_view());
    backend.emit_output(backend.last_handle(), b"after close");
    assert!(view.output().is_empty());
    assert!(backend.resizes().is_empty());
}
