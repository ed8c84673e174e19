#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end tests for the session state machine against a loopback
//! rendezvous server and scripted media.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{
    loopback, poll, single_server, wait_state, Attempt, EventLog, MockMedia, PeerCall,
    ScriptedConnector, ServerHandle, CANDIDATE,
};
use pairchat_client::chat::ChatOrigin;
use pairchat_client::event::{Alert, SessionEvent};
use pairchat_client::media::MediaCapability;
use pairchat_client::peer::{PeerSignal, RemoteStream};
use pairchat_client::protocol::{
    ClientMessage, IceCandidate, Role, ServerMessage, SessionDescription, UserPreferences,
};
use pairchat_client::session::PEER_PRESENT_NOTICE;
use pairchat_client::{
    LifecycleState, NullMediaCapability, PairChatError, Session, SessionConfig, SessionRole,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn config() -> SessionConfig {
    SessionConfig::new().with_preferences(UserPreferences::from_interest_list("music, games"))
}

/// Connect, `start`, and consume the initial `announce-ready`.
async fn waiting(media: impl MediaCapability) -> (Session, EventLog, ServerHandle) {
    let (connector, mut server) = single_server();
    let (session, events) = Session::connect(connector, media, config());
    let log = EventLog::new(events);

    session.start().unwrap();
    assert_eq!(
        server.next_message().await,
        ClientMessage::AnnounceReady {
            preferences: UserPreferences::from_interest_list("music, games"),
        }
    );
    wait_state(&session, |s| {
        s.lifecycle_state == LifecycleState::Waiting && s.transport_up
    })
    .await;
    (session, log, server)
}

fn matched(server: &ServerHandle, peer: &str, role: Role) {
    server.push(ServerMessage::Matched {
        peer_id: peer.into(),
        role,
    });
}

/// Drive an initiator session all the way to `Connected` with media.
async fn connected_initiator(media: &MockMedia) -> (Session, EventLog, ServerHandle) {
    let (session, log, mut server) = waiting(media.clone()).await;
    matched(&server, "p2", Role::Initiator);

    let peer = media.peer(0).await;
    assert_eq!(
        server.next_message().await,
        ClientMessage::Description { sdp: peer.offer() }
    );
    let answer = SessionDescription::answer("remote-answer");
    server.push(ServerMessage::Description {
        sdp: answer.clone(),
    });
    poll(|| (peer.count(&PeerCall::SetRemote(answer.clone())) == 1).then_some(())).await;
    wait_state(&session, |s| s.local_media_available).await;

    peer.emit(PeerSignal::RemoteStreamReady(RemoteStream {
        id: "remote-1".into(),
    }));
    wait_state(&session, |s| s.lifecycle_state == LifecycleState::Connected).await;
    (session, log, server)
}

// ── End-to-end scenarios ────────────────────────────────────────────

#[tokio::test]
async fn initiator_match_sends_exactly_one_offer() {
    let media = MockMedia::new();
    let (mut session, _log, mut server) = waiting(media.clone()).await;

    matched(&server, "p2", Role::Initiator);

    let peer = media.peer(0).await;
    assert_eq!(
        server.next_message().await,
        ClientMessage::Description { sdp: peer.offer() }
    );
    let snapshot = wait_state(&session, |s| {
        s.lifecycle_state == LifecycleState::Negotiating
    })
    .await;
    assert_eq!(snapshot.peer_id.as_deref(), Some("p2"));
    assert_eq!(snapshot.role, SessionRole::Initiator);

    // Attaching local media raises negotiation-needed; it must not re-offer.
    poll(|| {
        peer.calls()
            .iter()
            .any(|c| matches!(c, PeerCall::AddLocalMedia(_)))
            .then_some(())
    })
    .await;
    server.assert_silent().await;
    assert_eq!(peer.count(&PeerCall::CreateOffer), 1);
    assert_eq!(
        session.snapshot().lifecycle_state,
        LifecycleState::Negotiating
    );

    session.shutdown().await;
}

#[tokio::test]
async fn responder_answers_remote_offer_and_waits_for_stream() {
    let media = MockMedia::new();
    let (mut session, _log, mut server) = waiting(media.clone()).await;

    matched(&server, "p2", Role::Responder);
    let peer = media.peer(0).await;
    assert_eq!(peer.count(&PeerCall::CreateOffer), 0);

    let offer = SessionDescription::offer("offerBlob");
    server.push(ServerMessage::Description { sdp: offer.clone() });

    assert_eq!(
        server.next_message().await,
        ClientMessage::Description { sdp: peer.answer() }
    );
    let calls = peer.calls();
    let set_remote = calls
        .iter()
        .position(|c| *c == PeerCall::SetRemote(offer.clone()))
        .unwrap();
    let create_answer = calls
        .iter()
        .position(|c| *c == PeerCall::CreateAnswer)
        .unwrap();
    assert!(set_remote < create_answer);
    assert_eq!(peer.count(&PeerCall::CreateAnswer), 1);
    assert_eq!(
        session.snapshot().lifecycle_state,
        LifecycleState::Negotiating
    );

    peer.emit(PeerSignal::RemoteStreamReady(RemoteStream {
        id: "remote-1".into(),
    }));
    let snapshot = wait_state(&session, |s| {
        s.lifecycle_state == LifecycleState::Connected
    })
    .await;
    assert!(snapshot.remote_media_available);
    assert_eq!(
        snapshot.remote_stream,
        Some(RemoteStream {
            id: "remote-1".into()
        })
    );

    session.shutdown().await;
}

#[tokio::test]
async fn remote_left_tears_down_and_reannounces() {
    let media = MockMedia::new();
    let (mut session, mut log, mut server) = connected_initiator(&media).await;

    server.push(ServerMessage::ChatReceive {
        text: "hello".into(),
    });
    wait_state(&session, |s| s.chat_log.len() == 1).await;

    server.push(ServerMessage::RemoteLeft);
    assert_eq!(log.until_alert(|_| true).await, Alert::PeerLeft);
    assert!(matches!(
        server.next_message().await,
        ClientMessage::AnnounceReady { .. }
    ));

    let snapshot = wait_state(&session, |s| s.lifecycle_state == LifecycleState::Waiting).await;
    assert!(snapshot.chat_log.is_empty());
    assert!(snapshot.negotiation.is_none());
    assert_eq!(snapshot.peer_id, None);
    assert_eq!(snapshot.role, SessionRole::Unassigned);
    assert!(!snapshot.remote_media_available);
    assert!(!snapshot.local_media_available);

    let peer = media.peer(0).await;
    poll(|| (peer.count(&PeerCall::Close) == 1).then_some(())).await;
    assert!(media.stream(0).await.is_stopped());

    session.shutdown().await;
}

#[tokio::test]
async fn local_skip_sends_skip_then_reannounces() {
    let media = MockMedia::new();
    let (mut session, _log, mut server) = connected_initiator(&media).await;

    session.skip().unwrap();

    assert_eq!(server.next_message().await, ClientMessage::Skip);
    assert!(matches!(
        server.next_message().await,
        ClientMessage::AnnounceReady { .. }
    ));
    server.assert_silent().await;

    let snapshot = wait_state(&session, |s| s.lifecycle_state == LifecycleState::Waiting).await;
    assert!(snapshot.negotiation.is_none());
    assert!(media.stream(0).await.is_stopped());

    session.shutdown().await;
}

// ── Chat relay ──────────────────────────────────────────────────────

#[tokio::test]
async fn chat_log_is_empty_on_every_new_match() {
    let media = MockMedia::new();
    let (mut session, mut log, server) = waiting(media.clone()).await;

    let mut last_generation = session.snapshot().generation;
    for peer in ["a", "b", "a", "b"] {
        matched(&server, peer, Role::Responder);
        let snapshot = log
            .until(|s| {
                s.lifecycle_state == LifecycleState::Matched && s.peer_id.as_deref() == Some(peer)
            })
            .await;
        assert!(snapshot.chat_log.is_empty(), "leaked chat into {peer}");
        assert!(snapshot.generation > last_generation);
        last_generation = snapshot.generation;

        server.push(ServerMessage::ChatReceive {
            text: format!("hi from {peer}"),
        });
        session.send_chat("hello stranger").unwrap();
        wait_state(&session, |s| s.chat_log.len() == 2).await;
    }

    session.shutdown().await;
}

#[tokio::test]
async fn chat_while_waiting_is_neither_sent_nor_logged() {
    let (mut session, _log, mut server) = waiting(MockMedia::new()).await;

    session.send_chat("anyone there?").unwrap();
    session.leave().unwrap();

    assert_eq!(server.next_message().await, ClientMessage::Leave);
    let snapshot = wait_state(&session, |s| s.lifecycle_state == LifecycleState::Idle).await;
    assert!(snapshot.chat_log.is_empty());

    session.shutdown().await;
}

#[tokio::test]
async fn chat_is_relayed_with_local_echo() {
    let media = MockMedia::new();
    let (mut session, _log, mut server) = waiting(media.clone()).await;
    matched(&server, "p2", Role::Responder);
    wait_state(&session, |s| s.peer_present).await;

    session.send_chat("  hey there  ").unwrap();
    session.send_chat("   ").unwrap();
    assert_eq!(
        server.next_message().await,
        ClientMessage::ChatSend {
            text: "hey there".into()
        }
    );
    server.push(ServerMessage::ChatReceive {
        text: "hi!".into(),
    });

    let snapshot = wait_state(&session, |s| s.chat_log.len() == 2).await;
    assert_eq!(snapshot.chat_log[0].origin, ChatOrigin::Local);
    assert_eq!(snapshot.chat_log[0].text, "hey there");
    assert_eq!(snapshot.chat_log[1].origin, ChatOrigin::Remote);
    server.assert_silent().await;

    session.shutdown().await;
}

// ── Generation safety ───────────────────────────────────────────────

#[tokio::test]
async fn media_resolving_after_skip_never_touches_new_context() {
    let media = MockMedia::held();
    let (mut session, _log, mut server) = waiting(media.clone()).await;

    matched(&server, "a", Role::Responder);
    wait_state(&session, |s| s.peer_id.as_deref() == Some("a")).await;
    let first_stream = media.stream(0).await;
    let first_peer = media.peer(0).await;

    session.skip().unwrap();
    assert_eq!(server.next_message().await, ClientMessage::Skip);
    assert!(matches!(
        server.next_message().await,
        ClientMessage::AnnounceReady { .. }
    ));

    matched(&server, "b", Role::Responder);
    let before = wait_state(&session, |s| s.peer_id.as_deref() == Some("b")).await;
    let second_peer = media.peer(1).await;

    // The first acquisition completes only now, mid-way through session "b".
    media.release(0).await;
    poll(|| first_stream.is_stopped().then_some(())).await;
    let second_stream = media.stream(1).await;
    assert_eq!(media.overlapping_acquisitions(), 0);

    // Callbacks from the abandoned peer connection are ignored as well.
    first_peer.emit(PeerSignal::LocalCandidate(IceCandidate::new(CANDIDATE)));
    server.assert_silent().await;

    let after = session.snapshot();
    assert_eq!(after.generation, before.generation);
    assert!(!after.local_media_available);
    assert_eq!(after.negotiation, before.negotiation);
    assert!(!after.negotiation.as_ref().unwrap().media_ready);
    assert!(second_peer
        .calls()
        .iter()
        .all(|c| !matches!(c, PeerCall::AddLocalMedia(_))));

    media.release(1).await;
    let snapshot = wait_state(&session, |s| s.local_media_available).await;
    assert!(snapshot.negotiation.unwrap().media_ready);
    assert!(!second_stream.is_stopped());
    poll(|| {
        (second_peer.count(&PeerCall::AddLocalMedia("local-1".into())) == 1).then_some(())
    })
    .await;

    session.shutdown().await;
}

#[tokio::test]
async fn previous_capture_is_stopped_before_next_acquisition_starts() {
    let media = MockMedia::held();
    let (mut session, _log, mut server) = waiting(media.clone()).await;

    matched(&server, "a", Role::Responder);
    let first_stream = media.stream(0).await;

    session.skip().unwrap();
    assert_eq!(server.next_message().await, ClientMessage::Skip);
    assert!(matches!(
        server.next_message().await,
        ClientMessage::AnnounceReady { .. }
    ));
    matched(&server, "b", Role::Responder);
    wait_state(&session, |s| s.peer_id.as_deref() == Some("b")).await;
    media.peer(1).await;

    // The first capture has not resolved, so the devices are not free yet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(media.stream_count(), 1);
    assert!(!first_stream.is_stopped());

    media.release(0).await;
    let second_stream = media.stream(1).await;
    assert!(first_stream.is_stopped());
    assert!(!second_stream.is_stopped());
    assert_eq!(media.overlapping_acquisitions(), 0);

    session.shutdown().await;
}

#[tokio::test]
async fn attached_capture_is_stopped_before_next_session_acquires() {
    let media = MockMedia::new();
    let (mut session, _log, mut server) = connected_initiator(&media).await;
    let first_stream = media.stream(0).await;

    session.skip().unwrap();
    assert_eq!(server.next_message().await, ClientMessage::Skip);
    assert!(matches!(
        server.next_message().await,
        ClientMessage::AnnounceReady { .. }
    ));
    matched(&server, "p3", Role::Responder);

    let second_stream = media.stream(1).await;
    assert!(first_stream.is_stopped());
    assert!(!second_stream.is_stopped());
    assert_eq!(media.overlapping_acquisitions(), 0);

    session.shutdown().await;
}

// ── Transport failure ───────────────────────────────────────────────

#[tokio::test]
async fn connect_error_requires_explicit_restart() {
    let (transport, mut server) = loopback();
    let connector =
        ScriptedConnector::new(vec![Attempt::Refuse("server down"), Attempt::Accept(transport)]);
    let calls = Arc::clone(&connector.calls);
    let (mut session, events) = Session::connect(connector, MockMedia::new(), config());
    let mut log = EventLog::new(events);

    let alert = log
        .until_alert(|a| matches!(a, Alert::TransportFailure { .. }))
        .await;
    let Alert::TransportFailure { reason } = alert else {
        panic!("expected transport failure");
    };
    assert!(reason.contains("server down"));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.lifecycle_state, LifecycleState::Error);
    assert!(!snapshot.transport_up);

    // No silent retry, and `start` does not leave Error.
    session.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(session.snapshot().lifecycle_state, LifecycleState::Error);

    session.restart().unwrap();
    wait_state(&session, |s| {
        s.lifecycle_state == LifecycleState::Idle && s.transport_up
    })
    .await;
    assert_eq!(calls.load(Ordering::Relaxed), 2);

    session.start().unwrap();
    assert!(matches!(
        server.next_message().await,
        ClientMessage::AnnounceReady { .. }
    ));

    session.shutdown().await;
}

#[tokio::test]
async fn transport_drop_mid_session_enters_error() {
    let media = MockMedia::new();
    let (mut session, mut log, server) = waiting(media.clone()).await;
    matched(&server, "p2", Role::Responder);
    server.push(ServerMessage::ChatReceive { text: "yo".into() });
    wait_state(&session, |s| s.chat_log.len() == 1).await;

    server.disconnect();

    assert!(matches!(
        log.until_alert(|a| matches!(a, Alert::TransportFailure { .. }))
            .await,
        Alert::TransportFailure { .. }
    ));
    let snapshot = session.snapshot();
    assert_eq!(snapshot.lifecycle_state, LifecycleState::Error);
    assert_eq!(snapshot.peer_id, None);
    assert!(snapshot.chat_log.is_empty());
    assert!(snapshot.negotiation.is_none());

    let peer = media.peer(0).await;
    poll(|| (peer.count(&PeerCall::Close) == 1).then_some(())).await;

    session.shutdown().await;
}

// ── Media degradation ───────────────────────────────────────────────

#[tokio::test]
async fn without_media_support_session_runs_text_only() {
    let (mut session, mut log, mut server) = waiting(NullMediaCapability).await;

    matched(&server, "p2", Role::Initiator);
    assert!(matches!(
        log.until_alert(|_| true).await,
        Alert::MediaUnavailable { .. }
    ));

    let snapshot = wait_state(&session, |s| {
        s.lifecycle_state == LifecycleState::Connected
    })
    .await;
    assert!(snapshot.text_only);
    assert!(snapshot.peer_present);
    assert!(!snapshot.local_media_available);
    assert!(snapshot.negotiation.is_none());
    assert_eq!(snapshot.chat_log.len(), 1);
    assert_eq!(snapshot.chat_log[0].origin, ChatOrigin::System);
    assert_eq!(snapshot.chat_log[0].text, PEER_PRESENT_NOTICE);

    // No offer goes out; chat does.
    session.send_chat("hi").unwrap();
    assert_eq!(
        server.next_message().await,
        ClientMessage::ChatSend { text: "hi".into() }
    );

    // Signaling from the peer is ignored without a peer connection.
    server.push(ServerMessage::Description {
        sdp: SessionDescription::answer("a"),
    });
    server.push(ServerMessage::ChatReceive { text: "yo".into() });
    let snapshot = wait_state(&session, |s| s.chat_log.len() == 3).await;
    assert_eq!(snapshot.lifecycle_state, LifecycleState::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn media_failure_after_remote_video_posts_no_notice() {
    let media = MockMedia::held_failing();
    let (mut session, mut log, server) = waiting(media.clone()).await;
    matched(&server, "p2", Role::Responder);

    let peer = media.peer(0).await;
    peer.emit(PeerSignal::RemoteStreamReady(RemoteStream {
        id: "remote-1".into(),
    }));
    wait_state(&session, |s| s.remote_media_available).await;

    media.release(0).await;
    log.until_alert(|a| matches!(a, Alert::MediaUnavailable { .. }))
        .await;

    let snapshot = session.snapshot();
    assert_eq!(snapshot.lifecycle_state, LifecycleState::Connected);
    assert!(snapshot.remote_media_available);
    assert!(!snapshot.text_only);
    assert!(snapshot.chat_log.is_empty());

    session.shutdown().await;
}

#[tokio::test]
async fn media_failure_degrades_but_signaling_continues() {
    let media = MockMedia::failing();
    let (mut session, mut log, mut server) = waiting(media.clone()).await;

    matched(&server, "p2", Role::Initiator);
    let peer = media.peer(0).await;
    assert_eq!(
        server.next_message().await,
        ClientMessage::Description { sdp: peer.offer() }
    );
    let Alert::MediaUnavailable { reason } = log.until_alert(|_| true).await else {
        panic!("expected media alert");
    };
    assert!(reason.contains("permission denied"));

    let snapshot = wait_state(&session, |s| {
        s.lifecycle_state == LifecycleState::Connected
    })
    .await;
    assert!(snapshot.text_only);
    assert_eq!(snapshot.chat_log[0].text, PEER_PRESENT_NOTICE);

    let answer = SessionDescription::answer("remote-answer");
    server.push(ServerMessage::Description {
        sdp: answer.clone(),
    });
    poll(|| (peer.count(&PeerCall::SetRemote(answer.clone())) == 1).then_some(())).await;
    assert_eq!(
        session.snapshot().lifecycle_state,
        LifecycleState::Connected
    );

    session.shutdown().await;
}

#[tokio::test]
async fn mute_toggles_apply_locally_and_are_never_signaled() {
    let media = MockMedia::new();
    let (mut session, _log, mut server) = waiting(media.clone()).await;
    matched(&server, "p2", Role::Responder);
    wait_state(&session, |s| s.local_media_available).await;
    let stream = media.stream(0).await;

    session.toggle_local_audio().unwrap();
    let snapshot = wait_state(&session, |s| s.audio_muted).await;
    assert!(!snapshot.video_muted);
    assert!(!stream.audio_enabled.load(Ordering::Relaxed));

    session.toggle_local_video().unwrap();
    session.toggle_local_video().unwrap();
    session.toggle_local_audio().unwrap();
    wait_state(&session, |s| !s.audio_muted && !s.video_muted).await;
    assert!(stream.audio_enabled.load(Ordering::Relaxed));
    assert!(stream.video_enabled.load(Ordering::Relaxed));

    server.assert_silent().await;
    session.shutdown().await;
}

#[tokio::test]
async fn mute_chosen_before_capture_applies_to_new_stream() {
    let media = MockMedia::held();
    let (mut session, _log, server) = waiting(media.clone()).await;
    matched(&server, "p2", Role::Responder);
    wait_state(&session, |s| s.peer_present).await;

    session.toggle_local_video().unwrap();
    wait_state(&session, |s| s.video_muted).await;

    media.release(0).await;
    wait_state(&session, |s| s.local_media_available).await;
    let stream = media.stream(0).await;
    assert!(!stream.video_enabled.load(Ordering::Relaxed));
    assert!(stream.audio_enabled.load(Ordering::Relaxed));

    session.shutdown().await;
}

// ── Edge policies ───────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_match_for_same_peer_is_discarded() {
    let media = MockMedia::new();
    let (mut session, _log, server) = waiting(media.clone()).await;

    matched(&server, "a", Role::Responder);
    let first = wait_state(&session, |s| s.peer_id.as_deref() == Some("a")).await;

    matched(&server, "a", Role::Responder);
    server.push(ServerMessage::ChatReceive {
        text: "still here".into(),
    });
    let snapshot = wait_state(&session, |s| s.chat_log.len() == 1).await;

    assert_eq!(snapshot.generation, first.generation);
    assert_eq!(snapshot.peer_id.as_deref(), Some("a"));
    assert_eq!(media.peer_count(), 1);

    session.shutdown().await;
}

#[tokio::test]
async fn signaling_before_match_is_never_applied() {
    let media = MockMedia::new();
    let (mut session, _log, server) = waiting(media.clone()).await;

    server.push(ServerMessage::Description {
        sdp: SessionDescription::offer("early"),
    });
    server.push(ServerMessage::Candidate {
        candidate: IceCandidate::new(CANDIDATE),
    });
    matched(&server, "p2", Role::Responder);

    let snapshot = wait_state(&session, |s| s.peer_present).await;
    assert_eq!(snapshot.lifecycle_state, LifecycleState::Matched);
    let negotiation = snapshot.negotiation.unwrap();
    assert_eq!(negotiation.remote_description, None);
    assert!(negotiation.queued_remote_candidates.is_empty());

    let peer = media.peer(0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(peer
        .calls()
        .iter()
        .all(|c| !matches!(c, PeerCall::SetRemote(_) | PeerCall::AddCandidate(_))));

    session.shutdown().await;
}

#[tokio::test]
async fn offer_sent_to_initiator_abandons_the_peer() {
    let media = MockMedia::new();
    let (mut session, mut log, mut server) = waiting(media.clone()).await;

    matched(&server, "p2", Role::Initiator);
    assert!(matches!(
        server.next_message().await,
        ClientMessage::Description { .. }
    ));

    server.push(ServerMessage::Description {
        sdp: SessionDescription::offer("bogus"),
    });

    assert!(matches!(
        log.until_alert(|a| matches!(a, Alert::ProtocolViolation { .. }))
            .await,
        Alert::ProtocolViolation { .. }
    ));
    assert_eq!(server.next_message().await, ClientMessage::Skip);
    assert!(matches!(
        server.next_message().await,
        ClientMessage::AnnounceReady { .. }
    ));
    let snapshot = wait_state(&session, |s| s.lifecycle_state == LifecycleState::Waiting).await;
    assert!(snapshot.negotiation.is_none());

    session.shutdown().await;
}

#[tokio::test]
async fn candidates_are_queued_until_offer_applied_and_local_ones_forwarded() {
    let media = MockMedia::new();
    let (mut session, _log, mut server) = waiting(media.clone()).await;
    matched(&server, "p2", Role::Responder);
    let peer = media.peer(0).await;

    server.push(ServerMessage::Candidate {
        candidate: IceCandidate::new(CANDIDATE),
    });
    wait_state(&session, |s| {
        s.negotiation
            .as_ref()
            .is_some_and(|n| n.queued_remote_candidates.len() == 1)
    })
    .await;
    assert!(peer
        .calls()
        .iter()
        .all(|c| !matches!(c, PeerCall::AddCandidate(_))));

    let offer = SessionDescription::offer("offerBlob");
    server.push(ServerMessage::Description { sdp: offer.clone() });
    assert_eq!(
        server.next_message().await,
        ClientMessage::Description { sdp: peer.answer() }
    );
    poll(|| (peer.count(&PeerCall::AddCandidate(CANDIDATE.into())) == 1).then_some(())).await;
    let calls = peer.calls();
    let set_remote = calls
        .iter()
        .position(|c| *c == PeerCall::SetRemote(offer.clone()))
        .unwrap();
    let added = calls
        .iter()
        .position(|c| *c == PeerCall::AddCandidate(CANDIDATE.into()))
        .unwrap();
    assert!(set_remote < added);

    // Malformed candidates are dropped without disturbing the session.
    server.push(ServerMessage::Candidate {
        candidate: IceCandidate::new("not a candidate"),
    });

    let local = IceCandidate::new(CANDIDATE.replace("46154", "46155"));
    peer.emit(PeerSignal::LocalCandidate(local.clone()));
    assert_eq!(
        server.next_message().await,
        ClientMessage::Candidate { candidate: local }
    );
    let snapshot = session.snapshot();
    assert_eq!(snapshot.lifecycle_state, LifecycleState::Negotiating);
    assert_eq!(snapshot.negotiation.unwrap().local_candidates.len(), 1);

    session.shutdown().await;
}

#[tokio::test]
async fn leave_returns_to_idle_without_reannouncing() {
    let media = MockMedia::new();
    let (mut session, _log, mut server) = connected_initiator(&media).await;

    session.leave().unwrap();
    assert_eq!(server.next_message().await, ClientMessage::Leave);
    server.assert_silent().await;

    let snapshot = wait_state(&session, |s| s.lifecycle_state == LifecycleState::Idle).await;
    assert!(snapshot.chat_log.is_empty());
    assert!(!snapshot.peer_present);
    assert!(media.stream(0).await.is_stopped());

    session.shutdown().await;
}

// ── Ambient behavior ────────────────────────────────────────────────

#[tokio::test]
async fn auto_start_announces_on_connect() {
    let (connector, mut server) = single_server();
    let (mut session, _events) =
        Session::connect(connector, MockMedia::new(), config().with_auto_start(true));

    assert!(matches!(
        server.next_message().await,
        ClientMessage::AnnounceReady { .. }
    ));
    wait_state(&session, |s| s.lifecycle_state == LifecycleState::Waiting).await;

    session.shutdown().await;
}

#[tokio::test]
async fn presence_count_is_reported() {
    let (mut session, mut log, server) = waiting(MockMedia::new()).await;

    server.push(ServerMessage::PresenceCount(7));
    log.until(|s| s.presence_count == Some(7)).await;
    assert!(log.seen.contains(&SessionEvent::PresenceCount(7)));

    session.shutdown().await;
}

#[tokio::test]
async fn undecodable_frames_do_not_disturb_the_session() {
    let (mut session, _log, server) = waiting(MockMedia::new()).await;

    server.push_raw("{\"type\":\"mystery\"}");
    server.push_raw("not json at all");
    server.push(ServerMessage::PresenceCount(3));

    let snapshot = wait_state(&session, |s| s.presence_count == Some(3)).await;
    assert_eq!(snapshot.lifecycle_state, LifecycleState::Waiting);
    assert!(snapshot.transport_up);

    session.shutdown().await;
}

#[tokio::test]
async fn shutdown_flushes_leave_and_closes_last() {
    let (mut session, mut log, mut server) = waiting(MockMedia::new()).await;

    session.shutdown().await;

    assert_eq!(server.next_message().await, ClientMessage::Leave);
    assert!(server.is_closed());
    log.until_closed().await;
    assert_eq!(log.seen.last(), Some(&SessionEvent::Closed));
    assert!(matches!(session.start(), Err(PairChatError::SessionClosed)));
}
