//! Integration tests for the progress synchronizer.
//!
//! Uses paused tokio time so interval ticks advance deterministically.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use diffusion_bridge::models::request::GenerationRequest;
use diffusion_bridge::models::session::{Outcome, SessionPhase};
use diffusion_bridge::orchestrator::progress_sync::{ProgressSync, ProgressUpdate};
use diffusion_bridge::orchestrator::session::{GenerationSession, SessionEvent};
use diffusion_bridge::protocol::message::{NewImagePayload, ProgressPayload, Response};

use super::test_helpers::{coordinator, fake_worker, ScriptedLauncher};

const INTERVAL: Duration = Duration::from_millis(500);

fn progress(step: u32) -> SessionEvent {
    SessionEvent::Response(Response::Progress(ProgressPayload {
        current_step: step,
        total_steps: Some(20),
        status: None,
    }))
}

fn image(path: &str) -> SessionEvent {
    SessionEvent::Response(Response::NewImage(NewImagePayload {
        generated_img_path: PathBuf::from(path),
        aux_output_image_path: None,
    }))
}

fn spawn_sync(
    session: &Arc<GenerationSession>,
) -> (
    broadcast::Receiver<ProgressUpdate>,
    tokio::task::JoinHandle<()>,
    CancellationToken,
) {
    let (tx, rx) = broadcast::channel(16);
    let cancel = CancellationToken::new();
    let handle = ProgressSync::new(Arc::clone(session), INTERVAL, tx, cancel.clone()).spawn();
    (rx, handle, cancel)
}

async fn recv(rx: &mut broadcast::Receiver<ProgressUpdate>) -> ProgressUpdate {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("update before timeout")
        .expect("channel open")
}

#[tokio::test(start_paused = true)]
async fn publishes_initial_view_without_eta() {
    let session = Arc::new(GenerationSession::new(GenerationRequest::new("a cat"), 3, None));
    let (mut rx, _handle, cancel) = spawn_sync(&session);

    let update = recv(&mut rx).await;

    assert_eq!(update.session_id, session.id());
    assert_eq!(update.phase, SessionPhase::Initializing);
    assert_eq!(update.snapshot.current_step, 0);
    assert!(update.eta.is_none(), "eta undefined before the first step");
    assert!(update.outcome.is_none());

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn unchanged_view_is_not_republished() {
    let session = Arc::new(GenerationSession::new(GenerationRequest::new("a cat"), 3, None));
    let (mut rx, _handle, cancel) = spawn_sync(&session);
    recv(&mut rx).await;

    tokio::time::sleep(INTERVAL * 5).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    session.apply(progress(4));
    let update = recv(&mut rx).await;
    assert_eq!(update.snapshot.current_step, 4);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn eta_follows_elapsed_per_step() {
    let session = Arc::new(GenerationSession::new(GenerationRequest::new("a cat"), 3, None));
    let (mut rx, _handle, cancel) = spawn_sync(&session);
    recv(&mut rx).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    session.apply(progress(5));
    let update = recv(&mut rx).await;

    // 10s for 5 steps, 15 remaining: about 30s, plus up to one tick of drift.
    let eta = update.eta.expect("eta after first step");
    assert!(eta >= Duration::from_secs(30), "eta {eta:?}");
    assert!(eta <= Duration::from_secs(32), "eta {eta:?}");

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn emits_one_terminal_update_then_stops() {
    let session = Arc::new(GenerationSession::new(GenerationRequest::new("a cat"), 3, None));
    let (mut rx, handle, _cancel) = spawn_sync(&session);
    recv(&mut rx).await;

    session.apply(progress(20));
    session.apply(image("/out/1.png"));

    let update = recv(&mut rx).await;
    assert!(update.is_terminal());
    assert_eq!(update.phase, SessionPhase::Completed);
    assert!(update.snapshot.is_complete);
    assert!(update.eta.is_none());
    assert_eq!(
        update.outcome,
        Some(Outcome::Completed {
            paths: vec![PathBuf::from("/out/1.png")]
        })
    );

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("sync stops after terminal update")
        .expect("join");
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn cancellation_token_stops_polling() {
    let session = Arc::new(GenerationSession::new(GenerationRequest::new("a cat"), 3, None));
    let (mut rx, handle, cancel) = spawn_sync(&session);
    recv(&mut rx).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("sync stops on cancel")
        .expect("join");
}

#[tokio::test]
async fn coordinator_subscribers_see_full_lifecycle() {
    let (process, mut worker) = fake_worker("fake-1");
    let coordinator = coordinator(ScriptedLauncher::new(vec![process]));
    let mut updates = coordinator.subscribe();

    let session = coordinator
        .start_generation(GenerationRequest::new("a cat"))
        .await
        .expect("start");
    worker.next_command().await;
    worker.progress(10, 20).await;
    worker.new_image("/out/1.png").await;

    let mut seen = Vec::new();
    loop {
        let update = recv(&mut updates).await;
        assert_eq!(update.session_id, session.id());
        let terminal = update.is_terminal();
        seen.push(update);
        if terminal {
            break;
        }
    }

    let steps: Vec<u32> = seen.iter().map(|u| u.snapshot.current_step).collect();
    assert!(
        steps.windows(2).all(|w| w[0] <= w[1]),
        "published steps never decrease: {steps:?}"
    );
    let last = seen.last().expect("at least one update");
    assert_eq!(last.phase, SessionPhase::Completed);
    assert_eq!(
        seen.iter().filter(|u| u.is_terminal()).count(),
        1,
        "exactly one terminal update"
    );

    coordinator.shutdown().await;
}

#[tokio::test]
async fn late_subscriber_receives_in_flight_session_updates() {
    let (process, mut worker) = fake_worker("fake-1");
    let coordinator = coordinator(ScriptedLauncher::new(vec![process]));

    let session = coordinator
        .start_generation(GenerationRequest::new("a cat"))
        .await
        .expect("start");
    worker.next_command().await;

    let mut updates = coordinator.subscribe();
    worker.progress(5, 20).await;

    let update = loop {
        let update = recv(&mut updates).await;
        if update.snapshot.current_step == 5 {
            break update;
        }
    };
    assert_eq!(update.session_id, session.id());
    assert_eq!(update.phase, SessionPhase::Running);

    coordinator.shutdown().await;
}
