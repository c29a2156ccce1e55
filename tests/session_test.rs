//! Multi-relayer signing session drills over real TCP streams.

mod common;

use common::{fast_coordinator_config, spawn_cluster, TestNode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use viaduct::chains::evm::executor::assemble_signature;
use viaduct::comm::StaticElector;
use viaduct::crypto::PeerId;
use viaduct::tss::coordinator::SessionError;
use viaduct::tss::loopback;
use viaduct::tss::party::{PartyFactory, PartyHandle, PartyId, PartyRoster, PartySetup};
use viaduct::tss::signing::{signing_session_id, Signing};
use viaduct::tss::SignatureParts;

type SessionJoin = JoinHandle<Result<(), SessionError>>;

async fn start_signing<F>(
    node: &TestNode,
    digest: [u8; 32],
    factory: Arc<F>,
    ctx: CancellationToken,
) -> (SessionJoin, mpsc::Receiver<SignatureParts>)
where
    F: PartyFactory<Output = SignatureParts>,
{
    let signing = Arc::new(
        Signing::new(
            digest.to_vec(),
            signing_session_id(&digest),
            node.comm.clone(),
            &node.keyshare_store,
            factory,
        )
        .await
        .unwrap(),
    );
    let coordinator = node.coordinator.clone();
    let (sig_tx, sig_rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move { coordinator.execute(ctx, signing, sig_tx).await });
    (handle, sig_rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_peer_signing_completes() {
    let nodes = spawn_cluster(40, 3, 2, fast_coordinator_config(Duration::from_secs(15))).await;
    let digest = [0xaa; 32];

    let mut sessions = Vec::new();
    for node in &nodes {
        sessions.push(start_signing(node, digest, loopback::signing(), CancellationToken::new()).await);
    }

    let mut signatures = Vec::new();
    for (handle, mut sig_rx) in sessions {
        let outcome = tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("session did not finish in time")
            .unwrap();
        assert!(outcome.is_ok(), "session failed: {outcome:?}");
        signatures.push(sig_rx.recv().await.expect("no signature produced"));
    }

    // Every participant converged on the same signature, in wire form.
    for signature in &signatures {
        assert_eq!(signature, &signatures[0]);
        let wire = assemble_signature(signature);
        assert_eq!(wire.len(), 65);
        assert!(matches!(wire[64], 27 | 28));
    }
}

/// Party that never finishes; keeps a session pending until cancelled.
struct StallFactory;

impl PartyFactory for StallFactory {
    type Output = SignatureParts;

    fn spawn(&self, _setup: PartySetup) -> PartyHandle<SignatureParts> {
        let (in_tx, _in_rx) = mpsc::channel(1);
        let (_out_tx, out_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            // Hold the completion channel open forever.
            std::future::pending::<()>().await;
            let _ = done_tx.send(Err(viaduct::tss::party::PartyFailure {
                culprits: Vec::new(),
                reason: "unreachable".into(),
            }));
        });
        PartyHandle { incoming: in_tx, outgoing: out_rx, done: done_rx }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_session_for_same_digest_is_deduplicated() {
    let nodes = spawn_cluster(50, 3, 2, fast_coordinator_config(Duration::from_secs(15))).await;
    let digest = [0xbb; 32];

    let ctx = CancellationToken::new();
    let mut sessions = Vec::new();
    for node in &nodes {
        sessions.push(start_signing(node, digest, Arc::new(StallFactory), ctx.clone()).await);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // A concurrent duplicate reports success immediately, without a
    // second local process.
    let (dup_handle, mut dup_rx) =
        start_signing(&nodes[0], digest, Arc::new(StallFactory), ctx.clone()).await;
    let dup_outcome = tokio::time::timeout(Duration::from_secs(5), dup_handle).await.unwrap().unwrap();
    assert!(dup_outcome.is_ok());
    assert!(dup_rx.try_recv().is_err());

    ctx.cancel();
    for (handle, _) in sessions {
        let outcome = tokio::time::timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();
        assert!(outcome.is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn followers_displace_a_silent_leader() {
    let nodes = spawn_cluster(60, 3, 1, fast_coordinator_config(Duration::from_secs(20))).await;
    let digest = [0xcc; 32];
    let session_id = signing_session_id(&digest);

    let peer_ids: Vec<PeerId> = nodes.iter().map(|n| n.peer_id).collect();
    let leader = StaticElector::new(session_id.as_str()).coordinator(&peer_ids).unwrap();

    // The statically elected leader never shows up; the followers must
    // time out, run a bully election without it, and still finish.
    let mut sessions = Vec::new();
    for node in nodes.iter().filter(|n| n.peer_id != leader) {
        sessions.push(start_signing(node, digest, loopback::signing(), CancellationToken::new()).await);
    }

    let mut signatures = Vec::new();
    for (handle, mut sig_rx) in sessions {
        let outcome = tokio::time::timeout(Duration::from_secs(40), handle)
            .await
            .expect("retried session did not finish")
            .unwrap();
        assert!(outcome.is_ok(), "session failed: {outcome:?}");
        signatures.push(sig_rx.recv().await.expect("no signature after retry"));
    }
    assert_eq!(signatures[0], signatures[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relayer_outside_the_subset_waits_and_times_out() {
    let nodes = spawn_cluster(70, 3, 1, fast_coordinator_config(Duration::from_secs(6))).await;
    let digest = [0xdd; 32];
    let session_id = signing_session_id(&digest);

    // threshold + 1 == 2, so exactly one relayer misses the subset.
    let peer_ids: Vec<PeerId> = nodes.iter().map(|n| n.peer_id).collect();
    let subset: Vec<PeerId> =
        PartyRoster::sorted_for_session(peer_ids, &session_id).peers()[..2].to_vec();

    let mut selected = Vec::new();
    let mut missed = Vec::new();
    for node in &nodes {
        let session = start_signing(node, digest, loopback::signing(), CancellationToken::new()).await;
        if subset.contains(&node.peer_id) {
            selected.push(session);
        } else {
            missed.push(session);
        }
    }

    for (handle, mut sig_rx) in selected {
        let outcome = tokio::time::timeout(Duration::from_secs(30), handle).await.unwrap().unwrap();
        assert!(outcome.is_ok(), "subset member failed: {outcome:?}");
        assert!(sig_rx.recv().await.is_some());
    }

    // The left-out relayer waits passively and exits on the session cap.
    let (handle, _sig_rx) = missed.remove(0);
    let outcome = tokio::time::timeout(Duration::from_secs(30), handle).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(SessionError::Timeout(_))), "unexpected: {outcome:?}");
}

/// Fails any run whose roster contains the chosen culprit, blaming it;
/// behaves like the regular signing backend otherwise.
struct CulpritFactory {
    culprit: PeerId,
}

impl PartyFactory for CulpritFactory {
    type Output = SignatureParts;

    fn spawn(&self, setup: PartySetup) -> PartyHandle<SignatureParts> {
        match setup.peers.iter().position(|p| *p == self.culprit) {
            Some(index) => {
                loopback::failing::<SignatureParts>(vec![index as PartyId]).spawn(setup)
            }
            None => loopback::signing().spawn(setup),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn culprits_are_excluded_on_retry() {
    let nodes = spawn_cluster(80, 4, 1, fast_coordinator_config(Duration::from_secs(10))).await;
    let digest = [0xee; 32];
    let session_id = signing_session_id(&digest);

    // The first signing subset is deterministic; blame its first member.
    let peer_ids: Vec<PeerId> = nodes.iter().map(|n| n.peer_id).collect();
    let culprit = PartyRoster::sorted_for_session(peer_ids, &session_id).peers()[0];

    let mut sessions = Vec::new();
    for node in &nodes {
        let factory = Arc::new(CulpritFactory { culprit });
        sessions.push((node.peer_id, start_signing(node, digest, factory, CancellationToken::new()).await));
    }

    let mut completed = Vec::new();
    for (peer_id, (handle, mut sig_rx)) in sessions {
        let outcome = tokio::time::timeout(Duration::from_secs(40), handle).await.unwrap().unwrap();
        if peer_id == culprit {
            // The blamed relayer never rejoins the retried session.
            assert!(outcome.is_err(), "culprit unexpectedly succeeded");
            continue;
        }
        if outcome.is_ok() {
            completed.push(sig_rx.recv().await.expect("no signature on retried session"));
        }
    }

    // The retried subset (threshold + 1 of the remaining peers) finished.
    assert!(completed.len() >= 2, "expected at least two completed sessions");
    for signature in &completed {
        assert_eq!(signature, &completed[0]);
    }
}
