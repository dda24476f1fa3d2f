//! Receiver join-path tests against the memory transport

mod common;

#[cfg(test)]
mod tests {
    use super::common::{self, context, default_context, Doubles, RejectingCodec};
    use bytes::Bytes;
    use dungeon_sync::framer;
    use dungeon_sync::protocol::{
        HostMessage, MapChunk, MapTransferBegin, MapTransferComplete, ReceiverMessage,
        RegenerationStart,
    };
    use dungeon_sync::receiver::{InlineDispatcher, JoinPhase, MainThreadQueue, NullBuilder};
    use dungeon_sync::transport::memory::{MemoryConnector, MemoryHostLink};
use dungeon_sync::transport::BulkConnector;
    use dungeon_sync::world::{JsonWorldCodec, WorldCodec};
    use dungeon_sync::{ReceiverEvent, ReceiverSession, SyncConfig, SyncError, WorldId};
    use std::sync::Arc;
    use std::time::Duration;

    const CHUNK: usize = 1024;

    struct Sent {
        world_id: WorldId,
        bytes: Bytes,
    }

    fn world(seed: u64) -> Sent {
        let payload = common::small_world(seed);
        let codec = JsonWorldCodec;
        Sent {
            world_id: codec.world_id(&payload.world).unwrap(),
            bytes: Bytes::from(codec.encode(&payload).unwrap()),
        }
    }

    fn begin(transfer_id: &str, sent: &Sent) -> HostMessage {
        HostMessage::TransferBegin(MapTransferBegin {
            transfer_id: transfer_id.into(),
            world_id: sent.world_id.0.clone(),
            total_chunks: framer::chunk_count(sent.bytes.len(), CHUNK) as i32,
            total_size_bytes: sent.bytes.len() as i64,
        })
    }

    fn chunks(transfer_id: &str, sent: &Sent) -> Vec<MapChunk> {
        framer::frame(transfer_id, &sent.bytes, CHUNK)
    }

    fn tick(session: &mut ReceiverSession, n: usize) -> Vec<ReceiverEvent> {
        (0..n)
            .flat_map(|_| session.tick(Duration::from_millis(10)))
            .collect()
    }

    fn new_phases(doubles: &Doubles) -> Vec<String> {
        doubles.announcements().into_iter().map(|(_, new)| new).collect()
    }

    /// Run a full join for `transfer_id` and return the session in Complete.
    fn joined(sent: &Sent, transfer_id: &str) -> (ReceiverSession, Doubles) {
        let (ctx, doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin(transfer_id, sent)).unwrap();
        tick(&mut session, 2);
        for c in chunks(transfer_id, sent) {
            session.handle_chunk(&c).unwrap();
        }
        tick(&mut session, 2);
        assert_eq!(session.machine().phase(), JoinPhase::Complete);
        (session, doubles)
    }

    // -----------------------------------------------------------------------
    // Happy path
    // -----------------------------------------------------------------------

    #[test]
    fn join_walks_every_phase_and_builds() {
        let sent = world(1);
        let (ctx, doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);

        session.handle(begin("t-1", &sent)).unwrap();
        assert_eq!(session.machine().phase(), JoinPhase::Dispose);

        tick(&mut session, 1);
        assert_eq!(session.machine().phase(), JoinPhase::ConnectBulk);
        assert!(session.machine().gameplay_paused());
        assert_eq!(doubles.connector.requests().len(), 1);
        assert_eq!(doubles.connector.requests()[0].client_unique_id, "r1");

        tick(&mut session, 1);
        assert_eq!(session.machine().phase(), JoinPhase::Transfer);

        let all = chunks("t-1", &sent);
        assert!(all.len() > 1);
        for c in all.iter().rev() {
            session.handle_chunk(c).unwrap();
        }
        assert_eq!(session.machine().phase(), JoinPhase::Reassembly);

        let events = tick(&mut session, 2);
        assert_eq!(session.machine().phase(), JoinPhase::Complete);
        assert!(!session.machine().gameplay_paused());
        assert_eq!(session.machine().held_world(), Some(&sent.world_id));
        assert!(events.contains(&ReceiverEvent::WorldReady {
            world_id: sent.world_id.clone(),
            skipped: false,
        }));
        assert_eq!(doubles.connector.close_count(), 1);

        assert_eq!(
            new_phases(&doubles),
            vec![
                "Initiated",
                "Dispose",
                "ConnectBulk",
                "Transfer",
                "Reassembly",
                "BuildAssets",
                "Complete"
            ]
        );
    }

    #[test]
    fn host_release_needs_matching_transfer() {
        let sent = world(2);
        let (mut session, _doubles) = joined(&sent, "t-1");

        session
            .handle(HostMessage::TransferComplete(MapTransferComplete {
                transfer_id: "t-0".into(),
            }))
            .unwrap();
        assert!(!session.machine().host_released());

        session
            .handle(HostMessage::TransferComplete(MapTransferComplete {
                transfer_id: "t-1".into(),
            }))
            .unwrap();
        assert!(session.machine().host_released());
        let events = tick(&mut session, 1);
        assert!(events.contains(&ReceiverEvent::HostReleased {
            transfer_id: "t-1".into()
        }));
    }

    // -----------------------------------------------------------------------
    // Skip path
    // -----------------------------------------------------------------------

    #[test]
    fn held_world_skips_download() {
        let sent = world(3);
        let (mut session, doubles) = joined(&sent, "t-1");
        let _ = doubles.announcements();

        session.handle(begin("t-2", &sent)).unwrap();
        let events = tick(&mut session, 1);

        assert_eq!(session.machine().phase(), JoinPhase::Complete);
        assert_eq!(session.machine().transfer_id(), Some("t-2"));
        assert!(events.contains(&ReceiverEvent::WorldReady {
            world_id: sent.world_id.clone(),
            skipped: true,
        }));
        assert_eq!(doubles.connector.requests().len(), 1);
        assert_eq!(new_phases(&doubles), vec!["Initiated", "Complete"]);
    }

    #[test]
    fn different_world_downloads_again() {
        let first = world(4);
        let (mut session, doubles) = joined(&first, "t-1");
        let second = world(5);
        assert_ne!(first.world_id, second.world_id);

        session.handle(begin("t-2", &second)).unwrap();
        assert_eq!(session.machine().phase(), JoinPhase::Dispose);
        tick(&mut session, 1);
        // Old world released before the new download.
        assert_eq!(session.machine().held_world(), None);
        assert_eq!(doubles.connector.requests().len(), 2);
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[test]
    fn bulk_handshake_failure_fails_join() {
        let sent = world(6);
        let (ctx, doubles) = context(
            "r1",
            MemoryConnector::manual(),
            Arc::new(NullBuilder),
            Arc::new(InlineDispatcher),
            Arc::new(JsonWorldCodec),
        );
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin("t-1", &sent)).unwrap();
        tick(&mut session, 3);
        assert_eq!(session.machine().phase(), JoinPhase::ConnectBulk);

        doubles.connector.fail("connection refused");
        let events = tick(&mut session, 1);
        assert_eq!(session.machine().phase(), JoinPhase::Failed);
        assert!(session.machine().failure().unwrap().contains("connection refused"));
        assert!(events.iter().any(|e| matches!(e, ReceiverEvent::Failed { .. })));
        assert!(!session.machine().gameplay_paused());
    }

    #[test]
    fn bulk_loss_mid_transfer_fails_join() {
        let sent = world(16);
        let (ctx, doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin("t-1", &sent)).unwrap();
        tick(&mut session, 2);
        let all = chunks("t-1", &sent);
        session.handle_chunk(&all[0]).unwrap();
        assert_eq!(session.machine().received_chunks().map(|(r, _)| r), Some(1));
        let _ = doubles.link.outbox.drain();

        doubles.connector.fail("connection reset");
        tick(&mut session, 1);
        assert_eq!(session.machine().phase(), JoinPhase::Failed);
        assert!(session.machine().failure().unwrap().contains("connection reset"));
        assert!(session.machine().received_chunks().is_none());
        assert!(!session.machine().gameplay_paused());

        let changes: Vec<_> = doubles
            .link
            .outbox
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                ReceiverMessage::StateChange(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_phase, "Transfer");
        assert_eq!(changes[0].new_phase, "Failed");
        assert_eq!(changes[0].transfer_id.as_deref(), Some("t-1"));

        // Chunks of the dead transfer change nothing.
        session.handle_chunk(&all[1]).unwrap();
        assert_eq!(session.machine().phase(), JoinPhase::Failed);
    }

    #[test]
    fn bulk_closed_by_host_mid_transfer_fails_join() {
        let sent = world(17);
        let (ctx, doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin("t-1", &sent)).unwrap();
        tick(&mut session, 2);
        assert_eq!(session.machine().phase(), JoinPhase::Transfer);

        let mut remote = doubles.connector.clone();
        remote.close();
        tick(&mut session, 1);
        assert_eq!(session.machine().phase(), JoinPhase::Failed);
        // Already closed; the receiver does not close it a second time.
        assert_eq!(doubles.connector.close_count(), 1);
    }

    #[test]
    fn leaving_the_bulk_phases_closes_the_channel() {
        let sent = world(18);
        let (ctx, doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin("t-1", &sent)).unwrap();
        tick(&mut session, 2);
        assert_eq!(session.machine().phase(), JoinPhase::Transfer);
        assert_eq!(doubles.connector.close_count(), 0);

        // A newer transfer supersedes the one in flight.
        session.handle(begin("t-2", &sent)).unwrap();
        assert_eq!(doubles.connector.close_count(), 1);
        assert!(!session.machine().gameplay_paused());
        assert_eq!(session.machine().transfer_id(), Some("t-2"));
        assert_eq!(session.machine().received_chunks().map(|(r, _)| r), Some(0));

        tick(&mut session, 2);
        for c in chunks("t-2", &sent) {
            session.handle_chunk(&c).unwrap();
        }
        tick(&mut session, 2);
        assert_eq!(session.machine().phase(), JoinPhase::Complete);
        assert_eq!(doubles.connector.requests().len(), 2);
        assert_eq!(doubles.connector.close_count(), 2);
    }

    #[test]
    fn implausible_begin_is_rejected_before_allocating() {
        let (ctx, _doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        let err = session
            .handle(HostMessage::TransferBegin(MapTransferBegin {
                transfer_id: "t-1".into(),
                world_id: "w".into(),
                total_chunks: i32::MAX,
                total_size_bytes: 64,
            }))
            .unwrap_err();
        assert!(matches!(err, SyncError::ImplausibleBegin { .. }));
        assert!(err.is_protocol_violation());
        assert_eq!(session.machine().phase(), JoinPhase::Idle);
    }

    #[test]
    fn reconnect_abandons_the_join_and_identifies_again() {
        let sent = world(19);
        let (ctx, doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin("t-1", &sent)).unwrap();
        tick(&mut session, 2);
        session.handle_chunk(&chunks("t-1", &sent)[0]).unwrap();
        assert!(session.machine().gameplay_paused());

        let link = MemoryHostLink::default();
        session.reconnect(Box::new(link.clone())).unwrap();
        assert_eq!(session.machine().phase(), JoinPhase::Idle);
        assert!(!session.machine().gameplay_paused());
        assert!(session.machine().received_chunks().is_none());
        assert_eq!(doubles.connector.close_count(), 1);
        assert!(matches!(
            link.outbox.drain().as_slice(),
            [ReceiverMessage::Identification(id)] if id.client_unique_id == "r1"
        ));

        session.handle(begin("t-2", &sent)).unwrap();
        tick(&mut session, 2);
        for c in chunks("t-2", &sent) {
            session.handle_chunk(&c).unwrap();
        }
        tick(&mut session, 2);
        assert_eq!(session.machine().phase(), JoinPhase::Complete);
        assert_eq!(doubles.connector.requests().len(), 2);
        assert!(link
            .outbox
            .drain()
            .iter()
            .any(|m| matches!(m, ReceiverMessage::StateChange(c) if c.new_phase == "Complete")));
    }

    #[test]
    fn corrupt_world_fails_after_full_transfer() {
        let sent = world(7);
        let (ctx, _doubles) = context(
            "r1",
            MemoryConnector::auto(),
            Arc::new(NullBuilder),
            Arc::new(InlineDispatcher),
            Arc::new(RejectingCodec),
        );
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin("t-1", &sent)).unwrap();
        tick(&mut session, 2);
        for c in chunks("t-1", &sent) {
            session.handle_chunk(&c).unwrap();
        }
        tick(&mut session, 1);
        assert_eq!(session.machine().phase(), JoinPhase::Failed);
    }

    #[test]
    fn out_of_range_chunk_is_protocol_violation() {
        let sent = world(8);
        let (ctx, _doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin("t-1", &sent)).unwrap();
        tick(&mut session, 2);

        let mut bad = chunks("t-1", &sent).remove(0);
        bad.chunk_index = bad.total_chunks;
        let err = session.handle_chunk(&bad).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(session.machine().phase(), JoinPhase::Failed);
    }

    #[test]
    fn stale_chunks_are_dropped() {
        let sent = world(9);
        let (ctx, _doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin("t-2", &sent)).unwrap();
        tick(&mut session, 2);

        for c in chunks("t-1", &sent) {
            session.handle_chunk(&c).unwrap();
        }
        assert_eq!(session.machine().phase(), JoinPhase::Transfer);
        assert_eq!(session.machine().received_chunks().map(|(r, _)| r), Some(0));
    }

    #[test]
    fn duplicate_begin_fails_join() {
        let sent = world(10);
        let (ctx, _doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin("t-1", &sent)).unwrap();
        tick(&mut session, 1);

        let err = session.handle(begin("t-1", &sent)).unwrap_err();
        assert!(matches!(err, SyncError::DuplicateBegin(_)));
        assert_eq!(session.machine().phase(), JoinPhase::Failed);
    }

    #[test]
    fn failed_receiver_recovers_on_next_begin() {
        let sent = world(11);
        let (ctx, doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin("t-1", &sent)).unwrap();
        tick(&mut session, 1);
        session.handle(begin("t-1", &sent)).unwrap_err();
        assert_eq!(session.machine().phase(), JoinPhase::Failed);

        session.handle(begin("t-2", &sent)).unwrap();
        tick(&mut session, 2);
        for c in chunks("t-2", &sent) {
            session.handle_chunk(&c).unwrap();
        }
        tick(&mut session, 2);
        assert_eq!(session.machine().phase(), JoinPhase::Complete);
        assert!(session.machine().failure().is_none());
        assert_eq!(doubles.connector.requests().len(), 2);
    }

    // -----------------------------------------------------------------------
    // Waiting for the host
    // -----------------------------------------------------------------------

    #[test]
    fn unacknowledged_complete_retries_then_stalls() {
        let sent = world(12);
        let config = SyncConfig {
            retry_interval_ms: 100,
            max_retries: 2,
            receiver_timeout_ms: 1000,
            ..Default::default()
        };
        let (ctx, doubles) = default_context("r1");
        let mut session = ReceiverSession::new(config, ctx);
        session.handle(begin("t-1", &sent)).unwrap();
        tick(&mut session, 2);
        for c in chunks("t-1", &sent) {
            session.handle_chunk(&c).unwrap();
        }
        tick(&mut session, 2);
        assert_eq!(session.machine().phase(), JoinPhase::Complete);
        let _ = doubles.announcements();

        let events = tick(&mut session, 330);
        assert_eq!(session.machine().retries(), 2);
        assert!(session.machine().is_stalled());
        assert_eq!(session.machine().stall_reports(), 4);
        assert_eq!(
            events.iter().filter(|e| **e == ReceiverEvent::Stalled).count(),
            1
        );
        let reannounced = doubles.announcements();
        assert_eq!(reannounced.len(), 2);
        assert!(reannounced
            .iter()
            .all(|(old, new)| old == "Complete" && new == "Complete"));
    }

    #[test]
    fn late_release_clears_stall() {
        let sent = world(13);
        let config = SyncConfig {
            retry_interval_ms: 10,
            max_retries: 1,
            ..Default::default()
        };
        let (ctx, _doubles) = default_context("r1");
        let mut session = ReceiverSession::new(config, ctx);
        session.handle(begin("t-1", &sent)).unwrap();
        tick(&mut session, 2);
        for c in chunks("t-1", &sent) {
            session.handle_chunk(&c).unwrap();
        }
        tick(&mut session, 5);
        assert!(session.machine().is_stalled());

        session
            .handle(HostMessage::TransferComplete(MapTransferComplete {
                transfer_id: "t-1".into(),
            }))
            .unwrap();
        assert!(session.machine().host_released());
        assert!(!session.machine().is_stalled());
    }

    // -----------------------------------------------------------------------
    // Deferred build
    // -----------------------------------------------------------------------

    #[test]
    fn build_waits_for_owning_thread() {
        let sent = world(14);
        let queue = Arc::new(MainThreadQueue::new());
        let (ctx, _doubles) = context(
            "r1",
            MemoryConnector::auto(),
            Arc::new(NullBuilder),
            queue.clone(),
            Arc::new(JsonWorldCodec),
        );
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin("t-1", &sent)).unwrap();
        tick(&mut session, 2);
        for c in chunks("t-1", &sent) {
            session.handle_chunk(&c).unwrap();
        }
        tick(&mut session, 5);
        assert_eq!(session.machine().phase(), JoinPhase::BuildAssets);

        assert_eq!(queue.run_pending(), 1);
        tick(&mut session, 1);
        assert_eq!(session.machine().phase(), JoinPhase::Complete);
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    #[test]
    fn regeneration_while_joining_is_deferred() {
        let sent = world(15);
        let (ctx, _doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        session.handle(begin("t-1", &sent)).unwrap();

        session
            .handle(HostMessage::RegenerationStart(RegenerationStart {
                regeneration_id: 1,
            }))
            .unwrap();
        assert!(!session.regeneration().is_active());
        assert_eq!(session.machine().phase(), JoinPhase::Dispose);
    }

    #[test]
    fn peer_progress_is_surfaced() {
        let (ctx, _doubles) = default_context("r1");
        let mut session = ReceiverSession::new(SyncConfig::default(), ctx);
        let mut progress = std::collections::BTreeMap::new();
        progress.insert("r2".to_string(), 12);
        session
            .handle(HostMessage::Progress(
                dungeon_sync::protocol::AllClientProgress {
                    progress: progress.clone(),
                },
            ))
            .unwrap();
        let events = tick(&mut session, 1);
        assert_eq!(events, vec![ReceiverEvent::PeerProgress(progress)]);
    }
}
