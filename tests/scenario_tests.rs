//! End-to-end host/receiver scenarios over the memory transport

mod common;

#[cfg(test)]
mod tests {
    use super::common::{self, pump, run_until, settled, LoopbackReceiver, PaddedCodec, TICK};
    use dungeon_sync::protocol::phases;
    use dungeon_sync::{Host, HostPhase, ReceiverEvent, SyncConfig};
    use std::sync::Arc;

    const WORLD_BYTES: usize = 237_000;

    fn padded_host(config: SyncConfig) -> Host {
        Host::new(
            config,
            Arc::new(PaddedCodec { len: WORLD_BYTES }),
            common::small_world(42),
        )
        .unwrap()
    }

    #[test]
    fn two_receivers_download_29_chunks_and_resume_together() {
        let config = SyncConfig::default();
        let mut host = padded_host(config.clone());
        let mut receivers = vec![
            LoopbackReceiver::join(&mut host, "alice", config.clone()),
            LoopbackReceiver::join(&mut host, "bob", config),
        ];

        run_until(&mut host, &mut receivers, 60, settled);

        for r in &receivers {
            assert_eq!(r.chunks_delivered, 29);
            assert!(r.has_event(|e| *e
                == ReceiverEvent::Progress {
                    received: 29,
                    total: 29
                }));
            assert!(r.has_event(|e| matches!(e, ReceiverEvent::WorldReady { skipped: false, .. })));
            assert!(r.has_event(|e| matches!(e, ReceiverEvent::HostReleased { .. })));
            assert!(!r.session.machine().gameplay_paused());
        }
        assert_eq!(host.stats().chunks_sent, 58);
        assert_eq!(host.stats().bytes_sent, 2 * WORLD_BYTES as u64);

        // Each receiver saw the other finish, never itself.
        let peers = |r: &LoopbackReceiver| {
            r.events
                .iter()
                .filter_map(|e| match e {
                    ReceiverEvent::PeerProgress(p) => Some(p.clone()),
                    _ => None,
                })
                .last()
                .unwrap()
        };
        let alice = peers(&receivers[0]);
        assert_eq!(alice.get("bob"), Some(&29));
        assert!(!alice.contains_key("alice"));
        let bob = peers(&receivers[1]);
        assert_eq!(bob.get("alice"), Some(&29));
    }

    #[test]
    fn paced_transfer_spreads_over_ticks() {
        let config = SyncConfig {
            max_chunks_per_tick: 4,
            ..Default::default()
        };
        let mut host = padded_host(config.clone());
        let mut receivers = vec![LoopbackReceiver::join(&mut host, "alice", config)];

        let ticks = run_until(&mut host, &mut receivers, 100, settled);
        assert!(ticks >= 8, "29 chunks at 4 per tick took {} ticks", ticks);
        let progress: Vec<u32> = receivers[0]
            .events
            .iter()
            .filter_map(|e| match e {
                ReceiverEvent::Progress { received, .. } => Some(*received),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 29);
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn stuck_receiver_holds_the_host_and_stalls_its_peer() {
        let config = SyncConfig {
            retry_interval_ms: 100,
            max_retries: 2,
            receiver_timeout_ms: 1000,
            ..Default::default()
        };
        let mut host = padded_host(config.clone());
        let mut receivers = vec![
            LoopbackReceiver::join(&mut host, "alice", config.clone()),
            LoopbackReceiver::join(&mut host, "stuck", config),
        ];
        receivers[1].hold_chunks = true;

        for _ in 0..200 {
            pump(&mut host, &mut receivers, TICK);
        }

        // No host-side timeout: the barrier keeps waiting.
        assert_eq!(host.phase(), HostPhase::WaitForClientsToBeReady);
        assert_eq!(receivers[1].phase(), phases::TRANSFER);

        let alice = receivers[0].session.machine();
        assert_eq!(alice.retries(), 2);
        assert!(alice.is_stalled());
        assert!(alice.stall_reports() >= 5);
        assert_eq!(
            receivers[0]
                .events
                .iter()
                .filter(|e| **e == ReceiverEvent::Stalled)
                .count(),
            1
        );

        // Unblocking the stuck receiver releases everyone.
        receivers[1].hold_chunks = false;
        run_until(&mut host, &mut receivers, 20, settled);
        assert!(!receivers[0].session.machine().is_stalled());
    }

    #[test]
    fn receiver_losing_bulk_mid_transfer_reconnects_and_downloads_again() {
        let config = SyncConfig {
            max_chunks_per_tick: 1,
            ..Default::default()
        };
        let mut host = padded_host(config.clone());
        let mut receivers = vec![
            LoopbackReceiver::join(&mut host, "alice", config.clone()),
            LoopbackReceiver::join(&mut host, "bob", config),
        ];
        run_until(&mut host, &mut receivers, 60, |_, rs| rs[1].chunks_delivered >= 2);
        let first_conn = receivers[1].conn;

        receivers[1].connector.fail("connection reset");
        run_until(&mut host, &mut receivers, 200, settled);

        let bob = &receivers[1];
        assert_eq!(bob.reconnects, 1);
        assert_ne!(bob.conn, first_conn);
        assert!(host.link(first_conn).map_or(true, |l| l.is_disconnected()));
        assert!(!host.link(bob.conn).unwrap().is_disconnected());
        assert!(bob.chunks_delivered > 29);
        assert_eq!(
            bob.session.machine().held_world(),
            receivers[0].session.machine().held_world()
        );
        assert!(!bob.session.machine().gameplay_paused());
    }
}
