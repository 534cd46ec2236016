mod common;

use common::{control, tcp_profile, tick_until, ScriptedServer, WAIT};
use scopelink::coordinates::spherical_to_rect;
use scopelink::{ConnectionEventKind, Equinox};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn goto_burst_keeps_only_the_latest_overflow() {
    let server = ScriptedServer::start(0.0, 0.0);
    let mut control = control();
    let mut events = control.subscribe();
    control.add_connection(tcp_profile("A", server.port, Equinox::J2000));
    control.start_connection("A");
    assert!(tick_until(&mut control, WAIT, |c| c.is_connected("A")));

    // No tick in between: the 120-byte outbox takes six gotos, the rest
    // compete for the single held slot
    let burst = 200;
    for i in 0..burst {
        control.telescope_goto("A", spherical_to_rect(0.01 * i as f64, 0.2));
    }

    let mut received = Vec::new();
    let start = Instant::now();
    while received.len() < 7 {
        control.tick(5_000);
        received.extend(server.received_gotos());
        assert!(start.elapsed() < WAIT, "only {} gotos arrived", received.len());
        thread::sleep(Duration::from_millis(5));
    }
    // Nothing else is in flight
    for _ in 0..20 {
        control.tick(5_000);
        thread::sleep(Duration::from_millis(5));
    }
    received.extend(server.received_gotos());
    assert_eq!(received.len(), 7);

    for (i, goto) in received[..6].iter().enumerate() {
        assert!((goto.ra - 0.01 * i as f64).abs() < 1e-8);
    }
    assert!((received[6].ra - 0.01 * (burst - 1) as f64).abs() < 1e-8);

    let dropped = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e.kind, ConnectionEventKind::GotoDropped { .. }))
        .count();
    assert_eq!(dropped, burst - 7);
}
