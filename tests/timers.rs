//! Timestamp query behavior, including the explicit backend's resolve
//! latency and the consume-on-query contract.

mod common;

use common::*;
use prism::TIMER_RESOLVE_LATENCY;

#[test]
fn immediate_timer_resolves_after_one_flush() {
    let device = immediate_device();
    let timer = device.create_timer().unwrap();

    timer.start().unwrap();
    timer.stop().unwrap();
    assert_eq!(timer.query_opts(false), 0.0, "unflushed pair reads zero");

    device.flush(true, false).unwrap();
    assert!(timer.query_opts(false) > 0.0);
}

#[test]
fn explicit_timer_resolves_after_the_latency_window() {
    let device = explicit_device();
    let timer = device.create_timer().unwrap();

    timer.start().unwrap();
    timer.stop().unwrap();

    for _ in 0..TIMER_RESOLVE_LATENCY {
        assert_eq!(
            timer.query_opts(false),
            0.0,
            "result must stay zero until the resolve latency elapses"
        );
        device.flush(true, true).unwrap();
    }
    assert!(timer.query_opts(false) > 0.0);
}

#[test]
fn non_end_of_frame_flushes_do_not_resolve_explicit_timers() {
    let device = explicit_device();
    let timer = device.create_timer().unwrap();

    timer.start().unwrap();
    timer.stop().unwrap();
    for _ in 0..4 {
        device.flush(true, false).unwrap();
    }
    assert_eq!(timer.query_opts(false), 0.0);
}

#[test]
fn query_consumes_but_peeking_does_not() {
    for device in devices() {
        let timer = device.create_timer().unwrap();
        timer.start().unwrap();
        timer.stop().unwrap();
        for _ in 0..TIMER_RESOLVE_LATENCY {
            device.flush(true, true).unwrap();
        }

        let peeked = timer.query_opts(false);
        assert!(peeked > 0.0);
        assert_eq!(timer.query_opts(false), peeked, "peek is repeatable");

        assert_eq!(timer.query(), peeked);
        assert_eq!(timer.query(), 0.0, "consumed result reads zero");
    }
}

#[test]
fn timer_pair_can_be_reused() {
    for device in devices() {
        let timer = device.create_timer().unwrap();
        for _ in 0..2 {
            timer.start().unwrap();
            timer.stop().unwrap();
            for _ in 0..TIMER_RESOLVE_LATENCY {
                device.flush(true, true).unwrap();
            }
            assert!(timer.query() > 0.0);
        }
    }
}
