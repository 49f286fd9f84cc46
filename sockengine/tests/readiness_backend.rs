mod common;

use common::{Call, Recorder, ScriptedPoller, calls_for, log};
use sockengine::{EngineError, HandlerRef, ReadinessBackend, SocketEngine, Token};

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

const NOW: Option<Duration> = Some(Duration::ZERO);

#[test]
fn capacity_is_enforced_and_freed_slots_reused() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 4);
    let log = log();

    let mut handlers: Vec<HandlerRef> = (10..13)
        .map(|s| Recorder::new(s, &log).listener().build())
        .collect();
    handlers.push(Recorder::new(20, &log).build());

    let tokens: Vec<Token> = handlers
        .iter()
        .map(|h| engine.add_fd(h.clone()).expect("Failed to add handler"))
        .collect();

    assert_eq!(
        tokens.iter().map(Token::slot).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    assert_eq!(engine.remaining_fds(), 0);

    let extra = Recorder::new(30, &log).build();
    let err = engine.add_fd(extra.clone()).err().expect("Expected an error");
    assert!(matches!(err, EngineError::NoCapacity { capacity: 4 }));
    assert!(state.borrow().interest_of(30).is_none());

    engine.del_fd(tokens[2], false).expect("Failed to remove handler");
    assert!(state.borrow().interest_of(12).is_none());

    let reused = engine.add_fd(extra).expect("Failed to add handler");
    assert_eq!(reused.slot(), 2);
    assert_eq!(engine.remaining_fds(), 0);
}

#[test]
fn listener_registers_accept_interest() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    let h = Recorder::new(3, &log).listener().build();
    let token = engine.add_fd(h.clone()).expect("Failed to add listener");

    let interest = engine.interest(token).expect("Missing registration");
    assert!(interest.accept && interest.read && !interest.write);
    assert_eq!(state.borrow().interest_of(3), Some(interest));

    state.borrow_mut().fire(3, true, false, false);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert_eq!(calls_for(&log, 3), vec![Call::Accept]);
}

#[test]
fn write_interest_is_one_shot() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    let h = Recorder::new(5, &log).build();
    let token = engine.add_fd(h.clone()).expect("Failed to add handler");

    // Writable without write interest is not reported.
    state.borrow_mut().fire(5, false, true, false);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 0);

    engine.want_write(token).expect("Failed to arm write");
    engine.want_write(token).expect("Failed to arm write");
    assert!(state.borrow().interest_of(5).expect("Not registered").write);

    state.borrow_mut().fire(5, false, true, false);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert_eq!(calls_for(&log, 5), vec![Call::Write]);

    assert!(!engine.interest(token).expect("Missing registration").write);
    assert!(!state.borrow().interest_of(5).expect("Not registered").write);

    state.borrow_mut().fire(5, false, true, false);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 0);
    assert_eq!(engine.counters().write, 1);
}

#[test]
fn one_callback_per_dispatch_with_error_first() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    let h = Recorder::new(5, &log).build();
    let token = engine.add_fd(h.clone()).expect("Failed to add handler");
    engine.want_write(token).expect("Failed to arm write");

    state.borrow_mut().fire(5, true, true, false);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert_eq!(calls_for(&log, 5), vec![Call::Write]);

    // Level-triggered: readability is reported again.
    state.borrow_mut().fire(5, true, true, false);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert_eq!(calls_for(&log, 5), vec![Call::Write, Call::Read]);

    engine.want_write(token).expect("Failed to arm write");
    state.borrow_mut().fire(5, true, true, true);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);

    let calls = calls_for(&log, 5);
    assert_eq!(calls.len(), 3);
    assert!(matches!(calls[2], Call::Error(_)));
}

#[test]
fn duplicate_reports_yield_one_callback() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    let h = Recorder::new(5, &log).build();
    engine.add_fd(h.clone()).expect("Failed to add handler");

    state.borrow_mut().fire(5, true, false, false);
    state.borrow_mut().fire(5, true, false, false);

    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert_eq!(calls_for(&log, 5), vec![Call::Read]);
}

#[test]
fn error_is_delivered_once() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    let h = Recorder::new(9, &log).build();
    let token = engine.add_fd(h.clone()).expect("Failed to add handler");
    let raw = state.borrow().token_of(9);

    state.borrow_mut().fire(9, false, false, true);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert!(state.borrow().interest_of(9).is_none());

    state.borrow_mut().fire_token(raw, true, true, true);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 0);

    engine.want_write(token).expect("want_write after error");
    assert_eq!(engine.counters().error, 1);
    assert_eq!(calls_for(&log, 9).len(), 1);

    assert!(engine.has_fd(0));
    engine.del_fd(token, false).expect("Failed to remove handler");
    assert!(!engine.has_fd(0));
}

#[test]
fn stale_readiness_never_reaches_the_new_occupant() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 1);
    let log = log();

    let first = Recorder::new(7, &log).build();
    let old = engine.add_fd(first.clone()).expect("Failed to add handler");
    let raw = state.borrow().token_of(7);
    engine.del_fd(old, false).expect("Failed to remove handler");

    let second = Recorder::new(8, &log).build();
    let new = engine.add_fd(second.clone()).expect("Failed to add handler");
    assert_eq!(new.slot(), old.slot());

    state.borrow_mut().fire_token(raw, true, false, false);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 0);
    assert!(log.borrow().is_empty());
    assert_eq!(engine.counters().stale, 1);
}

#[test]
fn armed_write_never_blocks_removal() {
    let (poller, _state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    let h = Recorder::new(5, &log).build();
    let token = engine.add_fd(h.clone()).expect("Failed to add handler");
    engine.want_write(token).expect("Failed to arm write");

    engine.del_fd(token, false).expect("Failed to remove handler");
    assert_eq!(engine.remaining_fds(), 2);
}

#[test]
fn accepted_handler_waits_for_the_next_dispatch() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 4);
    let log = log();

    let accepted: Rc<RefCell<Vec<HandlerRef>>> = Rc::default();

    let listener = {
        let state = state.clone();
        let hook_log = log.clone();
        let accepted = accepted.clone();

        Recorder::new(40, &log)
            .listener()
            .hook(move |engine, call| {
                if *call != Call::Accept {
                    return;
                }
                let client = Recorder::new(41, &hook_log).build();
                engine
                    .add_fd(client.clone())
                    .expect("Failed to add accepted client");
                accepted.borrow_mut().push(client);

                state.borrow_mut().fire(41, true, false, false);
            })
            .build()
    };
    engine.add_fd(listener.clone()).expect("Failed to add listener");

    state.borrow_mut().fire(40, true, false, false);

    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert!(calls_for(&log, 41).is_empty());
    assert!(engine.has_fd(1));

    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert_eq!(calls_for(&log, 41), vec![Call::Read]);
    assert_eq!(engine.counters().accept, 1);
}

#[test]
fn handler_can_remove_itself_from_a_callback() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    let own: Rc<Cell<Option<Token>>> = Rc::default();
    let h = {
        let own = own.clone();
        Recorder::new(12, &log)
            .hook(move |engine, _| {
                let token = own.get().expect("Token not set");
                engine.del_fd(token, false).expect("Self removal failed");
            })
            .build()
    };

    let token = engine.add_fd(h.clone()).expect("Failed to add handler");
    own.set(Some(token));
    let raw = state.borrow().token_of(12);

    state.borrow_mut().fire(12, true, false, false);
    state.borrow_mut().fire_token(raw, true, false, false);

    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert!(!engine.has_fd(0));
    assert!(state.borrow().registered.is_empty());
    assert_eq!(engine.counters().stale, 1);
}

#[test]
fn nested_dispatch_is_refused_and_loses_nothing() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    let own: Rc<Cell<Option<Token>>> = Rc::default();
    let refused = Rc::new(Cell::new(false));
    let h = {
        let own = own.clone();
        let state = state.clone();
        let refused = refused.clone();
        Recorder::new(16, &log)
            .hook(move |engine, call| {
                if *call != Call::Read {
                    return;
                }
                let token = own.get().expect("Token not set");
                engine.want_write(token).expect("Failed to arm write");
                state.borrow_mut().fire(16, false, true, false);

                let nested = engine.dispatch_events(NOW);
                refused.set(matches!(nested, Err(EngineError::NestedDispatch)));
            })
            .build()
    };

    let token = engine.add_fd(h.clone()).expect("Failed to add handler");
    own.set(Some(token));

    state.borrow_mut().fire(16, true, false, false);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert!(refused.get());
    assert_eq!(calls_for(&log, 16), vec![Call::Read]);
    assert!(engine.interest(token).expect("Missing registration").write);

    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert_eq!(calls_for(&log, 16), vec![Call::Read, Call::Write]);
    assert!(!engine.interest(token).expect("Missing registration").write);
}

#[test]
fn busy_handler_keeps_its_write_interest() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    let h = Recorder::new(17, &log).build();
    let token = engine.add_fd(h.clone()).expect("Failed to add handler");
    engine.want_write(token).expect("Failed to arm write");

    state.borrow_mut().fire(17, false, true, false);
    {
        let _held = h.borrow();
        assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 0);
    }
    assert!(engine.interest(token).expect("Missing registration").write);
    assert!(calls_for(&log, 17).is_empty());

    state.borrow_mut().fire(17, false, true, false);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert_eq!(calls_for(&log, 17), vec![Call::Write]);
}

#[test]
fn slot_reused_within_a_batch_drops_the_old_report() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    let victim: Rc<Cell<Option<Token>>> = Rc::default();
    let added: Rc<RefCell<Vec<(Token, HandlerRef)>>> = Rc::default();
    let a = {
        let victim = victim.clone();
        let added = added.clone();
        let log = log.clone();
        Recorder::new(40, &log)
            .hook(move |engine, _| {
                let token = victim.get().expect("Token not set");
                engine.del_fd(token, true).expect("Forced removal failed");

                let c = Recorder::new(42, &log).build();
                let c_token = engine.add_fd(c.clone()).expect("Failed to add handler");
                added.borrow_mut().push((c_token, c));
            })
            .build()
    };
    let b = Recorder::new(41, &log).build();

    engine.add_fd(a.clone()).expect("Failed to add handler");
    let b_token = engine.add_fd(b.clone()).expect("Failed to add handler");
    victim.set(Some(b_token));

    state.borrow_mut().fire(40, true, false, false);
    state.borrow_mut().fire(41, true, false, false);

    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert!(calls_for(&log, 41).is_empty());
    assert!(calls_for(&log, 42).is_empty());
    assert_eq!(engine.counters().stale, 1);

    let (c_token, _) = added.borrow()[0].clone();
    assert_eq!(c_token.slot(), b_token.slot());
    assert_ne!(c_token, b_token);
}

#[test]
fn closing_handler_registers_like_a_connected_one() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    let h = Recorder::new(18, &log).closing().build();
    let token = engine.add_fd(h.clone()).expect("Failed to add handler");

    let interest = engine.interest(token).expect("Missing registration");
    assert!(interest.read && !interest.write);

    state.borrow_mut().fire(18, true, true, false);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert_eq!(calls_for(&log, 18), vec![Call::Read]);
}

#[test]
fn connecting_handler_arms_write_at_registration() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    let h = Recorder::new(15, &log).connecting().build();
    engine.add_fd(h.clone()).expect("Failed to add handler");
    assert!(state.borrow().interest_of(15).expect("Not registered").write);

    state.borrow_mut().fire(15, false, true, false);
    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 1);
    assert_eq!(calls_for(&log, 15), vec![Call::Write]);
}

#[test]
fn refused_registration_leaves_nothing_registered() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);
    let log = log();

    state.borrow_mut().fail_register = true;

    let h = Recorder::new(5, &log).build();
    let err = engine.add_fd(h.clone()).err().expect("Expected an error");
    assert!(matches!(err, EngineError::BackendFailure(_)));
    assert_eq!(engine.remaining_fds(), 2);

    state.borrow_mut().fail_register = false;
    engine.add_fd(h).expect("Failed to add handler");
}

#[test]
fn empty_engine_does_not_block() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);

    assert_eq!(engine.dispatch_events(None).expect("Dispatch failed"), 0);
    assert_eq!(state.borrow().polls, 0);

    assert_eq!(engine.dispatch_events(NOW).expect("Dispatch failed"), 0);
    assert_eq!(state.borrow().polls, 1);
}

#[test]
fn failed_poll_is_fatal() {
    let (poller, state) = ScriptedPoller::new();
    let mut engine = ReadinessBackend::with_poller(poller, 2);

    state.borrow_mut().fail_poll = true;
    let err = engine.dispatch_events(NOW).err().expect("Expected an error");
    assert!(err.is_fatal());
    assert_eq!(engine.name(), "scripted");
}

#[test]
fn dropping_the_engine_deregisters_everything() {
    let (poller, state) = ScriptedPoller::new();
    let log = log();
    let a = Recorder::new(1, &log).build();
    let b = Recorder::new(2, &log).build();

    {
        let mut engine = ReadinessBackend::with_poller(poller, 4);
        engine.add_fd(a.clone()).expect("Failed to add handler");
        engine.add_fd(b.clone()).expect("Failed to add handler");
        assert_eq!(state.borrow().registered.len(), 2);
    }

    assert!(state.borrow().registered.is_empty());
}
