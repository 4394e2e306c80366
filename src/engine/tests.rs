//! Tests for the engine: control loop, tick fan-out and stream plumbing

use super::*;
use crate::clock::{ManualClock, SystemClock};
use crate::driver::{VirtualDriver, WrittenMessage};
use crate::message::{DecodedMessage, RawEvent};
use parking_lot::Mutex;
use serial_test::serial;
use std::time::Duration;

struct TestRig {
    driver: Arc<VirtualDriver>,
    clock: Arc<ManualClock>,
    engine: Engine,
    input: Port,
    output: Port,
}

fn make_rig(config: EngineConfig) -> TestRig {
    let driver = Arc::new(VirtualDriver::new());
    let input = driver.add_input("Loop In");
    let output = driver.add_output("Loop Out");
    driver.add_output("Second Out");
    driver.connect(output.id, input.id);

    let clock = Arc::new(ManualClock::new(1));
    let engine = Engine::new(driver.clone(), clock.clone(), config).unwrap();
    TestRig {
        driver,
        clock,
        engine,
        input,
        output,
    }
}

async fn run_with_timeout(engine: &Engine) {
    tokio::time::timeout(Duration::from_secs(2), engine.run())
        .await
        .expect("control loop finished")
        .unwrap();
}

#[test]
fn test_new_requires_runtime() {
    let driver = Arc::new(VirtualDriver::new());
    let result = Engine::new(driver, Arc::new(ManualClock::new(1)), EngineConfig::default());
    assert!(matches!(result, Err(MidiError::Runtime(_))));
}

#[tokio::test]
async fn test_port_listing_and_resolution() {
    let rig = make_rig(EngineConfig::default());
    assert_eq!(rig.engine.input_ports().unwrap(), vec!["Loop In"]);
    assert_eq!(rig.engine.output_ports().unwrap(), vec!["Loop Out", "Second Out"]);

    let err = rig.engine.open_input(Some("Nope")).unwrap_err();
    assert_eq!(err.to_string(), "invalid MIDI input port name \"Nope\"");

    let output = rig.engine.open_output(Some("Second Out"), Some(0)).unwrap();
    assert_eq!(output.port().name, "Second Out");
}

#[tokio::test]
#[serial]
async fn test_no_ports_available() {
    let driver = Arc::new(VirtualDriver::new());
    driver.add_input("Only In");
    let engine = Engine::new(driver, Arc::new(ManualClock::new(1)), EngineConfig::default()).unwrap();

    let err = engine.open_output(None, None).unwrap_err();
    assert_eq!(err.to_string(), "no MIDI output ports");
    let err = engine.open_output(Some("Missing"), None).unwrap_err();
    assert!(matches!(err, MidiError::NoSuchPort { env_var: None, .. }));
}

#[tokio::test]
#[serial]
async fn test_environment_selects_output() {
    let rig = make_rig(EngineConfig::default());
    std::env::set_var("MIDI_OUTPUT", "Second Out");
    let output = rig.engine.open_output(None, None);
    std::env::remove_var("MIDI_OUTPUT");
    assert_eq!(output.unwrap().port().name, "Second Out");

    let output = rig.engine.open_output(None, None).unwrap();
    assert_eq!(output.port().name, "Loop Out");
}

#[tokio::test]
async fn test_run_returns_when_idle() {
    let rig = make_rig(EngineConfig::default());
    assert!(rig.engine.keep_alive().is_idle());
    run_with_timeout(&rig.engine).await;
}

#[tokio::test]
async fn test_recv_with_delivers_on_control_loop() {
    let rig = make_rig(EngineConfig::default());
    let input = rig.engine.open_input(Some("Loop In")).unwrap();
    let output = rig.engine.open_output(Some("Loop Out"), Some(0)).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    input.recv_with(move |result| sink.lock().extend(result.unwrap()));
    assert_eq!(rig.engine.keep_alive().count(), 1);

    output.send(&[0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7], 0).unwrap();
    output.send(&[0x90, 60, 100], 0).unwrap();
    rig.engine.tick_now();

    run_with_timeout(&rig.engine).await;
    let received = received.lock();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].bytes(), vec![0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]);
    assert_eq!(received[1].bytes(), vec![0x90, 60, 100]);
    assert!(rig.engine.keep_alive().is_idle());
}

#[tokio::test]
async fn test_sysex_spanning_reads() {
    let rig = make_rig(EngineConfig {
        read_batch: 1,
        ..Default::default()
    });
    let input = rig.engine.open_input(Some("Loop In")).unwrap();
    rig.driver.inject_packets(
        rig.input.id,
        &[RawEvent::new(10, &[0xF0, 0x01]), RawEvent::new(12, &[0x02, 0xF7])],
    );

    let messages = input.receive().await.unwrap();
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        DecodedMessage::Sysex(sysex) => {
            assert_eq!(sysex.timestamp, 10);
            assert_eq!(sysex.data, vec![0xF0, 0x01, 0x02, 0xF7]);
        }
        other => panic!("expected sysex, got {:?}", other),
    }
}

#[tokio::test]
async fn test_interleaved_delivery_order() {
    let rig = make_rig(EngineConfig {
        delivery_order: crate::sysex::DeliveryOrder::Interleaved,
        ..Default::default()
    });
    let input = rig.engine.open_input(Some("Loop In")).unwrap();
    rig.driver.inject(rig.input.id, 5, &[0xB0, 1, 1]);
    rig.driver.inject(rig.input.id, 6, &[0xF0, 0x10, 0xF7]);

    let messages = input.receive().await.unwrap();
    let stamps: Vec<_> = messages.iter().map(DecodedMessage::timestamp).collect();
    assert_eq!(stamps, vec![5, 6]);
}

#[tokio::test]
async fn test_close_fails_pending_receive() {
    let rig = make_rig(EngineConfig::default());
    let input = rig.engine.open_input(Some("Loop In")).unwrap();

    let outcome = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&outcome);
    input.recv_with(move |result| *sink.lock() = Some(result));

    tokio::time::sleep(Duration::from_millis(20)).await;
    input.close();
    run_with_timeout(&rig.engine).await;

    assert!(matches!(
        outcome.lock().take(),
        Some(Err(MidiError::StreamClosed))
    ));
    // The tick forgets closed inputs
    rig.engine.tick_now();
    assert!(rig.engine.ctx.inputs.lock().is_empty());
}

#[tokio::test]
async fn test_watermark_keeps_engine_alive() {
    let rig = make_rig(EngineConfig::default());
    rig.clock.set(50);
    let output = rig.engine.open_output(Some("Loop Out"), Some(20)).unwrap();

    output.send(&[0x90, 60, 100], 100).unwrap();
    output.send(&[0x80, 60, 0], 150).unwrap();
    assert_eq!(rig.engine.watermark(), 170);
    assert_eq!(rig.engine.keep_alive().count(), 1);
    assert!(matches!(
        output.send(&[0x90, 61, 100], 120),
        Err(MidiError::NonMonotonicSend)
    ));

    rig.engine.tick(170);
    assert_eq!(rig.engine.keep_alive().count(), 1);
    rig.engine.tick(171);
    assert_eq!(rig.engine.watermark(), 0);
    assert!(rig.engine.keep_alive().is_idle());

    assert_eq!(
        rig.driver.written(rig.output.id),
        vec![
            WrittenMessage {
                when: 100,
                bytes: vec![0x90, 60, 100]
            },
            WrittenMessage {
                when: 150,
                bytes: vec![0x80, 60, 0]
            },
        ]
    );
}

#[tokio::test]
async fn test_callbacks_dispatch_in_order() {
    let rig = make_rig(EngineConfig::default());
    let order = Arc::new(Mutex::new(Vec::new()));

    for due in [50, 10, 30] {
        let order = Arc::clone(&order);
        rig.engine.at(due, move |at| {
            order.lock().push(at);
            Ok(())
        });
    }
    assert_eq!(rig.engine.pending_callbacks(), 3);

    rig.clock.set(60);
    rig.engine.tick_now();
    run_with_timeout(&rig.engine).await;

    assert_eq!(*order.lock(), vec![10, 30, 50]);
    assert_eq!(rig.engine.pending_callbacks(), 0);
}

#[tokio::test]
async fn test_callback_failures_reach_fatal_channel() {
    let rig = make_rig(EngineConfig::default());
    let mut failures = rig.engine.fatal_errors().unwrap();
    assert!(rig.engine.fatal_errors().is_none());

    let ran_after = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&ran_after);
    rig.engine.at(5, |_| anyhow::bail!("lost sync"));
    rig.engine.at(6, move |_| {
        *flag.lock() = true;
        Ok(())
    });

    rig.clock.set(6);
    rig.engine.tick_now();
    run_with_timeout(&rig.engine).await;

    assert!(*ran_after.lock());
    let failure = failures.try_recv().unwrap();
    assert_eq!(failure.due, 5);
    assert_eq!(failure.message, "lost sync");
}

#[tokio::test]
async fn test_ticker_drives_chained_callbacks() {
    let driver = Arc::new(VirtualDriver::new());
    let engine = Engine::new(driver, Arc::new(SystemClock::new()), EngineConfig::default()).unwrap();
    let _ticker = engine.start_ticker().unwrap();

    let start = engine.current_time();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let chained = engine.clone();
    let log = Arc::clone(&fired);
    engine.at(start + 5, move |due| {
        log.lock().push(due);
        let log = Arc::clone(&log);
        chained.at(due + 10, move |due| {
            log.lock().push(due);
            Ok(())
        });
        Ok(())
    });

    run_with_timeout(&engine).await;
    assert_eq!(*fired.lock(), vec![start + 5, start + 15]);
    assert!(engine.current_time() >= start + 15);
}

#[tokio::test]
async fn test_run_waits_for_delayed_output() {
    let driver = Arc::new(VirtualDriver::new());
    driver.add_output("Synth");
    let engine = Engine::new(driver, Arc::new(SystemClock::new()), EngineConfig::default()).unwrap();
    let output = engine.open_output(Some("Synth"), Some(10)).unwrap();
    let _ticker = engine.start_ticker().unwrap();

    let when = engine.current_time() + 20;
    output.send(&[0xFC], when).unwrap();
    run_with_timeout(&engine).await;
    assert!(engine.current_time() > when + 10);
}

#[tokio::test]
async fn test_shutdown_drops_callbacks_and_closes_inputs() {
    let rig = make_rig(EngineConfig::default());
    let input = rig.engine.open_input(Some("Loop In")).unwrap();
    rig.engine.at(1_000_000, |_| Ok(()));
    assert_eq!(rig.engine.keep_alive().count(), 1);

    rig.engine.shutdown();
    assert!(input.is_closed());
    assert_eq!(rig.engine.pending_callbacks(), 0);
    run_with_timeout(&rig.engine).await;
}

#[tokio::test]
async fn test_callbacks_after_shutdown_do_not_block_run() {
    let rig = make_rig(EngineConfig::default());
    rig.engine.shutdown();

    let ran = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&ran);
    rig.engine.at(1, move |_| {
        *flag.lock() = true;
        Ok(())
    });
    assert!(rig.engine.keep_alive().is_idle());

    rig.clock.set(5);
    rig.engine.tick_now();
    run_with_timeout(&rig.engine).await;
    assert!(!*ran.lock());
}
