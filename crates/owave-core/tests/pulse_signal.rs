use nix::sys::signal::{raise, Signal};
use owave_core::alarm::{AlarmChannel, AlarmTracker};
use owave_core::control::ControlChannel;
use owave_core::receiver::{monotonic_now, PulseReceiver, PulseWorker};
use owave_core::severity::Severity;
use std::time::{Duration, Instant};

fn unique(tag: &str) -> String {
    format!("/owave-it-{tag}-{}", std::process::id())
}

fn wait_for_events(alarm: &AlarmChannel, events: u64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if alarm.read_state().map(|s| s.events).unwrap_or(0) >= events {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn raised_signals_are_classified_and_published() {
    let alarm_name = unique("alarm");
    let control_name = unique("control");
    let alarm = AlarmChannel::create_fresh(&alarm_name).expect("alarm channel");
    let control = ControlChannel::create_fresh(&control_name).expect("control channel");

    let receiver = PulseReceiver::install(Signal::SIGALRM).expect("install handler");
    let tracker = AlarmTracker::new(monotonic_now(), 20);
    let worker = {
        let alarm = AlarmChannel::attach(&alarm_name).expect("attach alarm");
        let control = ControlChannel::attach(&control_name).expect("attach control");
        std::thread::Builder::new()
            .name("pulse-worker".to_string())
            .spawn(move || PulseWorker::new(receiver, tracker).run(&alarm, &control))
            .expect("spawn worker")
    };

    assert_eq!(alarm.read_state().expect("blank").severity, Severity::Calm);
    assert_eq!(alarm.read_state().expect("blank").events, 0);

    raise(Signal::SIGALRM).expect("first pulse");
    assert!(wait_for_events(&alarm, 1), "first pulse never published");
    let first = alarm.read_state().expect("first");
    assert_eq!(first.severity, Severity::Calm);
    assert_eq!(first.cursor, 1);
    assert_eq!(first.label.len(), "HH:MM:SS".len());

    raise(Signal::SIGALRM).expect("second pulse");
    assert!(wait_for_events(&alarm, 2), "second pulse never published");
    let second = alarm.read_state().expect("second");
    assert_eq!(second.severity, Severity::Calm);
    assert_eq!(second.cursor, 3);

    control.request_drain();
    let report = worker.join().expect("worker thread").expect("worker run");
    assert_eq!(report.pulses, 2);

    alarm.destroy().expect("destroy alarm");
    control.destroy().expect("destroy control");
}
