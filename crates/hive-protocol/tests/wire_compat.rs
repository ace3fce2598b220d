// Verify the control-channel wire format stays stable. Master and worker
// binaries may come from different builds during a rolling restart, so these
// strings must never change shape silently.

use chrono::{TimeZone, Utc};
use hive_protocol::{decode_line, encode_line, BootstrapInfo, MasterMessage, WorkerMessage};

#[test]
fn perf_measure_wire_shape() {
    let line = encode_line(&MasterMessage::PerfMeasure).unwrap();
    assert_eq!(line, "{\"type\":\"perf_measure\"}\n");
}

#[test]
fn close_wire_shape() {
    let line = encode_line(&MasterMessage::Close).unwrap();
    assert_eq!(line, "{\"type\":\"close\"}\n");
}

#[test]
fn bootstrap_round_trip() {
    let msg = MasterMessage::Bootstrap(BootstrapInfo {
        plist: vec![101, 102],
        startup_time: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        process_id: 100,
        code: Some(1),
        signal: None,
        unique_id: "a1b2c3-100".into(),
    });

    let line = encode_line(&msg).unwrap();
    assert!(line.contains("\"type\":\"bootstrap\""));
    assert!(line.contains("\"plist\":[101,102]"));
    assert!(line.contains("\"unique_id\":\"a1b2c3-100\""));
    // absent signal must not appear on the wire
    assert!(!line.contains("\"signal\""));

    let decoded: MasterMessage = decode_line(&line).unwrap();
    assert_eq!(decoded, msg);
}

#[test]
fn event_loop_report() {
    let line = encode_line(&WorkerMessage::EventLoop { id: 2, delay: 17 }).unwrap();
    assert_eq!(line, "{\"type\":\"event_loop\",\"id\":2,\"delay\":17}\n");

    let decoded: WorkerMessage = decode_line(&line).unwrap();
    assert_eq!(decoded, WorkerMessage::EventLoop { id: 2, delay: 17 });
}

#[test]
fn ready_report() {
    let decoded: WorkerMessage = decode_line("{\"type\":\"ready\",\"id\":0,\"port\":40123}").unwrap();
    assert_eq!(decoded, WorkerMessage::Ready { id: 0, port: 40123 });
}

#[test]
fn unknown_type_is_rejected() {
    let result: Result<MasterMessage, _> = decode_line("{\"type\":\"sticky-session\"}");
    assert!(result.is_err());
}

#[test]
fn decode_tolerates_trailing_newline() {
    let decoded: MasterMessage = decode_line("{\"type\":\"perf_measure\"}\n").unwrap();
    assert_eq!(decoded, MasterMessage::PerfMeasure);
}
