//! Record codec properties against a real file: round-trip fidelity and
//! length-prefixed framing with hostile payloads.

use std::io::Write;

use sertap::event::{Direction, Event};
use sertap::record::{encode_record, RecordReader};

#[test]
fn file_round_trip_preserves_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("roundtrip.rec");

    let events = vec![
        Event::at(Direction::ReadFromDevice, b"+CREG: 1".to_vec(), 1_700_000_001.5),
        Event::at(Direction::WrittenByClient, b"AT+CREG?".to_vec(), 1_700_000_002.000001),
        Event::at(Direction::ReadFromDevice, vec![0x00, 0xff, 0x7f], 1_700_000_003.999999),
    ];

    let mut file = std::fs::File::create(&path).expect("create");
    for event in &events {
        file.write_all(&encode_record(event)).expect("write");
    }
    drop(file);

    let mut reader = RecordReader::new(std::fs::File::open(&path).expect("open"));
    for expected in &events {
        let got = reader.read_record().expect("read").expect("record");
        assert_eq!(got.direction, expected.direction);
        assert_eq!(got.payload, expected.payload);
        assert_eq!(got.timestamp_parts(), expected.timestamp_parts());
    }
    assert!(reader.read_record().expect("eof").is_none());
}

#[test]
fn embedded_line_breaks_do_not_confuse_framing() {
    // A payload that would fool any newline-scanning reader.
    let nasty = b"first\nsecond\r\nthird\n".to_vec();
    let events = vec![
        Event::at(Direction::ReadFromDevice, nasty.clone(), 10.0),
        Event::at(Direction::ReadFromDevice, b"after".to_vec(), 11.0),
    ];

    let mut buf = Vec::new();
    for event in &events {
        buf.extend_from_slice(&encode_record(event));
    }

    let mut reader = RecordReader::new(&buf[..]);
    let first = reader.read_record().unwrap().unwrap();
    assert_eq!(first.payload, nasty);
    let second = reader.read_record().unwrap().unwrap();
    assert_eq!(second.payload, b"after");
    assert!(reader.read_record().unwrap().is_none());
}
