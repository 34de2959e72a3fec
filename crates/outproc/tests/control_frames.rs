// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com
//
// Control protocol golden vectors: byte-exact reference encodings that pin
// the wire layout independently of the codec's own round trip.

use outproc::protocol::{ControlFrame, WireError};

/// Frame ↔ reference bytes pairs for every frame type.
fn golden_vectors() -> Vec<(ControlFrame, Vec<u8>)> {
    vec![
        (
            ControlFrame::ModuleCreate {
                gateway_message_version: 1,
                uri: "ipc:///tmp/msg".into(),
                uri_kind: 1,
                args: "{}".into(),
            },
            vec![
                0x01, // control version
                0x01, // type: create
                0x01, // gateway message version
                0x0F, 0x00, 0x00, 0x00, // uri length 15 (includes NUL)
                0x01, // uri kind: pair
                b'i', b'p', b'c', b':', b'/', b'/', b'/', b't', b'm', b'p', b'/', b'm', b's',
                b'g', 0x00, // uri + NUL
                0x03, 0x00, 0x00, 0x00, // args length 3 (includes NUL)
                b'{', b'}', 0x00, // args + NUL
            ],
        ),
        (ControlFrame::ModuleStart, vec![0x01, 0x02]),
        (ControlFrame::ModuleDestroy, vec![0x01, 0x03]),
        (
            ControlFrame::ModuleReply { status: 0 },
            vec![0x01, 0x04, 0x00, 0x00, 0x00, 0x00],
        ),
        (
            ControlFrame::ModuleReply { status: 5 },
            vec![0x01, 0x04, 0x05, 0x00, 0x00, 0x00],
        ),
        (
            ControlFrame::ModuleReply { status: -1 },
            vec![0x01, 0x04, 0xFF, 0xFF, 0xFF, 0xFF],
        ),
    ]
}

#[test]
fn encode_matches_golden_bytes() {
    for (frame, expected) in golden_vectors() {
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes, expected, "layout drift for {:?}", frame);
    }
}

#[test]
fn decode_matches_golden_frames() {
    for (expected, bytes) in golden_vectors() {
        let frame = ControlFrame::decode(&bytes).unwrap();
        assert_eq!(frame, expected);
    }
}

#[test]
fn round_trip_preserves_every_field() {
    let frames = vec![
        ControlFrame::create("ipc:///var/run/gateway/module-7.msg", "{\"telemetry\":true}"),
        ControlFrame::ModuleCreate {
            gateway_message_version: 1,
            uri: "ipc:///tmp/unicode-\u{00e9}".into(),
            uri_kind: 1,
            args: "caf\u{00e9}".into(),
        },
        ControlFrame::ModuleStart,
        ControlFrame::ModuleDestroy,
        ControlFrame::ModuleReply { status: i32::MIN },
    ];
    for frame in frames {
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes.len(), frame.encoded_size());
        assert_eq!(ControlFrame::decode(&bytes).unwrap(), frame);
    }
}

#[test]
fn truncation_at_every_offset_is_rejected() {
    for (frame, bytes) in golden_vectors() {
        for cut in 0..bytes.len() {
            let result = ControlFrame::decode(&bytes[..cut]);
            assert!(
                result.is_err(),
                "prefix of {} bytes decoded for {:?}",
                cut,
                frame
            );
        }
    }
}

#[test]
fn alien_input_never_decodes() {
    let alien: &[&[u8]] = &[
        &[],
        &[0x00],
        &[0xFF; 64],
        &[0x02, 0x01],                         // future version
        &[0x01, 0x00],                         // type zero
        &[0x01, 0x05],                         // type past reply
        b"GET / HTTP/1.1\r\n",
        &[0x01, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00], // create with no uri
    ];
    for bytes in alien {
        assert!(
            ControlFrame::decode(bytes).is_err(),
            "decoded alien bytes {:02x?}",
            bytes
        );
    }
}

#[test]
fn version_check_precedes_type_check() {
    // Both bytes are wrong; the version error must win.
    assert_eq!(
        ControlFrame::decode(&[0x7F, 0x7F]),
        Err(WireError::InvalidVersion(0x7F))
    );
}
