// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control frame encoding and decoding.
//!
//! Four frame types drive the remote module lifecycle:
//!
//! | type | frame          | payload                                        |
//! |------|----------------|------------------------------------------------|
//! | 1    | `ModuleCreate`  | gw message version, message URI, module args  |
//! | 2    | `ModuleStart`   | none                                          |
//! | 3    | `ModuleDestroy` | none                                          |
//! | 4    | `ModuleReply`   | status (`i32`, 0 = success)                   |
//!
//! Decoding validates the entire input before allocating: borrowed string
//! slices are checked for length, terminator and UTF-8 first, and only a
//! fully valid frame is copied into owned storage.

use super::cursor::{Cursor, CursorMut};
use super::{WireError, CONTROL_VERSION, GATEWAY_MESSAGE_VERSION, URI_KIND_PAIR};

const TYPE_MODULE_CREATE: u8 = 1;
const TYPE_MODULE_START: u8 = 2;
const TYPE_MODULE_DESTROY: u8 = 3;
const TYPE_MODULE_REPLY: u8 = 4;

/// Header bytes: version + type.
const HEADER_SIZE: usize = 2;

/// A control channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Directive to instantiate the remote module. Carries the message
    /// channel URI (which overrides any default the host was started with)
    /// and the opaque module arguments.
    ModuleCreate {
        gateway_message_version: u8,
        uri: String,
        uri_kind: u8,
        args: String,
    },
    /// Directive to start the remote module.
    ModuleStart,
    /// Directive to destroy the remote module.
    ModuleDestroy,
    /// Host response. `status` 0 reports success; any other value reports
    /// failure or a terminated module.
    ModuleReply { status: i32 },
}

impl ControlFrame {
    /// Build a Create frame for a pair message endpoint with the current
    /// gateway message version.
    pub fn create(uri: &str, args: &str) -> ControlFrame {
        ControlFrame::ModuleCreate {
            gateway_message_version: GATEWAY_MESSAGE_VERSION,
            uri: uri.to_owned(),
            uri_kind: URI_KIND_PAIR,
            args: args.to_owned(),
        }
    }

    fn frame_type(&self) -> u8 {
        match self {
            ControlFrame::ModuleCreate { .. } => TYPE_MODULE_CREATE,
            ControlFrame::ModuleStart => TYPE_MODULE_START,
            ControlFrame::ModuleDestroy => TYPE_MODULE_DESTROY,
            ControlFrame::ModuleReply { .. } => TYPE_MODULE_REPLY,
        }
    }

    /// Exact number of bytes [`encode`](Self::encode) will write.
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE
            + match self {
                // gw version + (len, kind, bytes, NUL) + (len, bytes, NUL)
                ControlFrame::ModuleCreate { uri, args, .. } => {
                    1 + 4 + 1 + uri.len() + 1 + 4 + args.len() + 1
                }
                ControlFrame::ModuleStart | ControlFrame::ModuleDestroy => 0,
                ControlFrame::ModuleReply { .. } => 4,
            }
    }

    /// Encode into `buf`, returning the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        let mut cur = CursorMut::new(buf);
        cur.write_u8(CONTROL_VERSION)?;
        cur.write_u8(self.frame_type())?;
        match self {
            ControlFrame::ModuleCreate {
                gateway_message_version,
                uri,
                uri_kind,
                args,
            } => {
                cur.write_u8(*gateway_message_version)?;
                cur.write_u32_le(uri.len() as u32 + 1)?;
                cur.write_u8(*uri_kind)?;
                cur.write_bytes(uri.as_bytes())?;
                cur.write_u8(0)?;
                cur.write_u32_le(args.len() as u32 + 1)?;
                cur.write_bytes(args.as_bytes())?;
                cur.write_u8(0)?;
            }
            ControlFrame::ModuleStart | ControlFrame::ModuleDestroy => {}
            ControlFrame::ModuleReply { status } => {
                cur.write_i32_le(*status)?;
            }
        }
        Ok(cur.offset())
    }

    /// Encode into a fresh exactly-sized buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = vec![0u8; self.encoded_size()];
        let written = self.encode(&mut buf)?;
        buf.truncate(written);
        Ok(buf)
    }

    /// Decode a frame from `bytes`.
    ///
    /// Rejects unknown versions and types, truncated input, zero or
    /// over-long length prefixes, missing NUL terminators and non-UTF-8
    /// string bytes. No owned memory is allocated unless the whole frame
    /// validates.
    pub fn decode(bytes: &[u8]) -> Result<ControlFrame, WireError> {
        let mut cur = Cursor::new(bytes);
        let version = cur.read_u8()?;
        if version != CONTROL_VERSION {
            return Err(WireError::InvalidVersion(version));
        }
        let frame_type = cur.read_u8()?;
        match frame_type {
            TYPE_MODULE_CREATE => {
                let gateway_message_version = cur.read_u8()?;
                let uri_len = cur.read_u32_le()?;
                let uri_kind = cur.read_u8()?;
                let uri = read_nul_str(&mut cur, uri_len, "uri")?;
                let args_len = cur.read_u32_le()?;
                let args = read_nul_str(&mut cur, args_len, "args")?;
                Ok(ControlFrame::ModuleCreate {
                    gateway_message_version,
                    uri: uri.to_owned(),
                    uri_kind,
                    args: args.to_owned(),
                })
            }
            TYPE_MODULE_START => Ok(ControlFrame::ModuleStart),
            TYPE_MODULE_DESTROY => Ok(ControlFrame::ModuleDestroy),
            TYPE_MODULE_REPLY => {
                let status = cur.read_i32_le()?;
                Ok(ControlFrame::ModuleReply { status })
            }
            other => Err(WireError::InvalidType(other)),
        }
    }
}

/// Read a length-prefixed NUL-terminated string field. The prefix counts
/// the NUL, so it is at least 1. Returns a borrowed slice; the caller
/// copies only once the whole frame is known valid.
fn read_nul_str<'a>(
    cur: &mut Cursor<'a>,
    len: u32,
    field: &'static str,
) -> Result<&'a str, WireError> {
    if len == 0 || len as usize > cur.remaining() {
        return Err(WireError::BadLength { field, len });
    }
    let raw = cur.read_bytes(len as usize)?;
    let (terminator, body) = raw.split_last().ok_or(WireError::BadString { field })?;
    if *terminator != 0 || body.contains(&0) {
        return Err(WireError::BadString { field });
    }
    std::str::from_utf8(body).map_err(|_| WireError::BadString { field })
}
