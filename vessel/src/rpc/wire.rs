//! Length-prefixed JSON framing.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of
//! JSON. A closed peer surfaces as [`VesselError::RpcTransportLost`] so the
//! caller can distinguish "the RPC sibling died" from an operation failure.

use std::io::{Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use vessel_shared::errors::{VesselError, VesselResult};

/// Upper bound on a frame; nothing legitimate comes close (the largest
/// payloads are directory listings and key material).
const MAX_FRAME: u32 = 16 << 20;

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> VesselResult<()> {
    let body = serde_json::to_vec(value)
        .map_err(|e| VesselError::Setup(format!("encode frame: {e}")))?;
    let len = u32::try_from(body.len())
        .map_err(|_| VesselError::Setup("frame too large".into()))?;
    if len > MAX_FRAME {
        return Err(VesselError::Setup("frame too large".into()));
    }

    writer
        .write_all(&len.to_be_bytes())
        .and_then(|_| writer.write_all(&body))
        .and_then(|_| writer.flush())
        .map_err(|_| VesselError::RpcTransportLost)
}

pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> VesselResult<T> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|_| VesselError::RpcTransportLost)?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME {
        return Err(VesselError::RpcTransportLost);
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .map_err(|_| VesselError::RpcTransportLost)?;

    serde_json::from_slice(&body).map_err(|_| VesselError::RpcTransportLost)
}
