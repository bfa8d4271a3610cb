//! The few TL wire bits the orchestrator speaks itself.
//!
//! The orchestrator never parses responses beyond the top constructor tag,
//! but it does *emit* a handful of calls of its own: the authorization
//! export/import dance, guest log-outs, key destruction and the CDN config
//! fetch.  This module carries exactly those constructor ids, their byte
//! encoders and the matching minimal readers — nothing else of TL.

use crate::dc_id::DcId;
use crate::errors::RpcError;

// ─── Constructor ids ─────────────────────────────────────────────────────────

pub const ID_RPC_ERROR: u32 = 0x2144_ca19;
pub const ID_AUTH_EXPORT_AUTHORIZATION: u32 = 0xe5bf_ffcd;
pub const ID_AUTH_EXPORTED_AUTHORIZATION: u32 = 0xb434_e2b8;
pub const ID_AUTH_IMPORT_AUTHORIZATION: u32 = 0xa57a_7dad;
pub const ID_AUTH_LOG_OUT: u32 = 0x3e72_ba19;
pub const ID_DESTROY_AUTH_KEY: u32 = 0xd143_5160;
pub const ID_DESTROY_AUTH_KEY_OK: u32 = 0xf660_e1d4;
pub const ID_DESTROY_AUTH_KEY_NONE: u32 = 0x0a9f_2259;
pub const ID_DESTROY_AUTH_KEY_FAIL: u32 = 0xea10_9b13;
pub const ID_HELP_GET_CDN_CONFIG: u32 = 0x5202_9342;
pub const ID_BOOL_TRUE: u32 = 0x9972_75b5;
pub const ID_BOOL_FALSE: u32 = 0xbc79_9737;

// ─── Primitive writers ───────────────────────────────────────────────────────

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// TL `bytes`: 1-byte length for short payloads, `0xfe` + 3-byte length for
/// long ones, padded with zeros to a 4-byte boundary.
fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    if data.len() < 254 {
        out.push(data.len() as u8);
    } else {
        out.push(0xfe);
        out.push((data.len() & 0xff) as u8);
        out.push(((data.len() >> 8) & 0xff) as u8);
        out.push(((data.len() >> 16) & 0xff) as u8);
    }
    out.extend_from_slice(data);
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

// ─── Primitive readers ───────────────────────────────────────────────────────

fn read_i32(data: &[u8]) -> Option<(i32, &[u8])> {
    let head = data.get(..4)?;
    Some((i32::from_le_bytes(head.try_into().unwrap()), &data[4..]))
}

fn read_i64(data: &[u8]) -> Option<(i64, &[u8])> {
    let head = data.get(..8)?;
    Some((i64::from_le_bytes(head.try_into().unwrap()), &data[8..]))
}

fn read_bytes(data: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    let (&first, _) = data.split_first()?;
    let (len, header) = if first < 254 {
        (first as usize, 1)
    } else if data.len() >= 4 {
        (
            data[1] as usize | (data[2] as usize) << 8 | (data[3] as usize) << 16,
            4,
        )
    } else {
        return None;
    };
    let total = header + len;
    if data.len() < total {
        return None;
    }
    let padded = (total + 3) & !3;
    let rest = data.get(padded.min(data.len())..).unwrap_or(&[]);
    Some((data[header..total].to_vec(), rest))
}

// ─── Call encoders ───────────────────────────────────────────────────────────

/// `auth.exportAuthorization dc_id:int`
pub fn export_authorization(dc_id: DcId) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    write_u32(&mut out, ID_AUTH_EXPORT_AUTHORIZATION);
    write_i32(&mut out, dc_id);
    out
}

/// `auth.importAuthorization id:long bytes:bytes`
pub fn import_authorization(id: i64, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + bytes.len());
    write_u32(&mut out, ID_AUTH_IMPORT_AUTHORIZATION);
    write_i64(&mut out, id);
    write_bytes(&mut out, bytes);
    out
}

/// `auth.logOut`
pub fn log_out() -> Vec<u8> {
    ID_AUTH_LOG_OUT.to_le_bytes().to_vec()
}

/// `destroy_auth_key`
pub fn destroy_auth_key() -> Vec<u8> {
    ID_DESTROY_AUTH_KEY.to_le_bytes().to_vec()
}

/// `help.getCdnConfig`
pub fn get_cdn_config() -> Vec<u8> {
    ID_HELP_GET_CDN_CONFIG.to_le_bytes().to_vec()
}

/// `rpc_error error_code:int error_message:string` — the dual of
/// [`read_rpc_error`], used by session fabrics and tests.
pub fn rpc_error(code: i32, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + message.len());
    write_u32(&mut out, ID_RPC_ERROR);
    write_i32(&mut out, code);
    write_bytes(&mut out, message.as_bytes());
    out
}

/// `auth.exportedAuthorization id:long bytes:bytes` — the dual of
/// [`read_exported_authorization`].
pub fn exported_authorization(id: i64, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + bytes.len());
    write_u32(&mut out, ID_AUTH_EXPORTED_AUTHORIZATION);
    write_i64(&mut out, id);
    write_bytes(&mut out, bytes);
    out
}

/// Encode one of the `destroy_auth_key_*` result tags.
pub fn destroy_auth_key_res(res: DestroyAuthKeyRes) -> Vec<u8> {
    let id = match res {
        DestroyAuthKeyRes::Ok => ID_DESTROY_AUTH_KEY_OK,
        DestroyAuthKeyRes::None => ID_DESTROY_AUTH_KEY_NONE,
        DestroyAuthKeyRes::Fail => ID_DESTROY_AUTH_KEY_FAIL,
    };
    id.to_le_bytes().to_vec()
}

// ─── Response readers ────────────────────────────────────────────────────────

/// The top constructor tag of a response body.
pub fn top_constructor(body: &[u8]) -> Option<u32> {
    body.get(..4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

/// Parse an `rpc_error` body (including its tag).
pub fn read_rpc_error(body: &[u8]) -> Option<RpcError> {
    if top_constructor(body)? != ID_RPC_ERROR {
        return None;
    }
    let (code, rest) = read_i32(&body[4..])?;
    let (message, _) = read_bytes(rest)?;
    Some(RpcError::from_server(
        code,
        &String::from_utf8_lossy(&message),
    ))
}

/// Parse an `auth.exportedAuthorization` body into `(id, bytes)`.
pub fn read_exported_authorization(body: &[u8]) -> Option<(i64, Vec<u8>)> {
    if top_constructor(body)? != ID_AUTH_EXPORTED_AUTHORIZATION {
        return None;
    }
    let (id, rest) = read_i64(&body[4..])?;
    let (bytes, _) = read_bytes(rest)?;
    Some((id, bytes))
}

/// Result of a `destroy_auth_key` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyAuthKeyRes {
    Ok,
    None,
    Fail,
}

/// Parse a `destroy_auth_key_*` result tag.
pub fn read_destroy_auth_key_res(body: &[u8]) -> Option<DestroyAuthKeyRes> {
    match top_constructor(body)? {
        ID_DESTROY_AUTH_KEY_OK => Some(DestroyAuthKeyRes::Ok),
        ID_DESTROY_AUTH_KEY_NONE => Some(DestroyAuthKeyRes::None),
        ID_DESTROY_AUTH_KEY_FAIL => Some(DestroyAuthKeyRes::Fail),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_authorization_layout() {
        let wire = export_authorization(4);
        assert_eq!(wire.len(), 8);
        assert_eq!(u32::from_le_bytes(wire[..4].try_into().unwrap()), ID_AUTH_EXPORT_AUTHORIZATION);
        assert_eq!(i32::from_le_bytes(wire[4..].try_into().unwrap()), 4);
    }

    #[test]
    fn bytes_are_padded_to_words() {
        let wire = import_authorization(7, &[0xaa, 0xbb]);
        // tag (4) + id (8) + len byte + 2 data bytes + 1 pad byte
        assert_eq!(wire.len(), 16);
        assert_eq!(wire[12], 2);
        assert_eq!(&wire[13..15], &[0xaa, 0xbb]);
        assert_eq!(wire[15], 0);
    }

    #[test]
    fn rpc_error_round_trip() {
        let wire = rpc_error(420, "FLOOD_WAIT_3");
        let err = read_rpc_error(&wire).unwrap();
        assert_eq!(err.code, 420);
        assert_eq!(err.name, "FLOOD_WAIT");
        assert_eq!(err.value, Some(3));

        assert!(read_rpc_error(&log_out()).is_none());
    }

    #[test]
    fn exported_authorization_round_trip() {
        let wire = exported_authorization(1234, &[1, 2, 3, 4, 5]);
        let (id, bytes) = read_exported_authorization(&wire).unwrap();
        assert_eq!(id, 1234);
        assert_eq!(bytes, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn destroy_res_tags() {
        for res in [DestroyAuthKeyRes::Ok, DestroyAuthKeyRes::None, DestroyAuthKeyRes::Fail] {
            assert_eq!(read_destroy_auth_key_res(&destroy_auth_key_res(res)), Some(res));
        }
        assert_eq!(read_destroy_auth_key_res(&get_cdn_config()), None);
    }

    #[test]
    fn long_bytes_use_extended_length() {
        let data = vec![7u8; 300];
        let mut out = Vec::new();
        write_bytes(&mut out, &data);
        assert_eq!(out[0], 0xfe);
        assert_eq!(out[1] as usize | (out[2] as usize) << 8 | (out[3] as usize) << 16, 300);
        let (read, _) = read_bytes(&out).unwrap();
        assert_eq!(read, data);
    }
}
