//! Libre 2 BLE stream decryption and unlock payload derivation.
//!
//! Everything here is pure: the same uid and frame always produce the same
//! plaintext, and nothing is logged. Callers decide what a failure means.

use crate::error::{CryptoError, LinkError};
use crate::identity::SensorIdentity;

pub const UID_LEN: usize = 8;
pub const FRAME_LEN: usize = 46;
pub const PLAINTEXT_LEN: usize = 44;
pub const UNLOCK_PAYLOAD_LEN: usize = 12;

const KEY: [u16; 4] = [0xA0C5, 0x6860, 0x0000, 0x14C6];
const SECRET: u16 = 0x1B6A;
const FRAME_SEED: u16 = 0x1B;
const ENABLE_SEED: u16 = 0x1E;
const ROUNDS: usize = 8;
const UNLOCK_PREFIX: [u8; 8] = [0xC1, 0xC4, 0xC3, 0xC0, 0xD4, 0xE1, 0xE7, 0xBA];

fn le16(lo: u8, hi: u8) -> u16 {
    u16::from_le_bytes([lo, hi])
}

fn prepare_variables(uid: &[u8; UID_LEN], x: u16, y: u16) -> [u16; 4] {
    [
        le16(uid[4], uid[5]).wrapping_add(x).wrapping_add(y),
        le16(uid[2], uid[3]).wrapping_add(KEY[2]),
        le16(uid[0], uid[1]).wrapping_add(x.wrapping_mul(2)),
        0x241A ^ KEY[3],
    ]
}

fn prepare_variables2(uid: &[u8; UID_LEN], words: [u16; 4]) -> [u16; 4] {
    [
        le16(uid[4], uid[5]).wrapping_add(words[0]),
        le16(uid[2], uid[3]).wrapping_add(words[1]),
        le16(uid[0], uid[1])
            .wrapping_add(words[2])
            .wrapping_add(KEY[2]),
        words[3].wrapping_add(KEY[3]),
    ]
}

/// Shift right by two, folding the dropped bits back in through the key table.
fn op(value: u16) -> u16 {
    let mut res = value >> 2;
    if value & 1 != 0 {
        res ^= KEY[1];
    }
    if value & 2 != 0 {
        res ^= KEY[0];
    }
    res
}

fn process_crypto(input: [u16; 4]) -> [u16; 4] {
    let r0 = op(input[0]) ^ input[3];
    let r1 = op(r0) ^ input[2];
    let r2 = op(r1) ^ input[1];
    let r3 = op(r2) ^ input[0];
    let r4 = op(r3);
    let r5 = op(r4 ^ r0);
    let r6 = op(r5 ^ r1);
    let r7 = op(r6 ^ r2);
    [r3 ^ r7, r2 ^ r6, r1 ^ r5, r0 ^ r4]
}

fn useful_function(uid: &[u8; UID_LEN], x: u16, y: u16) -> [u8; 4] {
    let block = process_crypto(prepare_variables(uid, x, y));
    let low = (block[0] ^ 0x4163).to_le_bytes();
    let high = (block[1] ^ 0x4344).to_le_bytes();
    [low[0], low[1], high[0], high[1]]
}

fn words_to_bytes(words: [u16; 4]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (chunk, word) in out.chunks_exact_mut(2).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

fn keystream(uid: &[u8; UID_LEN], nonce: [u8; 2]) -> [u8; ROUNDS * 8] {
    let d = useful_function(uid, FRAME_SEED, SECRET);
    let x = (le16(d[0], d[1]) ^ le16(d[2], d[3])) | 0x63;
    let y = le16(nonce[0], nonce[1]) ^ 0x63;

    let mut stream = [0u8; ROUNDS * 8];
    let mut block = process_crypto(prepare_variables(uid, x, y));
    for chunk in stream.chunks_exact_mut(8) {
        chunk.copy_from_slice(&words_to_bytes(block));
        block = process_crypto(block);
    }
    stream
}

/// CRC-16 over the frame plaintext: reflected poly 0xA001, init 0xFFFF, no final xor.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
        }
    }
    crc
}

/// The sensor's own CRC-16 flavour used inside the unlock derivation:
/// reflected poly 0x8408, init 0xFFFF, result bit-reversed.
pub fn libre_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0x8408 } else { crc >> 1 };
        }
    }
    crc.reverse_bits()
}

/// Checks the trailing little-endian CRC against the bytes before it.
pub fn verify_crc(plaintext: &[u8]) -> Result<(), CryptoError> {
    let split = plaintext.len().saturating_sub(2);
    let (body, tail) = plaintext.split_at(split);
    if tail.len() != 2 {
        return Err(CryptoError::InvalidFrameLength(plaintext.len()));
    }
    let enclosed = le16(tail[0], tail[1]);
    let computed = crc16(body);
    if enclosed != computed {
        return Err(CryptoError::Integrity { enclosed, computed });
    }
    Ok(())
}

/// Recovers the 44-byte plaintext of one 46-byte BLE frame.
///
/// The first two frame bytes are the per-frame nonce; the remaining 44 are
/// xored with the keystream. A plaintext is only returned once its CRC
/// checks out.
pub fn decrypt(uid: &[u8], frame: &[u8]) -> Result<[u8; PLAINTEXT_LEN], CryptoError> {
    let uid: &[u8; UID_LEN] = uid
        .try_into()
        .map_err(|_| CryptoError::InvalidUid(uid.len()))?;
    if frame.len() != FRAME_LEN {
        return Err(CryptoError::InvalidFrameLength(frame.len()));
    }

    let stream = keystream(uid, [frame[0], frame[1]]);
    let mut plaintext = [0u8; PLAINTEXT_LEN];
    for ((out, cipher), key) in plaintext.iter_mut().zip(&frame[2..]).zip(stream) {
        *out = cipher ^ key;
    }

    verify_crc(&plaintext)?;
    Ok(plaintext)
}

/// Builds the payload written to the sensor to start a streaming session.
///
/// `counter` is the already-incremented unlock counter. Returns
/// `MissingSensorIdentity` when the patch info is too short to derive from.
pub fn unlock_payload(
    identity: &SensorIdentity,
    counter: u16,
) -> Result<[u8; UNLOCK_PAYLOAD_LEN], LinkError> {
    let info = identity.patch_info();
    if info.len() < 6 {
        return Err(LinkError::MissingSensorIdentity);
    }
    let uid = identity.uid();
    let enable = identity.stream_unlock_code();

    let b = enable.wrapping_add(u32::from(counter)).to_le_bytes();
    let ad = useful_function(uid, FRAME_SEED, SECRET);
    let ed = useful_function(uid, ENABLE_SEED, (enable & 0xFFFF) as u16 ^ le16(info[4], info[5]));

    let t2 = process_crypto(prepare_variables2(
        uid,
        [
            le16(ed[0], ed[1]) ^ le16(b[2], b[3]),
            le16(ad[0], ad[1]),
            le16(ed[2], ed[3]) ^ le16(b[0], b[1]),
            le16(ad[2], ad[3]),
        ],
    ));
    let t2 = words_to_bytes(t2);

    let mut head = [0u8; 10];
    head[..8].copy_from_slice(&UNLOCK_PREFIX);
    head[8..].copy_from_slice(&t2[..2]);
    let t31 = libre_crc16(&head).swap_bytes();
    let t32 = libre_crc16(&t2[2..]).swap_bytes();
    let t33 = libre_crc16(&[ad[0], ad[1], ad[2], ad[3], ed[0], ed[1]]).swap_bytes();
    let t34 = libre_crc16(&[ed[2], ed[3], b[0], b[1], b[2], b[3]]).swap_bytes();

    let t4 = words_to_bytes(process_crypto(prepare_variables2(uid, [t31, t32, t33, t34])));

    let mut payload = [0u8; UNLOCK_PAYLOAD_LEN];
    payload[..4].copy_from_slice(&b);
    payload[4..].copy_from_slice(&t4);
    Ok(payload)
}
