use crate::addressing::{GroupAddress, IndividualAddress};
use chrono::{DateTime, Utc};
use thiserror::Error;

/* knxd socket message types */
pub const EIB_CLOSE: u16 = 0x0006;
pub const EIB_OPEN_VBUSMONITOR: u16 = 0x0012;
pub const EIB_BUSMONITOR_PACKET: u16 = 0x0014;
pub const EIB_OPEN_GROUPCON: u16 = 0x0026;
pub const EIB_GROUP_PACKET: u16 = 0x0027;

/// Largest frame the receive loop will accept. A declared length beyond
/// this cannot be skipped without losing framing and forces a reconnect.
pub const MAX_FRAME_SIZE: usize = 256;

/// Group telegrams carry at most 14 data bytes.
pub const MAX_APDU_DATA: usize = 14;

#[derive(Error, Debug, PartialEq)]
pub enum ProtoError {
    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),
    #[error("Declared frame length {declared} does not match actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Frame payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Group telegram too short: {0} bytes")]
    TelegramTooShort(usize),
    #[error("Unknown APCI 0x{0:02X}")]
    UnknownApci(u8),
    #[error("Write telegram without payload")]
    EmptyPayload,
}

/// Application protocol control information, the upper two bits of the
/// APCI byte of a group telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apci {
    Read = 0x00,
    Response = 0x40,
    Write = 0x80,
}

impl Apci {
    pub fn from_byte(b: u8) -> Result<Self, ProtoError> {
        match b & 0xC0 {
            0x00 => Ok(Apci::Read),
            0x40 => Ok(Apci::Response),
            0x80 => Ok(Apci::Write),
            other => Err(ProtoError::UnknownApci(other)),
        }
    }
}

/// A group telegram as seen by the bridge. Received telegrams carry the
/// source individual address, outgoing ones do not (knxd fills it in).
#[derive(Debug, Clone)]
pub struct Telegram {
    pub source: Option<IndividualAddress>,
    pub dest: GroupAddress,
    pub apci: Apci,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Wrap a message for the knxd socket: 2-byte big-endian length covering
/// everything after itself, 2-byte big-endian message type, payload.
pub fn encode_frame(msg_type: u16, payload: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if payload.len() > u16::MAX as usize - 2 {
        return Err(ProtoError::PayloadTooLarge(payload.len()));
    }

    let len = (2 + payload.len()) as u16;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&msg_type.to_be_bytes());
    frame.extend_from_slice(payload);
    return Ok(frame);
}

/// Unwrap a full frame (including the length field) into message type and
/// payload, rejecting a length field that disagrees with the bytes present.
pub fn decode_frame(frame: &[u8]) -> Result<(u16, Vec<u8>), ProtoError> {
    if frame.len() < 4 {
        return Err(ProtoError::FrameTooShort(frame.len()));
    }

    let declared = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    if declared != frame.len() - 2 {
        return Err(ProtoError::LengthMismatch { declared, actual: frame.len() - 2 });
    }

    let msg_type = u16::from_be_bytes([frame[2], frame[3]]);
    return Ok((msg_type, frame[4..].to_vec()));
}

/// The open-group-communication handshake message. `write_only = false`
/// asks knxd for bidirectional bus forwarding; the daemon answers with the
/// same message type on success.
pub fn open_groupcon_frame(write_only: bool) -> Vec<u8> {
    let payload = [0x00, if write_only { 0x01 } else { 0x00 }, 0x00];
    /* 3-byte payload can not exceed the length field */
    return encode_frame(EIB_OPEN_GROUPCON, &payload).unwrap();
}

/// Encode the group APDU for an outgoing telegram (no source address,
/// knxd stamps its own): dest(2) + TPCI(1) + APCI byte, then data.
///
/// A single data byte that fits 6 bits rides inside the APCI byte (the
/// short form); anything else follows the APCI byte verbatim.
pub fn encode_group_apdu(dest: GroupAddress, apci: Apci, data: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if data.len() > MAX_APDU_DATA {
        return Err(ProtoError::PayloadTooLarge(data.len()));
    }

    let mut apdu = Vec::with_capacity(4 + data.len());
    apdu.extend_from_slice(&dest.raw().to_be_bytes());
    apdu.push(0x00); /* TPCI */

    match apci {
        Apci::Read => {
            apdu.push(0x00);
        }
        Apci::Write | Apci::Response => {
            if data.is_empty() {
                return Err(ProtoError::EmptyPayload);
            }
            if data.len() == 1 && data[0] <= 0x3F {
                apdu.push(apci as u8 | data[0]);
            } else {
                apdu.push(apci as u8);
                apdu.extend_from_slice(data);
            }
        }
    }

    return Ok(apdu);
}

/// Parse the payload of a received group packet. Unlike the send form it
/// starts with the 2-byte source individual address:
/// src(2) + dest(2) + TPCI(1) + APCI(1) [+ data...].
pub fn parse_group_apdu(payload: &[u8]) -> Result<Telegram, ProtoError> {
    if payload.len() < 6 {
        return Err(ProtoError::TelegramTooShort(payload.len()));
    }

    let source = IndividualAddress::from_raw(u16::from_be_bytes([payload[0], payload[1]]));
    let dest = GroupAddress::from_raw(u16::from_be_bytes([payload[2], payload[3]]));
    let apci = Apci::from_byte(payload[5])?;

    let data = if payload.len() > 6 {
        payload[6..].to_vec()
    } else {
        match apci {
            Apci::Read => Vec::new(),
            /* short form, value inline in the low 6 bits */
            _ => vec![payload[5] & 0x3F],
        }
    };

    return Ok(Telegram {
        source: Some(source),
        dest,
        apci,
        payload: data,
        timestamp: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ga(s: &str) -> GroupAddress {
        return s.parse().unwrap();
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = encode_frame(EIB_GROUP_PACKET, &[0x0A, 0x03, 0x00, 0x81]).unwrap();
        assert_eq!(frame[0], 0x00);
        assert_eq!(frame[1], 0x06); /* 2 + 4 payload bytes */
        let (msg_type, payload) = decode_frame(&frame).unwrap();
        assert_eq!(msg_type, EIB_GROUP_PACKET);
        assert_eq!(payload, vec![0x0A, 0x03, 0x00, 0x81]);
    }

    #[test]
    fn test_frame_length_mismatch() {
        let mut frame = encode_frame(EIB_GROUP_PACKET, &[0x01, 0x02]).unwrap();
        frame[1] += 1;
        assert!(matches!(decode_frame(&frame), Err(ProtoError::LengthMismatch { .. })));
        assert!(decode_frame(&[0x00]).is_err());
    }

    #[test]
    fn test_open_groupcon_bytes() {
        /* len=5, type=0x0026, payload 00 00 00 for bidirectional mode */
        assert_eq!(open_groupcon_frame(false), vec![0x00, 0x05, 0x00, 0x26, 0x00, 0x00, 0x00]);
        assert_eq!(open_groupcon_frame(true), vec![0x00, 0x05, 0x00, 0x26, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_short_apdu_write() {
        let apdu = encode_group_apdu(ga("1/2/3"), Apci::Write, &[0x01]).unwrap();
        assert_eq!(apdu, vec![0x0A, 0x03, 0x00, 0x81]);
    }

    #[test]
    fn test_long_apdu_write() {
        /* a single byte above 0x3F does not fit the short form */
        let apdu = encode_group_apdu(ga("1/2/5"), Apci::Write, &[0xBF]).unwrap();
        assert_eq!(apdu, vec![0x0A, 0x05, 0x00, 0x80, 0xBF]);

        let apdu = encode_group_apdu(ga("1/2/3"), Apci::Write, &[0x0C, 0x1A]).unwrap();
        assert_eq!(apdu, vec![0x0A, 0x03, 0x00, 0x80, 0x0C, 0x1A]);
    }

    #[test]
    fn test_read_request_apdu() {
        let apdu = encode_group_apdu(ga("1/2/3"), Apci::Read, &[]).unwrap();
        assert_eq!(apdu, vec![0x0A, 0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_write_rejects_bad_payloads() {
        assert!(encode_group_apdu(ga("1/2/3"), Apci::Write, &[]).is_err());
        assert!(encode_group_apdu(ga("1/2/3"), Apci::Write, &[0u8; 15]).is_err());
    }

    #[test]
    fn test_parse_received_telegram() {
        /* src 1.1.20 = 0x1114, dest 1/2/4, short write of 0x01 */
        let telegram = parse_group_apdu(&[0x11, 0x14, 0x0A, 0x04, 0x00, 0x81]).unwrap();
        assert_eq!(telegram.source.unwrap().to_string(), "1.1.20");
        assert_eq!(telegram.dest.to_string(), "1/2/4");
        assert_eq!(telegram.apci, Apci::Write);
        assert_eq!(telegram.payload, vec![0x01]);

        /* a read has no data */
        let telegram = parse_group_apdu(&[0x11, 0x14, 0x0A, 0x04, 0x00, 0x00]).unwrap();
        assert_eq!(telegram.apci, Apci::Read);
        assert!(telegram.payload.is_empty());

        assert!(parse_group_apdu(&[0x11, 0x14, 0x0A, 0x04, 0x00]).is_err());
    }

    #[test]
    fn test_send_receive_asymmetry_roundtrip() {
        /* the receive form has a source prefix the send form lacks, so a
        roundtrip has to fake one */
        let cases: Vec<(Apci, Vec<u8>)> = vec![
            (Apci::Write, vec![0x01]),
            (Apci::Write, vec![0xBF]),
            (Apci::Write, vec![0x0C, 0x1A]),
            (Apci::Response, vec![0x2A]),
            (Apci::Read, vec![]),
        ];

        for (apci, data) in cases {
            let sent = encode_group_apdu(ga("5/1/17"), apci, &data).unwrap();
            let mut wire = vec![0x11, 0x01]; /* synthetic source 1.1.1 */
            wire.extend_from_slice(&sent);

            let telegram = parse_group_apdu(&wire).unwrap();
            assert_eq!(telegram.dest, ga("5/1/17"));
            assert_eq!(telegram.apci, apci);
            assert_eq!(telegram.payload, data);
        }
    }
}
