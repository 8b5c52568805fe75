//! Wire frames: IEEE 802.15.4-2011 MAC header with 16-bit addressing and PAN
//! compression, followed by `[type:1][seq_ack:1][body...]`.

use crate::config::PAN_ID;
use heapless::Vec;

/// Destination for discovery broadcasts.
pub const BROADCAST_ADDR: u16 = 0xFFFF;

/// Longest frame the chip buffer holds.
pub const MAX_FRAME_LEN: usize = 128;

/// MHR length with 16-bit addresses and a compressed PAN.
pub const MHR_LEN: usize = 9;

/// Longest payload (type byte, seq/ack byte and body).
pub const MAX_PAYLOAD: usize = MAX_FRAME_LEN - MHR_LEN;

/// Frame control: data frame, PAN id compression, 16-bit dest + src.
pub const FRAME_CTRL_DATA: u16 = 0x8841;

/// Payload offsets.
const OFF_TYPE: usize = 0;
const OFF_SEQ_ACK: usize = 1;
/// First body byte within a payload.
pub const OFF_BODY: usize = 2;

/// Message types carried in the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MsgType {
    Broadcast = 0x01,
    Syn = 0x11,
    SynAck = 0x12,
    Ack = 0x13,
    Disconn = 0x14,
    DReq = 0x21,
    DReqAck = 0x22,
    DInit = 0x23,
    DResp = 0x24,
    DFail = 0x25,
    DRes = 0x26,
    DResAck = 0x27,
    MConn = 0x31,
    Other = 0xFE,
}

impl From<u8> for MsgType {
    fn from(raw: u8) -> Self {
        match raw {
            0x01 => MsgType::Broadcast,
            0x11 => MsgType::Syn,
            0x12 => MsgType::SynAck,
            0x13 => MsgType::Ack,
            0x14 => MsgType::Disconn,
            0x21 => MsgType::DReq,
            0x22 => MsgType::DReqAck,
            0x23 => MsgType::DInit,
            0x24 => MsgType::DResp,
            0x25 => MsgType::DFail,
            0x26 => MsgType::DRes,
            0x27 => MsgType::DResAck,
            0x31 => MsgType::MConn,
            _ => MsgType::Other,
        }
    }
}

impl MsgType {
    /// Commands advance protocol state; acks only confirm the last command.
    pub fn is_ack(self) -> bool {
        matches!(self, MsgType::Ack | MsgType::DReqAck | MsgType::DResAck)
    }
}

/// Decoded MAC header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mhr {
    pub frame_ctrl: u16,
    pub seq: u8,
    pub pan_id: u16,
    pub dest: u16,
    pub src: u16,
}

/// Frame shape violations. All of these drop the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    TooShort,
    TooLong,
    WrongPan,
    BadBody,
}

impl Mhr {
    pub fn new(dest: u16, src: u16, seq: u8) -> Self {
        Self {
            frame_ctrl: FRAME_CTRL_DATA,
            seq,
            pan_id: PAN_ID,
            dest,
            src,
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.frame_ctrl.to_le_bytes());
        out[2] = self.seq;
        out[3..5].copy_from_slice(&self.pan_id.to_le_bytes());
        out[5..7].copy_from_slice(&self.dest.to_le_bytes());
        out[7..9].copy_from_slice(&self.src.to_le_bytes());
    }

    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < MHR_LEN {
            return Err(FrameError::TooShort);
        }
        let mhr = Self {
            frame_ctrl: u16::from_le_bytes([raw[0], raw[1]]),
            seq: raw[2],
            pan_id: u16::from_le_bytes([raw[3], raw[4]]),
            dest: u16::from_le_bytes([raw[5], raw[6]]),
            src: u16::from_le_bytes([raw[7], raw[8]]),
        };
        if mhr.pan_id != PAN_ID {
            return Err(FrameError::WrongPan);
        }
        Ok(mhr)
    }
}

/// A received frame after CRC check, with its raw 40-bit receive timestamp.
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub mhr: Mhr,
    pub payload: Vec<u8, MAX_PAYLOAD>,
    pub rx_ts: u64,
}

impl RxFrame {
    pub fn parse(raw: &[u8], rx_ts: u64) -> Result<Self, FrameError> {
        let mhr = Mhr::decode(raw)?;
        if raw.len() < MHR_LEN + 2 {
            return Err(FrameError::TooShort);
        }
        let payload =
            Vec::from_slice(&raw[MHR_LEN..]).map_err(|_| FrameError::TooLong)?;
        Ok(Self {
            mhr,
            payload,
            rx_ts,
        })
    }

    pub fn msg_type(&self) -> MsgType {
        MsgType::from(self.payload[OFF_TYPE])
    }

    /// Raw `(ack << 4) | seq` byte as sent by the peer.
    pub fn seq_ack(&self) -> u8 {
        self.payload[OFF_SEQ_ACK]
    }

    /// Sequence nibble of this frame.
    pub fn seq(&self) -> u8 {
        self.payload[OFF_SEQ_ACK] & 0x0F
    }

    /// Ack nibble: the last of our sequences the peer has seen.
    pub fn ack(&self) -> u8 {
        self.payload[OFF_SEQ_ACK] >> 4
    }

    pub fn body(&self) -> &[u8] {
        &self.payload[OFF_BODY..]
    }
}

/// Assemble a full frame into a fresh buffer.
pub fn encode_frame(
    mhr: &Mhr,
    msg_type: MsgType,
    seq_ack: u8,
    body: &[u8],
) -> Result<Vec<u8, MAX_FRAME_LEN>, FrameError> {
    let mut buf: Vec<u8, MAX_FRAME_LEN> = Vec::new();
    buf.resize(MHR_LEN, 0).map_err(|_| FrameError::TooLong)?;
    mhr.encode(&mut buf[..MHR_LEN]);
    buf.push(msg_type as u8).map_err(|_| FrameError::TooLong)?;
    buf.push(seq_ack).map_err(|_| FrameError::TooLong)?;
    buf.extend_from_slice(body).map_err(|_| FrameError::TooLong)?;
    Ok(buf)
}

/// Write a 40-bit device timestamp, little endian.
pub fn encode_ts40(out: &mut [u8], ts: u64) {
    let b = ts.to_le_bytes();
    out[..5].copy_from_slice(&b[..5]);
}

/// Read a 40-bit device timestamp, little endian.
pub fn decode_ts40(raw: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b[..5].copy_from_slice(&raw[..5]);
    u64::from_le_bytes(b)
}
