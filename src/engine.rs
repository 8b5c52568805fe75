//! Connection and ranging engine.
//!
//! Two overlapping state machines share the peer table: the per-peer
//! connection lifecycle (discovery broadcast, SYN/SYN-ACK/ACK handshake,
//! keepalive maintenance) and the process-wide six-message TWR exchange.
//! The engine consumes completed radio exchanges from the controller and
//! stages at most one outbound frame at a time; the supervisor asks it for
//! the next action whenever the radio goes idle.

use crate::config::{
    Calibration, Instant, CONN_MSG_TMO, CONN_MSG_TMO_MAX, MAX_DIST, MIN_DIST,
    MIN_D_MEASURES, NEIGHBOUR_NUM, TWR_INIT_DELAY, TWR_INTERVAL, TWR_RESP_DELAY,
    W4R_RECV_TMO_US,
};
use crate::edm::{Edm, EDM_SNAPSHOT_LEN};
use crate::mac::{
    decode_ts40, encode_frame, encode_ts40, Mhr, MsgType, RxFrame, BROADCAST_ADDR,
    MAX_FRAME_LEN,
};
use crate::peers::{ConnState, LastFrame, PeerId, PeerTable, PeerTimeout};
use crate::radio::{DwOutcome, DwRequest};
use heapless::{Deque, Vec};

/// 40-bit device time arithmetic.
const TIME40_MASK: u64 = 0xFF_FFFF_FFFF;

fn time40_add(a: u64, b: u64) -> u64 {
    a.wrapping_add(b) & TIME40_MASK
}

fn time40_sub(a: u64, b: u64) -> u64 {
    a.wrapping_sub(b) & TIME40_MASK
}

/// Progress of the process-wide TWR exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TwrState {
    ReqSent,
    ReqRecvd,
    ReqAckRecvd,
    InitRecvd,
    RespRecvd,
    NoTwr,
    Fail,
}

/// What the engine decided to do when asked while idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LocAction {
    /// A fresh command was staged and a response is expected.
    Resp,
    /// A keepalive was staged; the peer has until its TTL runs out.
    RespBeforeTmo,
    /// The last frame to a peer is being retransmitted verbatim.
    RespNow,
    /// Something was staged that expects no reply (broadcast, disconnect).
    NoResp,
    /// Inconsistent engine state; the caller should reset the radio.
    ActErr,
    /// Nothing to do; keep listening.
    Stop,
}

/// Metadata travelling with a staged frame.
#[derive(Debug, Clone, Copy)]
pub struct SendMeta {
    /// Non-zero: wait-for-response send with this hardware receive timeout.
    pub w4r_timeout_us: u32,
    /// Non-zero: scheduled send at this device time.
    pub dly_time: u64,
    pub msg_type: MsgType,
    pub addr: u16,
}

/// A frame staged for transmission.
#[derive(Debug, Clone)]
pub struct Staged {
    pub buf: Vec<u8, MAX_FRAME_LEN>,
    pub meta: SendMeta,
}

enum StageMode {
    Plain,
    W4R,
    Dly(u64),
}

pub struct CommsEngine {
    own_addr: u16,
    mac_seq: u8,
    peers: PeerTable,
    edm: Edm,
    calib: Calibration,

    twr_state: TwrState,
    twr_peer: Option<PeerId>,
    twr_fail_cnt: u8,

    messages_since_broad: u8,
    recv_tmo_cnt: u8,

    // Exchange timestamps, raw 40-bit device time.
    t_req_tx: u64,
    t_req_rx: u64,
    t_init_tx: u64,
    t_init_rx: u64,
    t_resp_tx: u64,
    t_resp_rx: u64,

    staged: Option<Staged>,
    pending_req: Option<DwRequest>,
    in_flight: Option<SendMeta>,
    /// Peer whose reply the last wait-for-response send is waiting on.
    await_resp_from: Option<PeerId>,
}

impl CommsEngine {
    pub fn new(own_addr: u16, calib: Calibration) -> Self {
        Self {
            own_addr,
            mac_seq: 0,
            peers: PeerTable::new(),
            edm: Edm::new(own_addr),
            calib,
            twr_state: TwrState::NoTwr,
            twr_peer: None,
            twr_fail_cnt: 0,
            // First broadcast is due immediately.
            messages_since_broad: CONN_MSG_TMO,
            recv_tmo_cnt: 0,
            t_req_tx: 0,
            t_req_rx: 0,
            t_init_tx: 0,
            t_init_rx: 0,
            t_resp_tx: 0,
            t_resp_rx: 0,
            staged: None,
            pending_req: None,
            in_flight: None,
            await_resp_from: None,
        }
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn edm(&self) -> &Edm {
        &self.edm
    }

    pub fn twr_state(&self) -> TwrState {
        self.twr_state
    }

    pub fn twr_peer(&self) -> Option<PeerId> {
        self.twr_peer
    }

    pub fn twr_fail_cnt(&self) -> u8 {
        self.twr_fail_cnt
    }

    /// Receive timeouts observed since the last completed exchange.
    pub fn recv_tmo_cnt(&self) -> u8 {
        self.recv_tmo_cnt
    }

    /// Drive the peer inactivity timers.
    pub fn tick(&mut self, now: Instant) {
        let mut verdicts: Deque<PeerTimeout, { 2 * NEIGHBOUR_NUM }> = Deque::new();
        self.peers.tick(now, |v| {
            let _ = verdicts.push_back(v);
        });
        while let Some(v) = verdicts.pop_front() {
            match v {
                PeerTimeout::Keepalive(id) => {
                    debug!("peer slot {} owes a keepalive", id.index());
                    // Picked up by the next idle action.
                }
                PeerTimeout::Expired(id) => {
                    info!("peer slot {} timed out", id.index());
                    if self.staged.is_none() && self.peers.peer(id).connected() {
                        self.stage(Some(id), MsgType::Disconn, &[], StageMode::Plain);
                    }
                    self.remove_peer(id);
                }
            }
        }
    }

    /// Hand the engine a completed radio operation.
    pub fn handle_outcome(&mut self, out: DwOutcome, now: Instant) {
        match out {
            DwOutcome::Recvd(frame) => self.process_message(frame, now),
            DwOutcome::SendDone { tx_ts } => self.on_send_done(tx_ts),
            DwOutcome::RecvTmo => self.on_recv_timeout(),
            DwOutcome::SchedMiss => {
                // The scheduled leg of the exchange is unsalvageable; the
                // controller is parked in Err until we ask for a reset.
                self.handle_twr_fail();
                self.pending_req = Some(DwRequest::Reset);
            }
            DwOutcome::ResetDone => {
                // Transparent to the protocol; the supervisor counts it.
            }
        }
    }

    /// Take the next request for the radio controller, if any.
    pub fn take_request(&mut self) -> Option<(DwRequest, Option<Staged>)> {
        if let Some(staged) = self.staged.take() {
            let req = if staged.meta.dly_time > 0 {
                DwRequest::SendDly {
                    tx_time: staged.meta.dly_time,
                }
            } else if staged.meta.w4r_timeout_us > 0 {
                DwRequest::SendW4R {
                    timeout_us: staged.meta.w4r_timeout_us,
                }
            } else {
                DwRequest::Send
            };
            self.in_flight = Some(staged.meta);
            return Some((req, Some(staged)));
        }
        self.pending_req.take().map(|req| (req, None))
    }

    /// Decide what to do with an idle radio.
    pub fn next_action(&mut self, now: Instant) -> LocAction {
        if self.staged.is_some() || self.pending_req.is_some() {
            return LocAction::ActErr;
        }

        // Someone is owed a retransmission first.
        if let Some(id) = self
            .peers
            .ids()
            .find(|&id| self.peers.peer(id).retransmit_due)
        {
            self.peers.peer_mut(id).retransmit_due = false;
            if self.stage_retransmit(id) {
                return LocAction::RespNow;
            }
        }

        // Discovery, while there is room and the interval elapsed.
        if (self.peers.connected_count() as usize) < NEIGHBOUR_NUM
            && self.messages_since_broad >= CONN_MSG_TMO
            && self.twr_peer.is_none()
        {
            self.messages_since_broad = 0;
            self.stage(None, MsgType::Broadcast, &[], StageMode::Plain);
            return LocAction::NoResp;
        }

        // Ranging, one exchange at a time, paced per peer.
        if self.twr_state == TwrState::NoTwr {
            if let Some(id) = self.peers.ids().find(|&id| {
                let peer = self.peers.peer(id);
                peer.connected()
                    && self.peers.info(id).d_measures < MIN_D_MEASURES
                    && peer.last_range.map_or(true, |t| {
                        now.checked_duration_since(t)
                            .map_or(false, |d| d >= TWR_INTERVAL)
                    })
            }) {
                self.start_twr(id, now);
                return LocAction::Resp;
            }
        }

        // Maintenance pass.
        if let Some(id) = self
            .peers
            .ids()
            .find(|&id| self.peers.peer(id).connected() && self.peers.peer(id).keepalive_due)
        {
            self.peers.peer_mut(id).keepalive_due = false;
            self.stage(Some(id), MsgType::MConn, &[], StageMode::W4R);
            return LocAction::RespBeforeTmo;
        }

        LocAction::Stop
    }

    fn on_send_done(&mut self, tx_ts: u64) {
        self.messages_since_broad = self.messages_since_broad.saturating_add(1);
        let Some(meta) = self.in_flight.take() else {
            return;
        };
        match meta.msg_type {
            MsgType::DReq => self.t_req_tx = tx_ts,
            MsgType::DInit => self.t_init_tx = tx_ts,
            MsgType::DResp => self.t_resp_tx = tx_ts,
            _ => {}
        }
        if meta.w4r_timeout_us > 0 {
            self.await_resp_from = self.peers.get_peer(meta.addr);
        } else if self.twr_peer.is_some() {
            // A scheduled send inside an open exchange: the counterpart's
            // next message is due, listen for it with a bound. Outside an
            // exchange the idle policy decides what comes next.
            self.pending_req = Some(DwRequest::RecvTmo {
                timeout_us: W4R_RECV_TMO_US,
            });
        }
    }

    fn on_recv_timeout(&mut self) {
        self.recv_tmo_cnt = self.recv_tmo_cnt.saturating_add(1);
        if self.twr_peer.is_some() {
            warn!("receive timeout inside a ranging exchange");
            self.handle_twr_fail();
            return;
        }
        if let Some(id) = self.await_resp_from.take() {
            if self.peers.peer(id).in_use() && self.peers.peer(id).last_frame.is_some() {
                self.peers.peer_mut(id).retransmit_due = true;
            }
        }
    }

    fn process_message(&mut self, frame: RxFrame, now: Instant) {
        if frame.mhr.dest != self.own_addr && frame.mhr.dest != BROADCAST_ADDR {
            return;
        }
        if frame.mhr.src == self.own_addr {
            return;
        }
        self.recv_tmo_cnt = 0;
        self.messages_since_broad = self.messages_since_broad.saturating_add(1);
        let msg_type = frame.msg_type();

        let Some(id) = self.peers.get_peer(frame.mhr.src) else {
            self.handle_unknown(&frame, msg_type, now);
            return;
        };

        self.peers.refresh(id, now);
        if self.await_resp_from == Some(id) {
            self.await_resp_from = None;
        }

        if self.peers.peer(id).connected() {
            // Numbered traffic: anything out of sequence gets the cached
            // frame again, byte for byte, and changes nothing else.
            let seq = frame.seq();
            if seq != self.peers.peer(id).expected_seq() {
                debug!("duplicate seq from peer slot {}", id.index());
                self.stage_retransmit(id);
                return;
            }
            self.peers.peer_mut(id).record_rx_seq(seq);
            self.peers.peer_mut(id).conn_state = ConnState::Recv;
        }

        match msg_type {
            MsgType::DReq
            | MsgType::DReqAck
            | MsgType::DInit
            | MsgType::DResp
            | MsgType::DRes
            | MsgType::DResAck
            | MsgType::DFail => self.twr_handle(id, &frame, msg_type),
            _ => self.conn_handle(id, &frame, msg_type),
        }
    }

    fn handle_unknown(&mut self, frame: &RxFrame, msg_type: MsgType, now: Instant) {
        match msg_type {
            MsgType::Broadcast => {
                if self.twr_peer.is_some() {
                    return;
                }
                let Some(id) = self.peers.create_new_peer(frame.mhr.src, now) else {
                    return;
                };
                self.peers.peer_mut(id).conn_state = ConnState::SynSend;
                self.stage(Some(id), MsgType::Syn, &[], StageMode::W4R);
            }
            MsgType::Syn => {
                // No slot free: ignore, the sender will give up on its own.
                let Some(id) = self.peers.create_new_peer(frame.mhr.src, now) else {
                    return;
                };
                self.peers.peer_mut(id).conn_state = ConnState::SynRecv;
                self.stage(Some(id), MsgType::SynAck, &[], StageMode::W4R);
                self.peers.peer_mut(id).conn_state = ConnState::SynAckSend;
            }
            _ => {
                trace!("ignoring message from unknown address");
            }
        }
    }

    fn conn_handle(&mut self, id: PeerId, _frame: &RxFrame, msg_type: MsgType) {
        let state = self.peers.peer(id).conn_state;
        match (msg_type, state) {
            // Our SYN-ACK was lost; the peer asked again.
            (MsgType::Syn, ConnState::SynAckSend) => {
                self.stage_retransmit(id);
            }
            (MsgType::SynAck, ConnState::SynSend) => {
                self.peers.peer_mut(id).conn_state = ConnState::SynAckRecv;
                self.stage(Some(id), MsgType::Ack, &[], StageMode::Plain);
                self.peers.connect_peer(id);
                info!("peer connected");
            }
            (MsgType::Ack, ConnState::SynAckSend) => {
                self.peers.connect_peer(id);
                info!("peer connected");
            }
            (MsgType::Ack, _) => {
                // Keepalive or teardown confirmation; TTL refresh was enough.
                self.peers.peer_mut(id).conn_state = ConnState::Mnt;
            }
            (MsgType::MConn, _) => {
                self.stage(Some(id), MsgType::Ack, &[], StageMode::Plain);
            }
            (MsgType::Disconn, _) => {
                self.remove_peer(id);
            }
            (MsgType::Broadcast, _) => {
                // Already talking to this address; nothing to answer.
            }
            _ => {
                trace!("dropping unexpected connection message");
            }
        }
    }

    fn twr_handle(&mut self, id: PeerId, frame: &RxFrame, msg_type: MsgType) {
        if !self.peers.peer(id).connected() {
            return;
        }
        match msg_type {
            MsgType::DReq => {
                if self.twr_peer.is_some() && self.twr_peer != Some(id) {
                    // Busy with another exchange: reject deterministically.
                    self.stage(Some(id), MsgType::DFail, &[], StageMode::Plain);
                    return;
                }
                if self.edm.merge_snapshot(frame.body()).is_err() {
                    warn!("malformed ranging request body");
                    return;
                }
                self.twr_peer = Some(id);
                self.twr_state = TwrState::ReqRecvd;
                self.t_req_rx = frame.rx_ts;
                let mut body = [0u8; 5];
                encode_ts40(&mut body, self.t_req_rx);
                self.stage(Some(id), MsgType::DReqAck, &body, StageMode::W4R);
            }
            MsgType::DReqAck => {
                if self.twr_state != TwrState::ReqSent || self.twr_peer != Some(id) {
                    self.handle_twr_fail();
                    return;
                }
                self.t_req_rx = decode_ts40(frame.body());
                let dly = time40_add(frame.rx_ts, TWR_INIT_DELAY);
                let predicted = time40_add(dly, self.calib.tx_ant_delay as u64);
                let mut body = [0u8; 5];
                encode_ts40(&mut body, predicted);
                self.twr_state = TwrState::ReqAckRecvd;
                self.stage(Some(id), MsgType::DInit, &body, StageMode::Dly(dly));
            }
            MsgType::DInit => {
                // Fast path: the reply must hit its scheduled slot, so it is
                // staged straight from here.
                if self.twr_state != TwrState::ReqRecvd || self.twr_peer != Some(id) {
                    self.handle_twr_fail();
                    return;
                }
                self.t_init_rx = frame.rx_ts;
                let dly = time40_add(self.t_init_rx, TWR_RESP_DELAY);
                self.t_resp_tx = time40_add(dly, self.calib.tx_ant_delay as u64);
                let mut body = [0u8; 10];
                encode_ts40(&mut body[..5], self.t_init_rx);
                encode_ts40(&mut body[5..], self.t_resp_tx);
                self.twr_state = TwrState::InitRecvd;
                self.stage(Some(id), MsgType::DResp, &body, StageMode::Dly(dly));
            }
            MsgType::DResp => {
                if self.twr_state != TwrState::ReqAckRecvd || self.twr_peer != Some(id) {
                    self.handle_twr_fail();
                    return;
                }
                let body = frame.body();
                if body.len() < 10 {
                    self.handle_twr_fail();
                    return;
                }
                self.t_init_rx = decode_ts40(&body[..5]);
                self.t_resp_tx = decode_ts40(&body[5..]);
                self.t_resp_rx = frame.rx_ts;
                self.twr_state = TwrState::RespRecvd;
                let dist = self.compute_distance();
                debug!("measured distance to peer slot {}", id.index());
                self.update_peer_distance(id, dist);
                self.stage(Some(id), MsgType::DRes, &dist.to_le_bytes(), StageMode::W4R);
            }
            MsgType::DRes => {
                if self.twr_state != TwrState::InitRecvd || self.twr_peer != Some(id) {
                    self.handle_twr_fail();
                    return;
                }
                let body = frame.body();
                if body.len() < 4 {
                    self.handle_twr_fail();
                    return;
                }
                let dist = f32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                self.peers.info_mut(id).recvd_distance = dist;
                self.update_peer_distance(id, dist);
                let reciprocal = self.peers.info(id).calc_distance;
                self.stage(
                    Some(id),
                    MsgType::DResAck,
                    &reciprocal.to_le_bytes(),
                    StageMode::Plain,
                );
                self.finish_twr(id);
            }
            MsgType::DResAck => {
                if self.twr_state != TwrState::RespRecvd || self.twr_peer != Some(id) {
                    self.handle_twr_fail();
                    return;
                }
                let body = frame.body();
                if body.len() >= 4 {
                    self.peers.info_mut(id).recvd_distance =
                        f32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                }
                self.finish_twr(id);
            }
            MsgType::DFail => {
                // The peer bailed out (busy or aborted); stand down.
                if self.twr_peer == Some(id) {
                    self.handle_twr_fail();
                }
            }
            _ => unreachable!(),
        }
    }

    /// Kick off an exchange as initiator.
    fn start_twr(&mut self, id: PeerId, now: Instant) {
        let mut body = [0u8; EDM_SNAPSHOT_LEN];
        self.edm.encode_snapshot(&mut body);
        self.twr_peer = Some(id);
        self.twr_state = TwrState::ReqSent;
        self.peers.peer_mut(id).last_range = Some(now);
        self.stage(Some(id), MsgType::DReq, &body, StageMode::W4R);
    }

    /// Roll a failed exchange back to maintenance on both records.
    pub fn handle_twr_fail(&mut self) {
        self.twr_state = TwrState::Fail;
        self.twr_fail_cnt = self.twr_fail_cnt.saturating_add(1);
        if let Some(id) = self.twr_peer.take() {
            if self.peers.peer(id).connected() {
                self.peers.peer_mut(id).conn_state = ConnState::Mnt;
            }
            if self.twr_fail_cnt > CONN_MSG_TMO_MAX {
                warn!("too many ranging failures, dropping peer");
                self.remove_peer(id);
                self.twr_fail_cnt = 0;
            }
        }
        self.twr_state = TwrState::NoTwr;
        self.staged = None;
        self.in_flight = None;
    }

    fn finish_twr(&mut self, id: PeerId) {
        self.twr_state = TwrState::NoTwr;
        self.twr_peer = None;
        self.twr_fail_cnt = 0;
        if self.peers.peer(id).connected() {
            self.peers.peer_mut(id).conn_state = ConnState::Mnt;
        }
    }

    /// Asymmetric double-sided TWR over the captured timestamps.
    fn compute_distance(&self) -> f32 {
        let ra = time40_sub(self.t_resp_rx, self.t_init_tx) as f64;
        let da = time40_sub(self.t_resp_tx, self.t_init_rx) as f64;
        let rb = time40_sub(self.t_init_rx, self.t_req_rx) as f64;
        let db = time40_sub(self.t_init_tx, self.t_req_tx) as f64;
        let denom = ra + rb + da + db;
        if denom == 0.0 {
            return MIN_DIST;
        }
        let tof_ticks = (ra * rb - da * db) / denom;
        let corrected = tof_ticks - self.calib.ant_delay_sum() as f64;
        (corrected as f32 * self.calib.tick_to_metre).clamp(MIN_DIST, MAX_DIST)
    }

    /// Fold a sample into the peer's running mean and publish it to the EDM
    /// once enough samples back it.
    fn update_peer_distance(&mut self, id: PeerId, dist: f32) {
        let addr = self.peers.peer(id).addr;
        if let Some(mean) = self.peers.info_mut(id).update_distance(dist) {
            self.edm.set_distance(self.own_addr, addr, mean);
        }
    }

    fn remove_peer(&mut self, id: PeerId) {
        let addr = self.peers.peer(id).addr;
        if self.twr_peer == Some(id) {
            self.twr_peer = None;
            self.twr_state = TwrState::NoTwr;
        }
        if self.await_resp_from == Some(id) {
            self.await_resp_from = None;
        }
        self.edm.clear_addr(addr);
        self.peers.disconnect_peer(id);
    }

    /// Build and stage a fresh frame. Connected peers get numbered traffic;
    /// handshake frames and broadcasts carry a zero seq/ack byte.
    fn stage(&mut self, peer: Option<PeerId>, msg_type: MsgType, body: &[u8], mode: StageMode) {
        if self.staged.is_some() {
            warn!("overwriting a staged frame");
        }
        let (dest, seq_ack) = match peer {
            Some(id) => {
                let p = self.peers.peer_mut(id);
                let seq_ack = if p.connected() {
                    (p.last_acked() << 4) | p.next_seq()
                } else {
                    0
                };
                (p.addr, seq_ack)
            }
            None => (BROADCAST_ADDR, 0),
        };
        self.mac_seq = self.mac_seq.wrapping_add(1);
        let mhr = Mhr::new(dest, self.own_addr, self.mac_seq);
        let Ok(buf) = encode_frame(&mhr, msg_type, seq_ack, body) else {
            error!("frame too large to stage");
            return;
        };
        let (w4r_timeout_us, dly_time) = match mode {
            StageMode::Plain => (0, 0),
            StageMode::W4R => (W4R_RECV_TMO_US, 0),
            StageMode::Dly(t) => (0, t),
        };
        if let Some(id) = peer {
            let p = self.peers.peer_mut(id);
            p.last_frame = Some(LastFrame {
                buf: buf.clone(),
                msg_type,
                w4r: w4r_timeout_us > 0,
            });
            if !msg_type.is_ack() {
                p.last_cmd_type = msg_type;
            }
            if p.connected() {
                p.conn_state = if w4r_timeout_us > 0 {
                    ConnState::Send
                } else {
                    ConnState::SendAck
                };
            }
        }
        self.staged = Some(Staged {
            buf,
            meta: SendMeta {
                w4r_timeout_us,
                dly_time,
                msg_type,
                addr: dest,
            },
        });
    }

    /// Re-emit the cached frame byte for byte. No counters move.
    fn stage_retransmit(&mut self, id: PeerId) -> bool {
        let Some(last) = self.peers.peer(id).last_frame.clone() else {
            return false;
        };
        let addr = self.peers.peer(id).addr;
        self.staged = Some(Staged {
            meta: SendMeta {
                w4r_timeout_us: if last.w4r { W4R_RECV_TMO_US } else { 0 },
                dly_time: 0,
                msg_type: last.msg_type,
                addr,
            },
            buf: last.buf,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PEER_CONN_TTL, PEER_TIMER_PERIOD};

    fn t(ms: u64) -> Instant {
        Instant::from_ticks(ms)
    }

    fn zero_delay_calib() -> Calibration {
        Calibration {
            tx_ant_delay: 0,
            rx_ant_delay: 0,
            ..Calibration::default()
        }
    }

    fn frame_from(src: u16, dest: u16, msg_type: MsgType, seq_ack: u8, body: &[u8], rx_ts: u64) -> RxFrame {
        let raw = encode_frame(&Mhr::new(dest, src, 1), msg_type, seq_ack, body).unwrap();
        RxFrame::parse(&raw, rx_ts).unwrap()
    }

    fn deliver(engine: &mut CommsEngine, frame: RxFrame, now: Instant) {
        engine.handle_outcome(DwOutcome::Recvd(frame), now);
    }

    /// Walk the handshake from the broadcast-hearing side.
    fn connect_peer(engine: &mut CommsEngine, peer_addr: u16, now: Instant) {
        let own = engine.edm().own_addr();
        deliver(
            engine,
            frame_from(peer_addr, BROADCAST_ADDR, MsgType::Broadcast, 0, &[], 0),
            now,
        );
        let (_, staged) = engine.take_request().unwrap();
        assert_eq!(staged.unwrap().meta.msg_type, MsgType::Syn);
        engine.handle_outcome(DwOutcome::SendDone { tx_ts: 0 }, now);
        deliver(engine, frame_from(peer_addr, own, MsgType::SynAck, 0, &[], 0), now);
        let (_, staged) = engine.take_request().unwrap();
        assert_eq!(staged.unwrap().meta.msg_type, MsgType::Ack);
        engine.handle_outcome(DwOutcome::SendDone { tx_ts: 0 }, now);
        engine.take_request();
    }

    /// Discovery outranks ranging in the idle policy; eat the pending
    /// broadcast so the next action is the one under test.
    fn drain_broadcast(engine: &mut CommsEngine, now: Instant) {
        assert_eq!(engine.next_action(now), LocAction::NoResp);
        engine.take_request();
        engine.handle_outcome(DwOutcome::SendDone { tx_ts: 0 }, now);
        engine.take_request();
    }

    #[test]
    fn broadcast_triggers_the_full_handshake() {
        let mut engine = CommsEngine::new(0x0001, zero_delay_calib());
        connect_peer(&mut engine, 0x0002, t(0));
        let id = engine.peers().get_peer(0x0002).unwrap();
        assert!(engine.peers().peer(id).connected());
        assert_eq!(engine.peers().connected_count(), 1);
        assert_eq!(engine.peers().peer(id).seq_ack, 0x00);
    }

    #[test]
    fn capacity_exhausted_ignores_new_syn() {
        let mut engine = CommsEngine::new(0x0001, zero_delay_calib());
        connect_peer(&mut engine, 0x0002, t(0));
        connect_peer(&mut engine, 0x0003, t(0));
        deliver(&mut engine, frame_from(0x0004, 0x0001, MsgType::Syn, 0, &[], 0), t(1));
        assert!(engine.take_request().is_none());
        assert_eq!(engine.peers().used(), 2);
    }

    #[test]
    fn duplicate_sequence_resends_the_cached_frame_verbatim() {
        let mut engine = CommsEngine::new(0x0001, zero_delay_calib());
        connect_peer(&mut engine, 0x0002, t(0));

        // In-order keepalive from the peer: seq 1 expected.
        deliver(
            &mut engine,
            frame_from(0x0002, 0x0001, MsgType::MConn, 0x01, &[], 0),
            t(1),
        );
        let (_, staged) = engine.take_request().unwrap();
        let ack1 = staged.unwrap();
        assert_eq!(ack1.meta.msg_type, MsgType::Ack);
        engine.handle_outcome(DwOutcome::SendDone { tx_ts: 0 }, t(1));
        engine.take_request();

        // The exact same frame again: stale seq, cached bytes come back and
        // nothing else moves.
        let before = engine.peers().peer(engine.peers().get_peer(0x0002).unwrap()).seq_ack;
        deliver(
            &mut engine,
            frame_from(0x0002, 0x0001, MsgType::MConn, 0x01, &[], 0),
            t(2),
        );
        let (_, staged) = engine.take_request().unwrap();
        let resent = staged.unwrap();
        assert_eq!(resent.buf, ack1.buf);
        let after = engine.peers().peer(engine.peers().get_peer(0x0002).unwrap()).seq_ack;
        assert_eq!(before, after);
    }

    #[test]
    fn initiator_runs_the_six_message_exchange() {
        let mut engine = CommsEngine::new(0x0001, zero_delay_calib());
        connect_peer(&mut engine, 0x0002, t(0));
        drain_broadcast(&mut engine, t(0));

        // Idle: ranging is due (no samples yet).
        assert_eq!(engine.next_action(t(1)), LocAction::Resp);
        let (req, staged) = engine.take_request().unwrap();
        assert!(matches!(req, DwRequest::SendW4R { .. }));
        assert_eq!(staged.unwrap().meta.msg_type, MsgType::DReq);
        assert_eq!(engine.twr_state(), TwrState::ReqSent);
        engine.handle_outcome(DwOutcome::SendDone { tx_ts: 0 }, t(1));

        // DReqAck carries the responder's receive timestamp.
        let mut ts = [0u8; 5];
        encode_ts40(&mut ts, 2000);
        deliver(&mut engine, frame_from(0x0002, 0x0001, MsgType::DReqAck, 0x01, &ts, 500), t(2));
        let (req, staged) = engine.take_request().unwrap();
        assert!(matches!(req, DwRequest::SendDly { .. }));
        assert_eq!(staged.unwrap().meta.msg_type, MsgType::DInit);
        engine.handle_outcome(DwOutcome::SendDone { tx_ts: 10_000 }, t(2));
        // Scheduled send over: listening for the response, bounded.
        let (req, _) = engine.take_request().unwrap();
        assert!(matches!(req, DwRequest::RecvTmo { .. }));

        // DResp carries (t_init_rx, t_resp_tx); our capture is its rx_ts.
        let mut body = [0u8; 10];
        encode_ts40(&mut body[..5], 12_000);
        encode_ts40(&mut body[5..], 22_000);
        deliver(&mut engine, frame_from(0x0002, 0x0001, MsgType::DResp, 0x02, &body, 24_000), t(3));
        assert_eq!(engine.twr_state(), TwrState::RespRecvd);
        let (_, staged) = engine.take_request().unwrap();
        let dres = staged.unwrap();
        assert_eq!(dres.meta.msg_type, MsgType::DRes);
        engine.handle_outcome(DwOutcome::SendDone { tx_ts: 30_000 }, t(3));

        // The distance matches the asymmetric formula: Ra=14000, Rb=10000,
        // Da=10000, Db=10000 -> 40e6/44e3 ticks of flight.
        let expected = (40_000_000.0_f64 / 44_000.0) as f32
            * zero_delay_calib().tick_to_metre;
        let got = f32::from_le_bytes(dres.buf[dres.buf.len() - 4..].try_into().unwrap());
        assert!((got - expected).abs() < 0.5, "got {} expected {}", got, expected);

        // DResAck closes the exchange.
        let d = 4.3_f32;
        deliver(
            &mut engine,
            frame_from(0x0002, 0x0001, MsgType::DResAck, 0x03, &d.to_le_bytes(), 0),
            t(4),
        );
        assert_eq!(engine.twr_state(), TwrState::NoTwr);
        assert_eq!(engine.twr_peer(), None);
        let id = engine.peers().get_peer(0x0002).unwrap();
        assert_eq!(engine.peers().info(id).d_measures, 1);
        assert_eq!(engine.peers().info(id).recvd_distance, d);
    }

    #[test]
    fn responder_walks_req_init_res() {
        let mut engine = CommsEngine::new(0x0002, zero_delay_calib());
        connect_peer(&mut engine, 0x0001, t(0));

        let mut snapshot = [0u8; EDM_SNAPSHOT_LEN];
        Edm::new(0x0001).encode_snapshot(&mut snapshot);
        deliver(
            &mut engine,
            frame_from(0x0001, 0x0002, MsgType::DReq, 0x01, &snapshot, 2000),
            t(1),
        );
        assert_eq!(engine.twr_state(), TwrState::ReqRecvd);
        let (_, staged) = engine.take_request().unwrap();
        let reqack = staged.unwrap();
        assert_eq!(reqack.meta.msg_type, MsgType::DReqAck);
        assert_eq!(decode_ts40(&reqack.buf[reqack.buf.len() - 5..]), 2000);
        engine.handle_outcome(DwOutcome::SendDone { tx_ts: 3000 }, t(1));

        // DInit triggers the scheduled response at a fixed turnaround.
        deliver(&mut engine, frame_from(0x0001, 0x0002, MsgType::DInit, 0x02, &[0; 5], 12_000), t(2));
        assert_eq!(engine.twr_state(), TwrState::InitRecvd);
        let (req, staged) = engine.take_request().unwrap();
        let dresp = staged.unwrap();
        assert_eq!(dresp.meta.msg_type, MsgType::DResp);
        match req {
            DwRequest::SendDly { tx_time } => {
                assert_eq!(tx_time, time40_add(12_000, TWR_RESP_DELAY));
            }
            other => panic!("expected a scheduled send, got {:?}", other),
        }
        engine.handle_outcome(DwOutcome::SendDone { tx_ts: 0 }, t(2));
        engine.take_request();

        // DRes ends it; the reciprocal ack goes back plain.
        let d = 4.5_f32;
        deliver(
            &mut engine,
            frame_from(0x0001, 0x0002, MsgType::DRes, 0x03, &d.to_le_bytes(), 0),
            t(3),
        );
        assert_eq!(engine.twr_state(), TwrState::NoTwr);
        let (_, staged) = engine.take_request().unwrap();
        assert_eq!(staged.unwrap().meta.msg_type, MsgType::DResAck);
        let id = engine.peers().get_peer(0x0001).unwrap();
        assert_eq!(engine.peers().info(id).recvd_distance, d);
        assert_eq!(engine.peers().info(id).d_measures, 1);
    }

    #[test]
    fn dropped_resp_rolls_back_to_maintenance_without_an_edm_update() {
        let mut engine = CommsEngine::new(0x0001, zero_delay_calib());
        connect_peer(&mut engine, 0x0002, t(0));
        drain_broadcast(&mut engine, t(0));

        assert_eq!(engine.next_action(t(1)), LocAction::Resp);
        engine.take_request();
        engine.handle_outcome(DwOutcome::SendDone { tx_ts: 0 }, t(1));
        let mut ts = [0u8; 5];
        encode_ts40(&mut ts, 2000);
        deliver(&mut engine, frame_from(0x0002, 0x0001, MsgType::DReqAck, 0x01, &ts, 500), t(2));
        engine.take_request();
        engine.handle_outcome(DwOutcome::SendDone { tx_ts: 10_000 }, t(2));
        engine.take_request();

        // DResp never arrives.
        engine.handle_outcome(DwOutcome::RecvTmo, t(3));
        assert_eq!(engine.twr_fail_cnt(), 1);
        assert_eq!(engine.twr_state(), TwrState::NoTwr);
        assert_eq!(engine.twr_peer(), None);
        let id = engine.peers().get_peer(0x0002).unwrap();
        assert!(engine.peers().peer(id).connected());
        assert_eq!(engine.peers().peer(id).conn_state, ConnState::Mnt);
        assert_eq!(
            engine.edm().get_distance(0x0001, 0x0002),
            crate::config::DIST_UNKNOWN
        );
    }

    #[test]
    fn at_most_one_exchange_late_requests_get_dfail() {
        let mut engine = CommsEngine::new(0x0001, zero_delay_calib());
        connect_peer(&mut engine, 0x0002, t(0));
        connect_peer(&mut engine, 0x0003, t(0));

        let mut snapshot = [0u8; EDM_SNAPSHOT_LEN];
        Edm::new(0x0002).encode_snapshot(&mut snapshot);
        deliver(&mut engine, frame_from(0x0002, 0x0001, MsgType::DReq, 0x01, &snapshot, 100), t(1));
        engine.take_request();
        let first_peer = engine.twr_peer();
        assert!(first_peer.is_some());

        let mut snapshot2 = [0u8; EDM_SNAPSHOT_LEN];
        Edm::new(0x0003).encode_snapshot(&mut snapshot2);
        deliver(&mut engine, frame_from(0x0003, 0x0001, MsgType::DReq, 0x01, &snapshot2, 200), t(2));
        let (_, staged) = engine.take_request().unwrap();
        assert_eq!(staged.unwrap().meta.msg_type, MsgType::DFail);
        // The original exchange is untouched.
        assert_eq!(engine.twr_peer(), first_peer);
        assert_eq!(engine.twr_state(), TwrState::ReqRecvd);
    }

    #[test]
    fn second_failure_disconnects_the_peer() {
        let mut engine = CommsEngine::new(0x0001, zero_delay_calib());
        connect_peer(&mut engine, 0x0002, t(0));
        drain_broadcast(&mut engine, t(0));

        for i in 0..2u64 {
            // Spaced past the per-peer ranging pace.
            let now = t(1 + i * 1000);
            assert_eq!(engine.next_action(now), LocAction::Resp);
            engine.take_request();
            engine.handle_outcome(DwOutcome::SendDone { tx_ts: 0 }, now);
            engine.handle_outcome(DwOutcome::RecvTmo, now);
        }
        assert_eq!(engine.peers().get_peer(0x0002), None);
        assert_eq!(engine.peers().connected_count(), 0);
        assert_eq!(engine.twr_fail_cnt(), 0);
    }

    #[test]
    fn ttl_expiry_frees_the_slot_and_clears_the_edm_row() {
        let mut engine = CommsEngine::new(0x0001, zero_delay_calib());
        connect_peer(&mut engine, 0x0002, t(0));

        for tick in 1..=(PEER_CONN_TTL as u64 + 1) {
            engine.tick(t(tick * PEER_TIMER_PERIOD.ticks()));
            engine.take_request();
        }
        assert_eq!(engine.peers().get_peer(0x0002), None);
        assert_eq!(engine.peers().used(), 0);
    }

    #[test]
    fn silent_peer_gets_a_keepalive_before_the_axe() {
        let mut engine = CommsEngine::new(0x0001, zero_delay_calib());
        connect_peer(&mut engine, 0x0002, t(0));
        drain_broadcast(&mut engine, t(0));
        let id = engine.peers().get_peer(0x0002).unwrap();

        // Ranging is exhausted for this test's purposes: fill the sample
        // budget so maintenance is the only pending concern.
        for _ in 0..MIN_D_MEASURES {
            engine.peers.info_mut(id).update_distance(2.0);
        }

        // Half the TTL window passes in silence.
        let half = PEER_CONN_TTL as u64 / 2 + 1;
        for tick in 1..=half {
            engine.tick(t(tick * PEER_TIMER_PERIOD.ticks()));
        }
        assert!(engine.peers().peer(id).keepalive_due);
        assert_eq!(
            engine.next_action(t(half * PEER_TIMER_PERIOD.ticks())),
            LocAction::RespBeforeTmo
        );
        let (req, staged) = engine.take_request().unwrap();
        assert!(matches!(req, DwRequest::SendW4R { .. }));
        assert_eq!(staged.unwrap().meta.msg_type, MsgType::MConn);
        assert_eq!(engine.peers().get_conn_peer(), Some(id));
        assert_eq!(engine.peers().get_unconn_peer(), None);
    }

    #[test]
    fn receive_timeouts_are_counted_until_traffic_returns() {
        let mut engine = CommsEngine::new(0x0001, zero_delay_calib());
        engine.handle_outcome(DwOutcome::RecvTmo, t(0));
        engine.handle_outcome(DwOutcome::RecvTmo, t(1));
        assert_eq!(engine.recv_tmo_cnt(), 2);
        deliver(
            &mut engine,
            frame_from(0x0002, BROADCAST_ADDR, MsgType::Broadcast, 0, &[], 0),
            t(2),
        );
        assert_eq!(engine.recv_tmo_cnt(), 0);
    }

    #[test]
    fn broadcast_is_paced_by_the_message_counter() {
        let mut engine = CommsEngine::new(0x0001, zero_delay_calib());
        // Fresh engine: broadcast due immediately.
        assert_eq!(engine.next_action(t(0)), LocAction::NoResp);
        let (_, staged) = engine.take_request().unwrap();
        assert_eq!(staged.unwrap().meta.msg_type, MsgType::Broadcast);
        engine.handle_outcome(DwOutcome::SendDone { tx_ts: 0 }, t(0));
        engine.take_request();

        // Counter reset: nothing more to do until traffic accumulates.
        assert_eq!(engine.next_action(t(1)), LocAction::Stop);
    }

    #[test]
    fn sent_sequences_increase_mod_16_across_fresh_sends() {
        let mut engine = CommsEngine::new(0x0001, zero_delay_calib());
        connect_peer(&mut engine, 0x0002, t(0));

        let mut prev: Option<u8> = None;
        for i in 0..20u8 {
            // Peer keepalives arrive in order; our acks are fresh sends.
            deliver(
                &mut engine,
                frame_from(0x0002, 0x0001, MsgType::MConn, (i + 1) & 0x0F, &[], 0),
                t(i as u64),
            );
            let (_, staged) = engine.take_request().unwrap();
            let staged = staged.unwrap();
            let seq = staged.buf[crate::mac::MHR_LEN + 1] & 0x0F;
            if let Some(p) = prev {
                assert_eq!(seq, (p + 1) & 0x0F);
            }
            prev = Some(seq);
            engine.handle_outcome(DwOutcome::SendDone { tx_ts: 0 }, t(i as u64));
            engine.take_request();
        }
    }
}
