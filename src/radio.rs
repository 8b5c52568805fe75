//! Radio I/O controller.
//!
//! Sits between the ISR-fed event stream and the comms engine: it owns the
//! transceiver operation in flight, absorbs every transient radio error by
//! re-arming, and hard-resets the chip after [`DW_ERR_THRESH`] consecutive
//! failures. Upper layers only ever see completed exchanges, receive
//! timeouts, scheduling misses and reset notifications.

use crate::config::{Instant, DW_ERR_THRESH, TX_TIMEOUT};
use crate::events::SysEvents;
use crate::hal::{DwChip, DwHal, HalError, TxMode};
use crate::mac::RxFrame;

/// Controller state: which transceiver operation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DwState {
    Idle,
    Recv,
    Send,
    SendW4R,
    ScheduledSend,
    Err,
}

/// Requests accepted from the comms engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DwRequest {
    /// Arm the receiver without a hardware timeout.
    Recv,
    /// Arm the receiver with a frame-wait timeout, microseconds.
    RecvTmo { timeout_us: u32 },
    Send,
    SendW4R { timeout_us: u32 },
    SendDly { tx_time: u64 },
    /// Recover from a stuck transceiver.
    TrxErr,
    /// Abort whatever is in flight and hard-reset.
    Reset,
    Yield,
}

/// Completion events handed upstream (the `DW_COMM_OK` path and its
/// non-fatal siblings).
#[derive(Debug, Clone)]
pub enum DwOutcome {
    Recvd(RxFrame),
    SendDone { tx_ts: u64 },
    RecvTmo,
    /// A scheduled transmit missed its slot (HPDWARN).
    SchedMiss,
    /// The controller hard-reset the chip and recovered on its own.
    ResetDone,
}

pub struct DwController {
    state: DwState,
    err_cnt: u8,
    resets: u8,
    op_deadline: Option<Instant>,
    recv_timeout_us: u32,
}

impl DwController {
    pub const fn new() -> Self {
        Self {
            state: DwState::Idle,
            err_cnt: 0,
            resets: 0,
            op_deadline: None,
            recv_timeout_us: 0,
        }
    }

    pub fn state(&self) -> DwState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == DwState::Idle
    }

    /// Hard resets performed since the supervisor last asked.
    pub fn take_resets(&mut self) -> u8 {
        core::mem::replace(&mut self.resets, 0)
    }

    fn recover<C: DwChip>(
        &mut self,
        hal: &mut DwHal<C>,
    ) -> Result<Option<DwOutcome>, HalError<C::BusError>> {
        hal.reset()?;
        self.state = DwState::Idle;
        self.err_cnt = 0;
        self.op_deadline = None;
        self.resets = self.resets.saturating_add(1);
        Ok(Some(DwOutcome::ResetDone))
    }

    /// Start a new transceiver operation. `frame` carries the staged bytes
    /// for the send requests.
    pub fn submit<C: DwChip>(
        &mut self,
        req: DwRequest,
        frame: Option<&[u8]>,
        hal: &mut DwHal<C>,
        now: Instant,
    ) -> Result<Option<DwOutcome>, HalError<C::BusError>> {
        match req {
            DwRequest::TrxErr | DwRequest::Reset => return self.recover(hal),
            DwRequest::Yield => {
                self.state = DwState::Idle;
                self.op_deadline = None;
                return Ok(None);
            }
            _ => {}
        }
        if self.state == DwState::Err {
            // Only a reset request leaves Err.
            return Ok(None);
        }
        if self.state == DwState::Recv {
            // Cancel the pending listen before the new operation.
            hal.force_trx_off()?;
            self.state = DwState::Idle;
        }
        match req {
            DwRequest::Recv => {
                hal.arm_recv(0)?;
                self.recv_timeout_us = 0;
                self.state = DwState::Recv;
                self.op_deadline = None;
            }
            DwRequest::RecvTmo { timeout_us } => {
                hal.arm_recv(timeout_us)?;
                self.recv_timeout_us = timeout_us;
                self.state = DwState::Recv;
                self.op_deadline = None;
            }
            DwRequest::Send => {
                hal.send(frame.unwrap_or(&[]), TxMode::Immediate)?;
                self.state = DwState::Send;
                self.op_deadline = Some(now + TX_TIMEOUT);
            }
            DwRequest::SendW4R { timeout_us } => {
                hal.send(frame.unwrap_or(&[]), TxMode::Wait4Response)?;
                self.recv_timeout_us = timeout_us;
                self.state = DwState::SendW4R;
                self.op_deadline = Some(now + TX_TIMEOUT);
            }
            DwRequest::SendDly { tx_time } => {
                match hal.send(frame.unwrap_or(&[]), TxMode::Delayed(tx_time)) {
                    Ok(()) => {
                        self.state = DwState::ScheduledSend;
                        self.op_deadline = Some(now + TX_TIMEOUT);
                    }
                    Err(HalError::Hpdwarn) => {
                        warn!("scheduled send missed its slot");
                        self.state = DwState::Err;
                        return Ok(Some(DwOutcome::SchedMiss));
                    }
                    Err(e) => return Err(e),
                }
            }
            DwRequest::TrxErr | DwRequest::Reset | DwRequest::Yield => unreachable!(),
        }
        Ok(None)
    }

    /// Feed one latched event mask through the state machine.
    pub fn on_events<C: DwChip>(
        &mut self,
        ev: SysEvents,
        hal: &mut DwHal<C>,
        _now: Instant,
    ) -> Result<Option<DwOutcome>, HalError<C::BusError>> {
        if ev.intersects(SysEvents::HARDFAULT) {
            return self.recover(hal);
        }
        match self.state {
            DwState::Recv => {
                if ev.contains(SysEvents::RXFCG) {
                    match hal.read_frame() {
                        Ok(frame) => {
                            self.err_cnt = 0;
                            self.state = DwState::Idle;
                            self.op_deadline = None;
                            return Ok(Some(DwOutcome::Recvd(frame)));
                        }
                        Err(HalError::Frame(_)) => {
                            // Shape violations are dropped silently.
                            trace!("dropped malformed frame");
                            hal.arm_recv(self.recv_timeout_us)?;
                        }
                        Err(e) => return Err(e),
                    }
                } else if ev.rx_error() {
                    self.err_cnt = self.err_cnt.saturating_add(1);
                    if self.err_cnt >= DW_ERR_THRESH {
                        let out = self.recover(hal)?;
                        // Keep listening after the recovery reset.
                        hal.arm_recv(self.recv_timeout_us)?;
                        self.state = DwState::Recv;
                        return Ok(out);
                    }
                    hal.arm_recv(self.recv_timeout_us)?;
                } else if ev.rx_timeout() {
                    self.state = DwState::Idle;
                    self.op_deadline = None;
                    return Ok(Some(DwOutcome::RecvTmo));
                }
            }
            DwState::Send | DwState::SendW4R | DwState::ScheduledSend => {
                if ev.contains(SysEvents::HPDWARN) {
                    warn!("HPDWARN while transmitting");
                    self.state = DwState::Err;
                    return Ok(Some(DwOutcome::SchedMiss));
                }
                if ev.contains(SysEvents::TXFRS) {
                    let tx_ts = hal.read_tx_timestamp()?;
                    self.err_cnt = 0;
                    self.op_deadline = None;
                    self.state = if self.state == DwState::SendW4R {
                        // The chip dropped into receive by itself.
                        DwState::Recv
                    } else {
                        DwState::Idle
                    };
                    return Ok(Some(DwOutcome::SendDone { tx_ts }));
                }
            }
            DwState::Idle | DwState::Err => {}
        }
        Ok(None)
    }

    /// Enforce the transmit-complete bound; a silent chip gets reset.
    pub fn poll_deadline<C: DwChip>(
        &mut self,
        hal: &mut DwHal<C>,
        now: Instant,
    ) -> Result<Option<DwOutcome>, HalError<C::BusError>> {
        let Some(deadline) = self.op_deadline else {
            return Ok(None);
        };
        if now < deadline {
            return Ok(None);
        }
        warn!("transceiver deadline missed, forcing reset");
        self.recover(hal)
    }
}
