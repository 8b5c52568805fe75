//! Top-level node: supervisor state, ISR latch and task steps.
//!
//! On a real board the pieces run as four tasks plus the interrupt handler,
//! highest priority first:
//!
//! 1. the ISR calls [`IrqLatch::post`] and nothing else;
//! 2. the radio-IRQ task wakes on the latch and calls
//!    [`Node::service_radio`], which does the single status read/clear and
//!    drives the radio controller;
//! 3. the comms engine runs inside the same call chain, being the only
//!    writer of the peer table and the EDM;
//! 4. a periodic task calls [`Node::poll`] on the system tick (peer timers,
//!    watchdogs) and [`Node::status_report`] at leisure.
//!
//! The whole stack is one owning [`Node`] value, so the host tests run it
//! synchronously against a scripted chip with no executor underneath.

use crate::config::{
    Calibration, Instant, CH_TIMEOUT, DW_RESET_BUDGET, ERR_COOLDOWN, PAN_ID,
};
use crate::engine::{CommsEngine, LocAction};
use crate::events::SysEvents;
use crate::hal::{DwChip, DwHal, HalError};
use crate::radio::{DwController, DwOutcome, DwRequest, DwState};
use core::cell::Cell;
use critical_section::Mutex;

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LocState {
    Standby,
    Init,
    Comm,
    Twr,
    Err,
}

/// Lock-free-enough mailbox between the ISR and the radio-IRQ task.
///
/// The ISR posts a bit and returns; everything that needs the SPI bus is
/// deferred to task context. Fits in a `static`.
pub struct IrqLatch(Mutex<Cell<u32>>);

impl IrqLatch {
    pub const fn new() -> Self {
        Self(Mutex::new(Cell::new(0)))
    }

    /// ISR context: accumulate pending causes. No SPI, no blocking.
    pub fn post(&self, ev: SysEvents) {
        critical_section::with(|cs| {
            let cell = self.0.borrow(cs);
            cell.set(cell.get() | ev.bits());
        });
    }

    /// Task context: drain everything posted since the last call.
    pub fn take(&self) -> SysEvents {
        critical_section::with(|cs| SysEvents::from_bits_truncate(self.0.borrow(cs).replace(0)))
    }
}

impl Default for IrqLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot for the status task.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusReport {
    pub state: LocState,
    pub peers_used: u8,
    pub peers_connected: u8,
    pub resets_since_ok: u8,
}

/// The owning value threaded through every task.
pub struct Node<C: DwChip> {
    hal: DwHal<C>,
    radio: DwController,
    engine: CommsEngine,
    state: LocState,
    resets_since_ok: u8,
    last_comm_ok: Instant,
    err_since: Option<Instant>,
}

impl<C: DwChip> Node<C> {
    pub fn new(chip: C, short_addr: u16, calib: Calibration) -> Self {
        Self {
            hal: DwHal::new(chip, PAN_ID, short_addr, calib),
            radio: DwController::new(),
            engine: CommsEngine::new(short_addr, calib),
            state: LocState::Standby,
            resets_since_ok: 0,
            last_comm_ok: Instant::from_ticks(0),
            err_since: None,
        }
    }

    pub fn state(&self) -> LocState {
        self.state
    }

    pub fn engine(&self) -> &CommsEngine {
        &self.engine
    }

    pub fn radio_state(&self) -> DwState {
        self.radio.state()
    }

    /// Bring the radio up and enter `Comm`. Returns the factory device id.
    pub fn start(&mut self, now: Instant) -> Result<u64, HalError<C::BusError>> {
        self.state = LocState::Init;
        let id = self.hal.init()?;
        info!("radio up, entering comm");
        self.last_comm_ok = now;
        self.state = LocState::Comm;
        self.run_idle(now)?;
        Ok(id)
    }

    /// Radio-IRQ task step: translate latched causes into controller input.
    pub fn service_radio(
        &mut self,
        latch: &IrqLatch,
        now: Instant,
    ) -> Result<(), HalError<C::BusError>> {
        let pending = latch.take();
        if pending.is_empty() || self.state == LocState::Standby {
            return Ok(());
        }
        let ev = self.hal.irq_events()?;
        if !ev.is_empty() {
            if let Some(out) = self.radio.on_events(ev, &mut self.hal, now)? {
                self.dispatch(out, now);
            }
        }
        self.run_idle(now)
    }

    /// Periodic step on the system tick: peer timers and watchdogs.
    pub fn poll(&mut self, now: Instant) -> Result<(), HalError<C::BusError>> {
        match self.state {
            LocState::Standby | LocState::Init => Ok(()),
            LocState::Err => self.try_recover(now),
            LocState::Comm | LocState::Twr => {
                self.engine.tick(now);
                if let Some(out) = self.radio.poll_deadline(&mut self.hal, now)? {
                    self.dispatch(out, now);
                }
                if now
                    .checked_duration_since(self.last_comm_ok)
                    .map_or(false, |d| d >= CH_TIMEOUT)
                {
                    warn!("channel silent too long, resetting the transceiver");
                    if let Some(out) =
                        self.radio.submit(DwRequest::Reset, None, &mut self.hal, now)?
                    {
                        self.dispatch(out, now);
                    }
                    // Whatever was in flight is gone with the reset.
                    self.engine.handle_outcome(DwOutcome::RecvTmo, now);
                    self.last_comm_ok = now;
                }
                self.run_idle(now)
            }
        }
    }

    /// Status task step.
    pub fn status_report(&self) -> StatusReport {
        let report = StatusReport {
            state: self.state,
            peers_used: self.engine.peers().used(),
            peers_connected: self.engine.peers().connected_count(),
            resets_since_ok: self.resets_since_ok,
        };
        info!(
            "peers {}/{}, resets {}",
            report.peers_connected,
            report.peers_used,
            report.resets_since_ok
        );
        report
    }

    fn try_recover(&mut self, now: Instant) -> Result<(), HalError<C::BusError>> {
        let cooled = self
            .err_since
            .and_then(|since| now.checked_duration_since(since))
            .map_or(false, |d| d >= ERR_COOLDOWN);
        if !cooled {
            return Ok(());
        }
        info!("cool-down over, re-initialising the radio");
        self.state = LocState::Init;
        self.hal.reset()?;
        self.resets_since_ok = 0;
        self.err_since = None;
        self.last_comm_ok = now;
        self.state = LocState::Comm;
        self.run_idle(now)
    }

    /// Supervisor bookkeeping, then the comms engine.
    fn dispatch(&mut self, out: DwOutcome, now: Instant) {
        match &out {
            DwOutcome::ResetDone => {
                self.resets_since_ok = self.resets_since_ok.saturating_add(1);
                if self.resets_since_ok > DW_RESET_BUDGET {
                    error!("radio reset budget exhausted");
                    self.state = LocState::Err;
                    self.err_since = Some(now);
                    return;
                }
            }
            DwOutcome::Recvd(_) | DwOutcome::SendDone { .. } => {
                self.resets_since_ok = 0;
                self.last_comm_ok = now;
            }
            _ => {}
        }
        self.engine.handle_outcome(out, now);
        self.sync_state();
    }

    fn sync_state(&mut self) {
        if matches!(self.state, LocState::Comm | LocState::Twr) {
            self.state = if self.engine.twr_peer().is_some() {
                LocState::Twr
            } else {
                LocState::Comm
            };
        }
    }

    /// Flush engine requests into the controller; when truly idle, ask the
    /// engine for the next action and fall back to listening.
    fn run_idle(&mut self, now: Instant) -> Result<(), HalError<C::BusError>> {
        if !matches!(self.state, LocState::Comm | LocState::Twr) {
            return Ok(());
        }
        loop {
            // Err is allowed through so a queued reset can clear it; the
            // controller ignores anything else while in Err.
            if !matches!(
                self.radio.state(),
                DwState::Idle | DwState::Recv | DwState::Err
            ) {
                break;
            }
            if let Some((req, staged)) = self.engine.take_request() {
                let out = match &staged {
                    Some(s) => self.radio.submit(req, Some(&s.buf), &mut self.hal, now)?,
                    None => self.radio.submit(req, None, &mut self.hal, now)?,
                };
                if let Some(out) = out {
                    self.dispatch(out, now);
                }
                continue;
            }
            if !self.radio.is_idle() {
                break;
            }
            match self.engine.next_action(now) {
                LocAction::Stop => {
                    self.radio.submit(DwRequest::Recv, None, &mut self.hal, now)?;
                    break;
                }
                LocAction::ActErr => {
                    if let Some(out) =
                        self.radio.submit(DwRequest::TrxErr, None, &mut self.hal, now)?
                    {
                        self.dispatch(out, now);
                    }
                    break;
                }
                // Anything else staged a frame; the next spin picks it up.
                _ => {}
            }
        }
        self.sync_state();
        Ok(())
    }
}
