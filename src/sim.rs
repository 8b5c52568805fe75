//! Scripted chip for host tests.
//!
//! Implements [`DwChip`] over a shared state cell: tests park frames and
//! status bits in [`SimState`], then let the node run its steps against it.
//! Transmissions complete instantly (`TXFRS` goes pending on `start_tx`), so
//! a test drives time purely through the instants it passes in.

use crate::events::SysEvents;
use crate::hal::{DwChip, TxMode, TxStartError};
use core::convert::Infallible;
use std::cell::RefCell;
use std::rc::Rc;
use std::vec::Vec as StdVec;

pub type SimHandle = Rc<RefCell<SimState>>;

#[derive(Default)]
pub struct SimState {
    pub powered: bool,
    pub spi_fast: bool,
    pub hard_resets: u32,
    pub lde_loads: u32,
    pub trx_off_count: u32,
    pub pan_id: u16,
    pub short_addr: u16,
    pub tx_ant_delay: u16,
    pub rx_ant_delay: u16,

    /// Pending status-register causes, cleared write-one-to-clear.
    pub status: u32,
    /// Frame waiting in the receive buffer, with its rx timestamp.
    pub rx_frame: Option<(StdVec<u8>, u64)>,
    pub rx_armed: bool,
    pub rx_timeout_us: u32,

    /// Every frame handed to the transmitter, in order.
    pub tx_log: StdVec<StdVec<u8>>,
    pub tx_modes: StdVec<TxMode>,
    /// Timestamp reported for the next completed transmission.
    pub tx_ts: u64,
    /// Fail the next scheduled send with HPDWARN.
    pub fail_next_delayed: bool,

    staged_tx: StdVec<u8>,
}

pub struct SimChip {
    state: SimHandle,
}

impl SimChip {
    pub fn new() -> (Self, SimHandle) {
        let state: SimHandle = Rc::new(RefCell::new(SimState::default()));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl DwChip for SimChip {
    type BusError = Infallible;

    fn power_on(&mut self) {
        self.state.borrow_mut().powered = true;
    }

    fn power_off(&mut self) {
        self.state.borrow_mut().powered = false;
    }

    fn hard_reset(&mut self) -> Result<(), Infallible> {
        let mut s = self.state.borrow_mut();
        s.hard_resets += 1;
        s.status = 0;
        s.rx_armed = false;
        Ok(())
    }

    fn set_spi_slow(&mut self) {
        self.state.borrow_mut().spi_fast = false;
    }

    fn set_spi_fast(&mut self) {
        self.state.borrow_mut().spi_fast = true;
    }

    fn load_lde(&mut self) -> Result<(), Infallible> {
        self.state.borrow_mut().lde_loads += 1;
        Ok(())
    }

    fn load_ldotune(&mut self) -> Result<u64, Infallible> {
        Ok(0x0012_3456_789A)
    }

    fn hardware_id(&mut self) -> Result<u64, Infallible> {
        Ok(0xDECA_0130)
    }

    fn set_pan_addr(&mut self, pan_id: u16, short_addr: u16) -> Result<(), Infallible> {
        let mut s = self.state.borrow_mut();
        s.pan_id = pan_id;
        s.short_addr = short_addr;
        Ok(())
    }

    fn set_antenna_delays(&mut self, tx: u16, rx: u16) -> Result<(), Infallible> {
        let mut s = self.state.borrow_mut();
        s.tx_ant_delay = tx;
        s.rx_ant_delay = rx;
        Ok(())
    }

    fn read_status(&mut self) -> Result<SysEvents, Infallible> {
        Ok(SysEvents::from_bits_truncate(self.state.borrow().status))
    }

    fn clear_status(&mut self, ev: SysEvents) -> Result<(), Infallible> {
        self.state.borrow_mut().status &= !ev.bits();
        Ok(())
    }

    fn force_trx_off(&mut self) -> Result<(), Infallible> {
        let mut s = self.state.borrow_mut();
        s.trx_off_count += 1;
        s.rx_armed = false;
        Ok(())
    }

    fn enable_rx(&mut self, timeout_us: u32) -> Result<(), Infallible> {
        let mut s = self.state.borrow_mut();
        s.rx_armed = true;
        s.rx_timeout_us = timeout_us;
        Ok(())
    }

    fn write_tx_frame(&mut self, frame: &[u8]) -> Result<(), Infallible> {
        self.state.borrow_mut().staged_tx = frame.to_vec();
        Ok(())
    }

    fn start_tx(&mut self, mode: TxMode) -> Result<(), TxStartError<Infallible>> {
        let mut s = self.state.borrow_mut();
        if matches!(mode, TxMode::Delayed(_)) && s.fail_next_delayed {
            s.fail_next_delayed = false;
            return Err(TxStartError::Hpdwarn);
        }
        let frame = core::mem::take(&mut s.staged_tx);
        s.tx_log.push(frame);
        s.tx_modes.push(mode);
        s.status |= SysEvents::TXFRS.bits();
        if matches!(mode, TxMode::Wait4Response) {
            s.rx_armed = true;
        }
        Ok(())
    }

    fn read_rx_frame(&mut self, buf: &mut [u8]) -> Result<(usize, u64), Infallible> {
        let mut s = self.state.borrow_mut();
        s.rx_armed = false;
        match s.rx_frame.take() {
            Some((frame, ts)) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok((len, ts))
            }
            None => Ok((0, 0)),
        }
    }

    fn tx_timestamp(&mut self) -> Result<u64, Infallible> {
        Ok(self.state.borrow().tx_ts)
    }
}
