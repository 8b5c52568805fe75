//! Radio HAL shim: a thin, deterministic wrapper over the chip.
//!
//! The register-level driver is reached through [`DwChip`], so everything
//! above it is hardware-agnostic. [`Dw1000`] is the production implementation
//! over an `embedded-hal` SPI device; the test build substitutes a scripted
//! chip. [`DwHal`] composes the multi-step recipes (bring-up, the hard-reset
//! sequence with microcode reload and antenna-delay restore) out of the trait
//! operations.

use crate::config::Calibration;
use crate::events::SysEvents;
use crate::mac::{FrameError, RxFrame, MAX_FRAME_LEN};
use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Operation, SpiDevice};

/// Transmit scheduling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxMode {
    /// Start transmitting now.
    Immediate,
    /// Transmit now, then drop straight into receive.
    Wait4Response,
    /// Transmit when the device clock reaches the given 40-bit time.
    Delayed(u64),
}

/// Failure to start a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStartError<E> {
    Bus(E),
    /// The scheduled time failed the half-period margin check. Never
    /// swallowed; the exchange in flight must be aborted.
    Hpdwarn,
}

/// Shim-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError<E> {
    Bus(E),
    Hpdwarn,
    Frame(FrameError),
}

impl<E> From<TxStartError<E>> for HalError<E> {
    fn from(e: TxStartError<E>) -> Self {
        match e {
            TxStartError::Bus(e) => HalError::Bus(e),
            TxStartError::Hpdwarn => HalError::Hpdwarn,
        }
    }
}

/// Register-level chip surface consumed by the shim.
///
/// One implementation speaks SPI to the real device; the host tests script
/// another. Nothing here blocks beyond a single register transaction.
pub trait DwChip {
    type BusError: core::fmt::Debug;

    fn power_on(&mut self);
    fn power_off(&mut self);

    /// Reset the chip core. Configuration and microcode are lost.
    fn hard_reset(&mut self) -> Result<(), Self::BusError>;

    fn set_spi_slow(&mut self);
    fn set_spi_fast(&mut self);

    /// Load the leading-edge-detection microcode. Must not be preempted.
    fn load_lde(&mut self) -> Result<(), Self::BusError>;

    /// Restore the LDO tune word from OTP; returns it for logging.
    fn load_ldotune(&mut self) -> Result<u64, Self::BusError>;

    /// 64-bit factory device id.
    fn hardware_id(&mut self) -> Result<u64, Self::BusError>;

    fn set_pan_addr(&mut self, pan_id: u16, short_addr: u16) -> Result<(), Self::BusError>;
    fn set_antenna_delays(&mut self, tx: u16, rx: u16) -> Result<(), Self::BusError>;

    fn read_status(&mut self) -> Result<SysEvents, Self::BusError>;
    fn clear_status(&mut self, ev: SysEvents) -> Result<(), Self::BusError>;

    /// Abort any in-flight transceiver operation.
    fn force_trx_off(&mut self) -> Result<(), Self::BusError>;

    /// Arm the receiver; `timeout_us == 0` waits forever.
    fn enable_rx(&mut self, timeout_us: u32) -> Result<(), Self::BusError>;

    fn write_tx_frame(&mut self, frame: &[u8]) -> Result<(), Self::BusError>;
    fn start_tx(&mut self, mode: TxMode) -> Result<(), TxStartError<Self::BusError>>;

    /// Pull the received frame and its 40-bit receive timestamp.
    fn read_rx_frame(&mut self, buf: &mut [u8]) -> Result<(usize, u64), Self::BusError>;

    /// 40-bit timestamp of the last transmitted frame.
    fn tx_timestamp(&mut self) -> Result<u64, Self::BusError>;
}

/// The HAL shim proper.
pub struct DwHal<C: DwChip> {
    chip: C,
    calib: Calibration,
    pan_id: u16,
    short_addr: u16,
}

impl<C: DwChip> DwHal<C> {
    pub fn new(chip: C, pan_id: u16, short_addr: u16, calib: Calibration) -> Self {
        Self {
            chip,
            calib,
            pan_id,
            short_addr,
        }
    }

    pub fn calib(&self) -> &Calibration {
        &self.calib
    }

    pub fn short_addr(&self) -> u16 {
        self.short_addr
    }

    /// Cold bring-up. Returns the factory device id.
    pub fn init(&mut self) -> Result<u64, HalError<C::BusError>> {
        self.chip.power_on();
        self.chip.set_spi_slow();
        self.chip.hard_reset().map_err(HalError::Bus)?;
        self.chip.load_lde().map_err(HalError::Bus)?;
        let ldotune = self.chip.load_ldotune().map_err(HalError::Bus)?;
        self.chip.set_spi_fast();
        let id = self.chip.hardware_id().map_err(HalError::Bus)?;
        self.chip
            .set_pan_addr(self.pan_id, self.short_addr)
            .map_err(HalError::Bus)?;
        self.chip
            .set_antenna_delays(self.calib.tx_ant_delay, self.calib.rx_ant_delay)
            .map_err(HalError::Bus)?;
        debug!("dw init done, ldotune {}", ldotune);
        Ok(id)
    }

    /// Full recovery reset: abort the transceiver, reset the core, reload
    /// microcode and restore the calibrated delays and addressing.
    pub fn reset(&mut self) -> Result<(), HalError<C::BusError>> {
        self.chip.force_trx_off().map_err(HalError::Bus)?;
        self.chip.set_spi_slow();
        self.chip.hard_reset().map_err(HalError::Bus)?;
        self.chip.load_lde().map_err(HalError::Bus)?;
        self.chip.load_ldotune().map_err(HalError::Bus)?;
        self.chip.set_spi_fast();
        self.chip
            .set_pan_addr(self.pan_id, self.short_addr)
            .map_err(HalError::Bus)?;
        self.chip
            .set_antenna_delays(self.calib.tx_ant_delay, self.calib.rx_ant_delay)
            .map_err(HalError::Bus)?;
        warn!("dw hard reset performed");
        Ok(())
    }

    pub fn power_off(&mut self) {
        self.chip.power_off();
    }

    pub fn arm_recv(&mut self, timeout_us: u32) -> Result<(), HalError<C::BusError>> {
        self.chip.enable_rx(timeout_us).map_err(HalError::Bus)
    }

    /// Stage and start a transmission. A failed margin check on a scheduled
    /// send surfaces as [`HalError::Hpdwarn`].
    pub fn send(&mut self, frame: &[u8], mode: TxMode) -> Result<(), HalError<C::BusError>> {
        self.chip.write_tx_frame(frame).map_err(HalError::Bus)?;
        self.chip.start_tx(mode)?;
        Ok(())
    }

    pub fn read_frame(&mut self) -> Result<RxFrame, HalError<C::BusError>> {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let (len, rx_ts) = self.chip.read_rx_frame(&mut buf).map_err(HalError::Bus)?;
        RxFrame::parse(&buf[..len], rx_ts).map_err(HalError::Frame)
    }

    pub fn read_tx_timestamp(&mut self) -> Result<u64, HalError<C::BusError>> {
        self.chip.tx_timestamp().map_err(HalError::Bus)
    }

    pub fn force_trx_off(&mut self) -> Result<(), HalError<C::BusError>> {
        self.chip.force_trx_off().map_err(HalError::Bus)
    }

    /// One status read, one clear: the whole SPI budget of the IRQ path.
    pub fn irq_events(&mut self) -> Result<SysEvents, HalError<C::BusError>> {
        let ev = self.chip.read_status().map_err(HalError::Bus)?;
        if !ev.is_empty() {
            self.chip.clear_status(ev).map_err(HalError::Bus)?;
        }
        Ok(ev)
    }

    #[cfg(test)]
    pub(crate) fn chip_mut(&mut self) -> &mut C {
        &mut self.chip
    }
}

// Register file ids used below.
const REG_DEV_ID: u8 = 0x00;
const REG_PANADR: u8 = 0x03;
const REG_SYS_CFG: u8 = 0x04;
const REG_TX_FCTRL: u8 = 0x08;
const REG_TX_BUFFER: u8 = 0x09;
const REG_DX_TIME: u8 = 0x0A;
const REG_RX_FWTO: u8 = 0x0C;
const REG_SYS_CTRL: u8 = 0x0D;
const REG_SYS_STATUS: u8 = 0x0F;
const REG_RX_FINFO: u8 = 0x10;
const REG_RX_BUFFER: u8 = 0x11;
const REG_RX_TIME: u8 = 0x15;
const REG_TX_TIME: u8 = 0x17;
const REG_TX_ANTD: u8 = 0x18;
const REG_RF_CONF: u8 = 0x28;
const REG_OTP_IF: u8 = 0x2D;
const REG_LDE_IF: u8 = 0x2E;
const REG_PMSC: u8 = 0x36;

const SUB_OTP_ADDR: u16 = 0x04;
const SUB_OTP_CTRL: u16 = 0x06;
const SUB_OTP_RDAT: u16 = 0x0A;
const SUB_LDE_RXANTD: u16 = 0x1804;
const SUB_LDOTUNE: u16 = 0x30;

const OTP_ADDR_LDOTUNE_LO: u16 = 0x004;
const OTP_ADDR_LDOTUNE_HI: u16 = 0x005;

// SYS_CTRL bits.
const SYS_CTRL_TXSTRT: u32 = 1 << 1;
const SYS_CTRL_TXDLYS: u32 = 1 << 2;
const SYS_CTRL_TRXOFF: u32 = 1 << 6;
const SYS_CTRL_WAIT4RESP: u32 = 1 << 7;
const SYS_CTRL_RXENAB: u32 = 1 << 8;

// SYS_CFG bits.
const SYS_CFG_RXWTOE: u32 = 1 << 28;

/// Production chip driver over an `embedded-hal` SPI device.
///
/// SPI rate switching is owned by the bus implementation on most boards, so
/// the slow/fast calls only track the expectation here.
pub struct Dw1000<SPI, D> {
    spi: SPI,
    delay: D,
    spi_fast: bool,
}

impl<SPI, D> Dw1000<SPI, D>
where
    SPI: SpiDevice<u8>,
    D: DelayNs,
{
    pub fn new(spi: SPI, delay: D) -> Self {
        Self {
            spi,
            delay,
            spi_fast: false,
        }
    }

    fn header(reg: u8, sub: u16, write: bool, hdr: &mut [u8; 3]) -> usize {
        let mut b0 = reg & 0x3F;
        if write {
            b0 |= 0x80;
        }
        if sub == 0 {
            hdr[0] = b0;
            return 1;
        }
        hdr[0] = b0 | 0x40;
        if sub <= 0x7F {
            hdr[1] = sub as u8;
            2
        } else {
            hdr[1] = (sub as u8 & 0x7F) | 0x80;
            hdr[2] = (sub >> 7) as u8;
            3
        }
    }

    fn read_reg(&mut self, reg: u8, sub: u16, buf: &mut [u8]) -> Result<(), SPI::Error> {
        let mut hdr = [0u8; 3];
        let n = Self::header(reg, sub, false, &mut hdr);
        self.spi
            .transaction(&mut [Operation::Write(&hdr[..n]), Operation::Read(buf)])
    }

    fn write_reg(&mut self, reg: u8, sub: u16, data: &[u8]) -> Result<(), SPI::Error> {
        let mut hdr = [0u8; 3];
        let n = Self::header(reg, sub, true, &mut hdr);
        self.spi
            .transaction(&mut [Operation::Write(&hdr[..n]), Operation::Write(data)])
    }

    fn read_u32(&mut self, reg: u8, sub: u16) -> Result<u32, SPI::Error> {
        let mut b = [0u8; 4];
        self.read_reg(reg, sub, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn write_u32(&mut self, reg: u8, sub: u16, v: u32) -> Result<(), SPI::Error> {
        self.write_reg(reg, sub, &v.to_le_bytes())
    }

    fn read_ts40(&mut self, reg: u8) -> Result<u64, SPI::Error> {
        let mut b = [0u8; 5];
        self.read_reg(reg, 0, &mut b)?;
        let mut w = [0u8; 8];
        w[..5].copy_from_slice(&b);
        Ok(u64::from_le_bytes(w))
    }

    fn otp_read(&mut self, addr: u16) -> Result<u32, SPI::Error> {
        self.write_reg(REG_OTP_IF, SUB_OTP_ADDR, &addr.to_le_bytes())?;
        // OTPRDEN | OTPREAD
        self.write_reg(REG_OTP_IF, SUB_OTP_CTRL, &[0x03, 0x00])?;
        self.delay.delay_us(2);
        self.write_reg(REG_OTP_IF, SUB_OTP_CTRL, &[0x00, 0x00])?;
        let mut b = [0u8; 4];
        self.read_reg(REG_OTP_IF, SUB_OTP_RDAT, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }
}

impl<SPI, D> DwChip for Dw1000<SPI, D>
where
    SPI: SpiDevice<u8>,
    SPI::Error: core::fmt::Debug,
    D: DelayNs,
{
    type BusError = SPI::Error;

    fn power_on(&mut self) {
        // Supply switching is a board concern; the chip only needs the
        // wake-up settle time before the first transaction.
        self.delay.delay_ms(5);
    }

    fn power_off(&mut self) {}

    fn hard_reset(&mut self) -> Result<(), Self::BusError> {
        // Soft reset through PMSC: force slow sysclks, pulse SOFTRESET.
        self.write_reg(REG_PMSC, 0, &[0x01, 0x03])?;
        self.write_reg(REG_PMSC, 3, &[0x00])?;
        self.delay.delay_us(10);
        self.write_reg(REG_PMSC, 3, &[0xF0])?;
        self.write_reg(REG_PMSC, 0, &[0x00, 0x02])?;
        self.delay.delay_ms(2);
        Ok(())
    }

    fn set_spi_slow(&mut self) {
        self.spi_fast = false;
    }

    fn set_spi_fast(&mut self) {
        self.spi_fast = true;
    }

    fn load_lde(&mut self) -> Result<(), Self::BusError> {
        // Sysclks to the 19.2 MHz XTI clock, kick LDELOAD, wait, restore.
        // The caller guarantees this sequence is not preempted.
        self.write_reg(REG_PMSC, 0, &[0x01, 0x03])?;
        self.write_reg(REG_OTP_IF, SUB_OTP_CTRL, &[0x00, 0x80])?;
        self.delay.delay_us(150);
        self.write_reg(REG_PMSC, 0, &[0x00, 0x02])?;
        Ok(())
    }

    fn load_ldotune(&mut self) -> Result<u64, Self::BusError> {
        let lo = self.otp_read(OTP_ADDR_LDOTUNE_LO)?;
        if lo == 0 {
            return Ok(0);
        }
        let hi = self.otp_read(OTP_ADDR_LDOTUNE_HI)?;
        let ldotune = (lo as u64) | ((hi as u64) << 32);
        let b = ldotune.to_le_bytes();
        self.write_reg(REG_RF_CONF, SUB_LDOTUNE, &b[..5])?;
        Ok(ldotune)
    }

    fn hardware_id(&mut self) -> Result<u64, Self::BusError> {
        Ok(self.read_u32(REG_DEV_ID, 0)? as u64)
    }

    fn set_pan_addr(&mut self, pan_id: u16, short_addr: u16) -> Result<(), Self::BusError> {
        let v = ((pan_id as u32) << 16) | short_addr as u32;
        self.write_u32(REG_PANADR, 0, v)
    }

    fn set_antenna_delays(&mut self, tx: u16, rx: u16) -> Result<(), Self::BusError> {
        self.write_reg(REG_TX_ANTD, 0, &tx.to_le_bytes())?;
        self.write_reg(REG_LDE_IF, SUB_LDE_RXANTD, &rx.to_le_bytes())
    }

    fn read_status(&mut self) -> Result<SysEvents, Self::BusError> {
        let raw = self.read_u32(REG_SYS_STATUS, 0)?;
        Ok(SysEvents::from_bits_truncate(raw))
    }

    fn clear_status(&mut self, ev: SysEvents) -> Result<(), Self::BusError> {
        // Write-one-to-clear.
        self.write_u32(REG_SYS_STATUS, 0, ev.bits())
    }

    fn force_trx_off(&mut self) -> Result<(), Self::BusError> {
        self.write_u32(REG_SYS_CTRL, 0, SYS_CTRL_TRXOFF)
    }

    fn enable_rx(&mut self, timeout_us: u32) -> Result<(), Self::BusError> {
        let mut cfg = self.read_u32(REG_SYS_CFG, 0)?;
        if timeout_us > 0 {
            self.write_reg(REG_RX_FWTO, 0, &(timeout_us as u16).to_le_bytes())?;
            cfg |= SYS_CFG_RXWTOE;
        } else {
            cfg &= !SYS_CFG_RXWTOE;
        }
        self.write_u32(REG_SYS_CFG, 0, cfg)?;
        self.write_u32(REG_SYS_CTRL, 0, SYS_CTRL_RXENAB)
    }

    fn write_tx_frame(&mut self, frame: &[u8]) -> Result<(), Self::BusError> {
        self.write_reg(REG_TX_BUFFER, 0, frame)?;
        // TFLEN covers the payload plus the hardware FCS.
        let mut fctrl = [0u8; 5];
        self.read_reg(REG_TX_FCTRL, 0, &mut fctrl)?;
        fctrl[0] = (frame.len() as u8 + 2) & 0x7F;
        self.write_reg(REG_TX_FCTRL, 0, &fctrl)
    }

    fn start_tx(&mut self, mode: TxMode) -> Result<(), TxStartError<Self::BusError>> {
        let mut ctrl = SYS_CTRL_TXSTRT;
        match mode {
            TxMode::Immediate => {}
            TxMode::Wait4Response => ctrl |= SYS_CTRL_WAIT4RESP,
            TxMode::Delayed(t) => {
                let b = t.to_le_bytes();
                self.write_reg(REG_DX_TIME, 0, &b[..5])
                    .map_err(TxStartError::Bus)?;
                ctrl |= SYS_CTRL_TXDLYS;
            }
        }
        self.write_u32(REG_SYS_CTRL, 0, ctrl)
            .map_err(TxStartError::Bus)?;
        if matches!(mode, TxMode::Delayed(_)) {
            let status = self.read_status().map_err(TxStartError::Bus)?;
            if status.contains(SysEvents::HPDWARN) {
                self.write_u32(REG_SYS_CTRL, 0, SYS_CTRL_TRXOFF)
                    .map_err(TxStartError::Bus)?;
                self.clear_status(SysEvents::HPDWARN)
                    .map_err(TxStartError::Bus)?;
                return Err(TxStartError::Hpdwarn);
            }
        }
        Ok(())
    }

    fn read_rx_frame(&mut self, buf: &mut [u8]) -> Result<(usize, u64), Self::BusError> {
        let finfo = self.read_u32(REG_RX_FINFO, 0)?;
        let len = (finfo & 0x03FF) as usize;
        let data_len = len.saturating_sub(2).min(buf.len());
        self.read_reg(REG_RX_BUFFER, 0, &mut buf[..data_len])?;
        let ts = self.read_ts40(REG_RX_TIME)?;
        Ok((data_len, ts))
    }

    fn tx_timestamp(&mut self) -> Result<u64, Self::BusError> {
        self.read_ts40(REG_TX_TIME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAN_ID;
    use crate::mac::{encode_frame, Mhr, MsgType};
    use crate::sim::SimChip;

    #[test]
    fn init_runs_the_bring_up_recipe() {
        let (chip, state) = SimChip::new();
        let mut hal = DwHal::new(chip, PAN_ID, 0x0001, Calibration::default());
        hal.init().unwrap();
        let s = state.borrow();
        assert!(s.powered);
        assert_eq!(s.hard_resets, 1);
        assert_eq!(s.lde_loads, 1);
        assert!(s.spi_fast);
        assert_eq!(s.pan_id, PAN_ID);
        assert_eq!(s.short_addr, 0x0001);
    }

    #[test]
    fn reset_reloads_microcode_and_delays() {
        let (chip, state) = SimChip::new();
        let mut hal = DwHal::new(chip, PAN_ID, 0x0001, Calibration::default());
        hal.init().unwrap();
        hal.reset().unwrap();
        let s = state.borrow();
        assert_eq!(s.hard_resets, 2);
        assert_eq!(s.lde_loads, 2);
        assert_eq!(s.trx_off_count, 1);
        assert_eq!(s.tx_ant_delay, Calibration::default().tx_ant_delay);
    }

    #[test]
    fn scheduled_send_reports_the_margin_miss() {
        let (chip, state) = SimChip::new();
        let mut hal = DwHal::new(chip, PAN_ID, 0x0001, Calibration::default());
        state.borrow_mut().fail_next_delayed = true;
        let frame = encode_frame(&Mhr::new(0x0002, 0x0001, 0), MsgType::DInit, 0, &[0; 5]).unwrap();
        assert_eq!(hal.send(&frame, TxMode::Delayed(1 << 20)), Err(HalError::Hpdwarn));
    }

    #[test]
    fn read_frame_parses_header_payload_and_timestamp() {
        let (chip, state) = SimChip::new();
        let mut hal = DwHal::new(chip, PAN_ID, 0x0001, Calibration::default());
        let frame = encode_frame(&Mhr::new(0x0001, 0x0002, 3), MsgType::MConn, 0x11, &[]).unwrap();
        state.borrow_mut().rx_frame = Some((frame.to_vec(), 42));
        let rx = hal.read_frame().unwrap();
        assert_eq!(rx.mhr.src, 0x0002);
        assert_eq!(rx.msg_type(), MsgType::MConn);
        assert_eq!(rx.rx_ts, 42);
    }
}
