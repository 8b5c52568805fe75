//! Radio event causes, one bit per `SYS_STATUS` cause.
//!
//! The bit positions match the chip's status register, so the ISR-side
//! translation is a masked copy. `DW_COMM_OK` is synthetic: the controller
//! raises it towards the comms engine when an exchange completes cleanly.

use bitflags::bitflags;

bitflags! {
    /// Event causes latched out of the chip's status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SysEvents: u32 {
        const CPLOCK   = 1 << 1;
        const ESYNCR   = 1 << 2;
        const AAT      = 1 << 3;
        const TXFRB    = 1 << 4;
        const TXPRS    = 1 << 5;
        const TXPHS    = 1 << 6;
        const TXFRS    = 1 << 7;
        const RXPRD    = 1 << 8;
        const RXFSDD   = 1 << 9;
        const LDEDONE  = 1 << 10;
        const RXPHD    = 1 << 11;
        const RXPHE    = 1 << 12;
        const RXDFR    = 1 << 13;
        const RXFCG    = 1 << 14;
        const RXFCE    = 1 << 15;
        const RXRFSL   = 1 << 16;
        const RXRFTO   = 1 << 17;
        const LDEERR   = 1 << 18;
        const RXOVRR   = 1 << 20;
        const RXPTO    = 1 << 21;
        const GPIOIRQ  = 1 << 22;
        const SLP2INIT = 1 << 23;
        const RFPLLLL  = 1 << 24;
        const CPLLLL   = 1 << 25;
        const RXSFDTO  = 1 << 26;
        const HPDWARN  = 1 << 27;
        const TXBERR   = 1 << 28;
        const AFFREJ   = 1 << 29;

        /// Synthetic: exchange completed cleanly, frame handed upstream.
        const DW_COMM_OK = 1 << 30;

        /// Any receive error that is retried by re-arming the receiver.
        const RXERR = Self::RXPHE.bits()
            | Self::RXFCE.bits()
            | Self::RXRFSL.bits()
            | Self::RXSFDTO.bits()
            | Self::AFFREJ.bits()
            | Self::LDEERR.bits();

        /// Structural faults that force a controller reset.
        const HARDFAULT = Self::RXOVRR.bits()
            | Self::RFPLLLL.bits()
            | Self::CPLLLL.bits()
            | Self::TXBERR.bits();
    }
}

impl SysEvents {
    /// True if any retriable receive error bit is set.
    pub fn rx_error(self) -> bool {
        self.intersects(Self::RXERR)
    }

    /// True if a receive timed out (frame-wait or preamble-detect timeout).
    pub fn rx_timeout(self) -> bool {
        self.intersects(Self::RXRFTO | Self::RXPTO)
    }
}
