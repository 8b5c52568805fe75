//! Build-time knobs and per-device calibration.

/// Milliseconds since boot, supplied by the caller (RTOS tick or test clock).
pub type Instant = fugit::TimerInstantU64<1000>;
/// Millisecond duration to go with [`Instant`].
pub type Duration = fugit::TimerDurationU64<1000>;

/// Neighbour table capacity.
pub const NEIGHBOUR_NUM: usize = 2;

/// Samples required before a distance is published to the EDM.
pub const MIN_D_MEASURES: u32 = 10;

/// Messages processed without a broadcast before the next one is due.
pub const CONN_MSG_TMO: u8 = 10;

/// TWR failures tolerated before the active peer is disconnected.
pub const CONN_MSG_TMO_MAX: u8 = 1;

/// Consecutive radio errors before the controller hard-resets the chip.
pub const DW_ERR_THRESH: u8 = 10;

/// Controller hard resets without a clean exchange before the supervisor
/// gives up and parks in `Err`.
pub const DW_RESET_BUDGET: u8 = 5;

/// Peer inactivity budget, in timer fires.
pub const PEER_CONN_TTL: u8 = 16;

/// Remaining TTL at which a keepalive is owed to a silent peer.
pub const PEER_KEEPALIVE_TTL: u8 = PEER_CONN_TTL / 2;

/// Period of the per-peer inactivity timer.
pub const PEER_TIMER_PERIOD: Duration = Duration::from_ticks(1000);

/// Bound on waiting for a transmit-complete event.
pub const TX_TIMEOUT: Duration = Duration::from_ticks(10);

/// Bound on the comms task waiting for any radio event at all.
pub const CH_TIMEOUT: Duration = Duration::from_ticks(5000);

/// Pause in `Err` before the supervisor attempts the recovery reset.
pub const ERR_COOLDOWN: Duration = Duration::from_ticks(1000);

/// Distance clamp, metres. Values outside mark "unknown".
pub const MIN_DIST: f32 = -999.0;
/// Distance clamp, metres.
pub const MAX_DIST: f32 = 999.0;
/// EDM sentinel for "no measurement yet".
pub const DIST_UNKNOWN: f32 = 10_000.0;

/// PAN identifier shared by the whole fleet.
pub const PAN_ID: u16 = 0xDECA;

/// Hardware receive timeout while waiting for the reply to a
/// wait-for-response send, in microseconds.
pub const W4R_RECV_TMO_US: u32 = 10_000;

/// Minimum spacing between ranging attempts against the same peer.
pub const TWR_INTERVAL: Duration = Duration::from_ticks(250);

/// Scheduled-send lead time for `DInit`, in device time units.
pub const TWR_INIT_DELAY: u64 = 0x0200_0000;

/// Fixed responder turnaround for the scheduled `DResp`, in device time
/// units. Chosen at build time; both ends assume it.
pub const TWR_RESP_DELAY: u64 = 0x0200_0000;

/// DW1000 device time unit, seconds (1 / (128 * 499.2 MHz)).
pub const DW_TIME_UNIT_S: f32 = 1.0 / (128.0 * 499_200_000.0);

/// Speed of light, m/s.
pub const SPEED_OF_LIGHT_M_S: f32 = 299_792_458.0;

/// Per-device calibration. The TWR math reads only this; nothing here is
/// hard-coded in the formula.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Calibration {
    /// TX antenna delay, device time units.
    pub tx_ant_delay: u16,
    /// RX antenna delay, device time units.
    pub rx_ant_delay: u16,
    /// Metres per device time unit of time-of-flight.
    pub tick_to_metre: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            // DW1000 OTP default; replace with the per-board value.
            tx_ant_delay: 16_436,
            rx_ant_delay: 16_436,
            tick_to_metre: SPEED_OF_LIGHT_M_S * DW_TIME_UNIT_S,
        }
    }
}

impl Calibration {
    /// Combined antenna delay removed from a measured round trip.
    pub fn ant_delay_sum(&self) -> u32 {
        self.tx_ant_delay as u32 + self.rx_ant_delay as u32
    }
}
