//! Local Euclidean distance matrix of the neighbourhood.
//!
//! Row/column `i` belongs to `addrs[i]`; slot 0 is always the own address.
//! The matrix is kept symmetric by construction and `DIST_UNKNOWN` marks
//! pairs nobody has measured yet.

use crate::config::{DIST_UNKNOWN, MAX_DIST, MIN_DIST, NEIGHBOUR_NUM};
use crate::mac::FrameError;
use crate::peers::ADDR_UNUSED;

/// Side length of the matrix: the node itself plus its neighbours.
pub const EDM_DIM: usize = NEIGHBOUR_NUM + 1;

/// Wire size of a serialised snapshot (addresses, then row-major floats).
pub const EDM_SNAPSHOT_LEN: usize = EDM_DIM * 2 + EDM_DIM * EDM_DIM * 4;

#[derive(Debug, Clone)]
pub struct Edm {
    addrs: [u16; EDM_DIM],
    dist: [[f32; EDM_DIM]; EDM_DIM],
}

impl Edm {
    pub fn new(own_addr: u16) -> Self {
        let mut edm = Self {
            addrs: [ADDR_UNUSED; EDM_DIM],
            dist: [[DIST_UNKNOWN; EDM_DIM]; EDM_DIM],
        };
        edm.addrs[0] = own_addr;
        for i in 0..EDM_DIM {
            edm.dist[i][i] = 0.0;
        }
        edm
    }

    pub fn own_addr(&self) -> u16 {
        self.addrs[0]
    }

    fn index_of(&self, addr: u16) -> Option<usize> {
        if addr == ADDR_UNUSED {
            return None;
        }
        self.addrs.iter().position(|&a| a == addr)
    }

    /// Index of `addr`, claiming a free slot if it is new.
    fn claim(&mut self, addr: u16) -> Option<usize> {
        if let Some(i) = self.index_of(addr) {
            return Some(i);
        }
        if addr == ADDR_UNUSED {
            return None;
        }
        let free = self.addrs.iter().position(|&a| a == ADDR_UNUSED)?;
        self.addrs[free] = addr;
        Some(free)
    }

    /// Distance between two addresses, `DIST_UNKNOWN` if untracked.
    pub fn get_distance(&self, a: u16, b: u16) -> f32 {
        match (self.index_of(a), self.index_of(b)) {
            (Some(i), Some(j)) => self.dist[i][j],
            _ => DIST_UNKNOWN,
        }
    }

    /// Store a distance for both orders of the pair. Out-of-range values and
    /// untrackable addresses are dropped.
    pub fn set_distance(&mut self, a: u16, b: u16, d: f32) {
        if !(MIN_DIST..=MAX_DIST).contains(&d) {
            return;
        }
        let (Some(i), Some(j)) = (self.claim(a), self.claim(b)) else {
            return;
        };
        self.dist[i][j] = d;
        self.dist[j][i] = d;
    }

    /// Drop a neighbour: free its slot and forget every pair involving it.
    pub fn clear_addr(&mut self, addr: u16) {
        let Some(i) = self.index_of(addr) else {
            return;
        };
        if i == 0 {
            return;
        }
        self.addrs[i] = ADDR_UNUSED;
        for j in 0..EDM_DIM {
            self.dist[i][j] = DIST_UNKNOWN;
            self.dist[j][i] = DIST_UNKNOWN;
        }
        self.dist[i][i] = 0.0;
    }

    /// Serialise for a `DReq` body.
    pub fn encode_snapshot(&self, out: &mut [u8]) -> usize {
        let mut n = 0;
        for a in &self.addrs {
            out[n..n + 2].copy_from_slice(&a.to_le_bytes());
            n += 2;
        }
        for row in &self.dist {
            for d in row {
                out[n..n + 4].copy_from_slice(&d.to_le_bytes());
                n += 4;
            }
        }
        n
    }

    /// Fold a peer's snapshot into this matrix. Only third-party pairs are
    /// taken; rows involving the own address stay under local control.
    pub fn merge_snapshot(&mut self, raw: &[u8]) -> Result<(), FrameError> {
        if raw.len() < EDM_SNAPSHOT_LEN {
            return Err(FrameError::BadBody);
        }
        let mut addrs = [0u16; EDM_DIM];
        for (i, a) in addrs.iter_mut().enumerate() {
            *a = u16::from_le_bytes([raw[i * 2], raw[i * 2 + 1]]);
        }
        let floats = &raw[EDM_DIM * 2..];
        for i in 0..EDM_DIM {
            for j in (i + 1)..EDM_DIM {
                let (a, b) = (addrs[i], addrs[j]);
                if a == ADDR_UNUSED || b == ADDR_UNUSED {
                    continue;
                }
                if a == self.own_addr() || b == self.own_addr() {
                    continue;
                }
                let off = (i * EDM_DIM + j) * 4;
                let d = f32::from_le_bytes([
                    floats[off],
                    floats[off + 1],
                    floats[off + 2],
                    floats[off + 3],
                ]);
                if (MIN_DIST..=MAX_DIST).contains(&d) {
                    self.set_distance(a, b, d);
                }
            }
        }
        Ok(())
    }
}
