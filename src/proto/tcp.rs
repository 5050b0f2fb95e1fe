//! TCP analyzer and RTT estimator
//!
//! Two independent measurement methods run on the same session: the VEC
//! spin signal carried in the reserved bits of the data-offset byte, and
//! the timestamp option echo. SYN+ACK packets carry no VEC and are not
//! sampled.

use super::Direction;
use thiserror::Error;

/// TCP fixed header size; options follow up to the data offset.
pub const SIZE_TCP: usize = 20;

/// VEC field mask within the data-offset-and-reserved byte.
pub const VEC_MASK: u8 = 0x0E;
/// VEC field shift.
pub const VEC_SHIFT: u8 = 1;

/// VEC bit: current spin value.
pub const VEC_SPIN: u8 = 0x1;
/// VEC bit: the spin value is valid for measurement.
pub const VEC_VALID: u8 = 0x2;
/// VEC bit: sender marks this packet as a spin edge.
pub const VEC_EDGE: u8 = 0x4;

const FLAG_SYN: u8 = 0x02;
const FLAG_ACK: u8 = 0x10;

const OPT_EOL: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_TIMESTAMP: u8 = 8;
const OPT_TIMESTAMP_LEN: u8 = 10;

/// Parsed TCP fixed header.
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    /// Data offset nibble and reserved bits, as on the wire
    pub data_offset_and_reserved: u8,
    pub flags: u8,
}

impl TcpHeader {
    /// Parse the 20-byte fixed header.
    #[inline]
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < SIZE_TCP {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([b[0], b[1]]),
            dst_port: u16::from_be_bytes([b[2], b[3]]),
            seq: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
            data_offset_and_reserved: b[12],
            flags: b[13],
        })
    }

    /// Full header length in bytes, options included.
    #[inline(always)]
    pub fn header_len(&self) -> usize {
        ((self.data_offset_and_reserved >> 4) as usize) * 4
    }

    /// The 3-bit VEC from the reserved area.
    #[inline(always)]
    pub fn vec(&self) -> u8 {
        (self.data_offset_and_reserved & VEC_MASK) >> VEC_SHIFT
    }

    #[inline(always)]
    pub fn is_syn(&self) -> bool {
        self.flags & FLAG_SYN != 0
    }

    #[inline(always)]
    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }
}

/// Timestamp option values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpTimestamps {
    pub tsval: u32,
    pub tsecr: u32,
}

/// Option area rejected: ill-formed length or overrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("malformed tcp options")]
pub struct BadOptions;

/// Walk the option area (the bytes between the fixed header and the data
/// offset), extracting the timestamp option if present.
pub fn parse_options(opts: &[u8]) -> Result<Option<TcpTimestamps>, BadOptions> {
    let mut ts = None;
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            OPT_EOL => break,
            OPT_NOP => {
                i += 1;
            }
            kind => {
                if i + 1 >= opts.len() {
                    return Err(BadOptions);
                }
                let len = opts[i + 1] as usize;
                if len < 2 || i + len > opts.len() {
                    return Err(BadOptions);
                }
                if kind == OPT_TIMESTAMP {
                    if len != OPT_TIMESTAMP_LEN as usize {
                        return Err(BadOptions);
                    }
                    ts = Some(TcpTimestamps {
                        tsval: u32::from_be_bytes([
                            opts[i + 2],
                            opts[i + 3],
                            opts[i + 4],
                            opts[i + 5],
                        ]),
                        tsecr: u32::from_be_bytes([
                            opts[i + 6],
                            opts[i + 7],
                            opts[i + 8],
                            opts[i + 9],
                        ]),
                    });
                }
                i += len;
            }
        }
    }
    Ok(ts)
}

/// TCP RTT estimator state.
#[derive(Debug, Default)]
pub struct TcpEstimator {
    spin_fwd: Option<bool>,
    spin_rev: Option<bool>,
    edge_time: Option<f64>,
    /// Last recorded forward (tsval, time) sample
    ts_sample: Option<(u32, f64)>,
    last_fwd_seq: Option<u32>,
    last_rtt: Option<f64>,
}

impl TcpEstimator {
    /// Feed one packet's VEC and timestamp observations.
    ///
    /// Returns a fresh RTT sample in seconds when either method completes
    /// a round trip on this packet.
    pub fn update(
        &mut self,
        now: f64,
        dir: Direction,
        vec: u8,
        ts: Option<TcpTimestamps>,
        seq: u32,
    ) -> Option<f64> {
        match dir {
            Direction::Forward => {
                // Ignore segments older than what we already saw; a
                // retransmitted tsval must not restart the clock.
                let seq_ok = self
                    .last_fwd_seq
                    .map_or(true, |s| seq.wrapping_sub(s) as i32 >= 0);
                if seq_ok {
                    self.last_fwd_seq = Some(seq);
                }

                if vec & VEC_VALID != 0 {
                    let spin = vec & VEC_SPIN != 0;
                    let edged = vec & VEC_EDGE != 0 || self.spin_fwd != Some(spin);
                    if edged {
                        self.edge_time = Some(now);
                    }
                    self.spin_fwd = Some(spin);
                }

                if let Some(ts) = ts {
                    if seq_ok && self.ts_sample.map_or(true, |(v, _)| v != ts.tsval) {
                        self.ts_sample = Some((ts.tsval, now));
                    }
                }
                None
            }
            Direction::Reverse => {
                let mut rtt = None;

                if vec & VEC_VALID != 0 {
                    let spin = vec & VEC_SPIN != 0;
                    if self.spin_fwd == Some(spin) && self.spin_rev != Some(spin) {
                        if let Some(edge) = self.edge_time.take() {
                            rtt = Some(now - edge);
                        }
                    }
                    self.spin_rev = Some(spin);
                }

                if let Some(ts) = ts {
                    if let Some((tsval, sent)) = self.ts_sample {
                        if ts.tsecr == tsval {
                            rtt = Some(now - sent);
                            self.ts_sample = None;
                        }
                    }
                }

                if rtt.is_some() {
                    self.last_rtt = rtt;
                }
                rtt
            }
        }
    }

    /// Most recent RTT sample in seconds.
    pub fn last_rtt(&self) -> Option<f64> {
        self.last_rtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let mut b = [0u8; 20];
        b[0..2].copy_from_slice(&5000u16.to_be_bytes());
        b[2..4].copy_from_slice(&80u16.to_be_bytes());
        b[4..8].copy_from_slice(&1234u32.to_be_bytes());
        b[12] = 0x50 | 0x06; // doff 5, VEC bits 011
        b[13] = FLAG_SYN;

        let tcp = TcpHeader::parse(&b).unwrap();
        assert_eq!(tcp.src_port, 5000);
        assert_eq!(tcp.dst_port, 80);
        assert_eq!(tcp.header_len(), 20);
        assert_eq!(tcp.vec(), 0b011);
        assert!(tcp.is_syn());
        assert!(!tcp.is_ack());
    }

    #[test]
    fn test_options_timestamp() {
        // NOP NOP TS(kind=8, len=10, tsval=1000, tsecr=7)
        let mut opts = vec![OPT_NOP, OPT_NOP, OPT_TIMESTAMP, OPT_TIMESTAMP_LEN];
        opts.extend_from_slice(&1000u32.to_be_bytes());
        opts.extend_from_slice(&7u32.to_be_bytes());

        let ts = parse_options(&opts).unwrap().unwrap();
        assert_eq!(ts.tsval, 1000);
        assert_eq!(ts.tsecr, 7);
    }

    #[test]
    fn test_options_no_timestamp() {
        // MSS option only
        let opts = [0x02, 0x04, 0x05, 0xb4];
        assert_eq!(parse_options(&opts).unwrap(), None);
    }

    #[test]
    fn test_options_bad_length() {
        assert!(parse_options(&[0x02, 0x01]).is_err()); // len < 2
        assert!(parse_options(&[0x02, 0x08, 0x00]).is_err()); // overrun
        assert!(parse_options(&[OPT_TIMESTAMP, 0x06, 0, 0, 0, 0]).is_err()); // wrong ts len
    }

    #[test]
    fn test_options_eol_stops() {
        let opts = [OPT_EOL, 0xFF, 0xFF];
        assert_eq!(parse_options(&opts).unwrap(), None);
    }

    #[test]
    fn test_timestamp_rtt() {
        let mut e = TcpEstimator::default();
        let ts = |val, ecr| {
            Some(TcpTimestamps {
                tsval: val,
                tsecr: ecr,
            })
        };

        assert_eq!(e.update(10.0, Direction::Forward, 0, ts(1000, 0), 1), None);
        let rtt = e.update(10.25, Direction::Reverse, 0, ts(500, 1000), 1);
        assert_eq!(rtt, Some(0.25));
        assert_eq!(e.last_rtt(), Some(0.25));

        // Echo consumed; the same tsecr again yields nothing
        assert_eq!(e.update(10.5, Direction::Reverse, 0, ts(501, 1000), 1), None);
    }

    #[test]
    fn test_timestamp_ignores_old_seq() {
        let mut e = TcpEstimator::default();
        let ts = |val| {
            Some(TcpTimestamps {
                tsval: val,
                tsecr: 0,
            })
        };
        e.update(1.0, Direction::Forward, 0, ts(100), 50);
        // Retransmission with an older sequence must not re-record
        e.update(2.0, Direction::Forward, 0, ts(101), 10);
        let rtt = e.update(2.5, Direction::Reverse, 0, Some(TcpTimestamps { tsval: 1, tsecr: 100 }), 1);
        assert_eq!(rtt, Some(1.5));
    }

    #[test]
    fn test_vec_rtt() {
        let mut e = TcpEstimator::default();
        let vec = |spin: bool| VEC_VALID | if spin { VEC_SPIN } else { 0 };

        // Baseline spin 0, then edge to 1 at t=5
        e.update(4.0, Direction::Forward, vec(false), None, 1);
        e.update(4.1, Direction::Reverse, vec(false), None, 1);
        e.update(5.0, Direction::Forward, vec(true), None, 2);
        let rtt = e.update(5.08, Direction::Reverse, vec(true), None, 2);
        assert!((rtt.unwrap() - 0.08).abs() < 1e-9);
        assert!((e.last_rtt().unwrap() - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_vec_invalid_not_sampled() {
        let mut e = TcpEstimator::default();
        e.update(1.0, Direction::Forward, VEC_SPIN, None, 1); // valid bit clear
        assert_eq!(e.update(1.5, Direction::Reverse, VEC_SPIN, None, 1), None);
    }
}
