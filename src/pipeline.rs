//! Per-packet inspection pipeline
//!
//! Parse → session lookup/create → RTT estimation → destination rewrite →
//! checksum recomputation → trace. Runs to completion per packet; the
//! timer wheel is advanced at the packet boundary. Every packet is
//! forwarded: a failed check skips inspection for that packet, restores
//! the read cursor and moves on. Nothing is dropped here.

use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::{debug, trace};

use crate::buffer::PacketBuffer;
use crate::checksum;
use crate::config::{DstMap, PipelineConfig};
use crate::flow::{FlowKey, ProtocolVariant, Session, SessionState, SessionTable};
use crate::proto::{self, plus, quic, tcp, Direction, Estimator, Ipv4Header, UdpHeader};
use crate::stats::ShardStats;
use crate::timer::TimerWheel;

/// Why a packet was forwarded without (full) inspection.
///
/// All of these are local to one packet and non-fatal: the packet still
/// goes to the next stage, with its bytes untouched past whatever was
/// already legitimately rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SkipReason {
    /// A length check failed during parsing
    #[error("truncated header")]
    ShortHeader,
    /// First packet of a flow whose destination port is not mapped
    #[error("destination port not mapped")]
    UnknownDestination,
    /// IPv6, IP options, or an encoding we do not inspect
    #[error("unsupported version or encoding")]
    Unsupported,
    /// TCP option area rejected
    #[error("malformed tcp options")]
    BadOptions,
    /// Keyed to a session but matches neither flow direction
    #[error("neither flow direction matches")]
    RewriteMismatch,
    /// Session pool full on the first-packet path
    #[error("session pool exhausted")]
    PoolExhausted,
}

/// Structured record handed to the trace sink for traced buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub src_port: u16,
    pub dst_port: u16,
    /// Source address as rewritten
    pub new_src_ip: Ipv4Addr,
    /// Destination address as rewritten
    pub new_dst_ip: Ipv4Addr,
    pub variant: ProtocolVariant,
    pub pkt_count: u32,
}

/// Receiver for per-packet trace records.
pub trait TraceSink {
    fn record(&mut self, record: &TraceRecord);
}

/// Parsed transport information carried between pipeline steps.
enum L4 {
    Tcp {
        vec: u8,
        ts: Option<tcp::TcpTimestamps>,
        seq: u32,
        /// VEC/TS sampling enabled (clear on SYN+ACK or bad options)
        measure: bool,
        bad_options: bool,
    },
    Quic {
        header: quic::QuicHeader,
    },
    Plus {
        header: plus::PlusHeader,
    },
}

struct Parsed {
    src_port: u16,
    dst_port: u16,
    l4: L4,
}

impl Parsed {
    fn variant(&self) -> ProtocolVariant {
        match self.l4 {
            L4::Tcp { .. } => ProtocolVariant::Tcp,
            L4::Quic { .. } => ProtocolVariant::Quic,
            L4::Plus { .. } => ProtocolVariant::Plus,
        }
    }
}

/// One shard's inspection pipeline.
///
/// Owns its session table, timer wheel and counters outright; the host
/// steers both directions of a flow to the same shard.
pub struct Pipeline {
    config: PipelineConfig,
    dst_map: DstMap,
    table: SessionTable,
    wheel: TimerWheel,
    stats: ShardStats,
    sink: Option<Box<dyn TraceSink>>,
    /// Scratch for expired session indices, reused across packets
    expired: Vec<u32>,
}

impl Pipeline {
    /// Build a pipeline. `now` anchors the timer wheel.
    pub fn new(config: PipelineConfig, dst_map: DstMap, now: f64) -> Self {
        let max_sessions = config.max_sessions;
        Self {
            table: SessionTable::new(max_sessions),
            wheel: TimerWheel::new(max_sessions, now),
            dst_map,
            config,
            stats: ShardStats::default(),
            sink: None,
            expired: Vec::with_capacity(64),
        }
    }

    /// Install the trace sink. Records are emitted only for buffers whose
    /// traced flag is set.
    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.sink = Some(sink);
    }

    /// Shard counters.
    pub fn stats(&self) -> &ShardStats {
        &self.stats
    }

    /// Live session count.
    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    /// Resolve a flow key to its session, if tracked.
    pub fn lookup_session(&self, key: FlowKey) -> Option<&Session> {
        self.table.get(self.table.lookup(key)?)
    }

    /// Process a frame of buffers in host delivery order.
    pub fn process_frame(&mut self, frame: &mut [PacketBuffer], now: f64) {
        for buf in frame {
            self.process(buf, now);
        }
    }

    /// Process one packet. The buffer comes back with its read cursor
    /// where it was, whatever happened in between.
    pub fn process(&mut self, buf: &mut PacketBuffer, now: f64) {
        self.expire_sessions(now);
        self.stats.record_packet();

        let mut buf = buf.cursor_guard();
        if let Err(reason) = self.inspect(&mut buf, now) {
            self.stats.record_skip(reason);
        }
    }

    fn expire_sessions(&mut self, now: f64) {
        self.expired.clear();
        self.wheel.advance(now, &mut self.expired);
        for i in 0..self.expired.len() {
            let handle = self.expired[i];
            if let Some(session) = self.table.remove(handle) {
                self.stats.record_session_expired();
                debug!(
                    variant = session.variant.name(),
                    pkt_count = session.pkt_count,
                    "session expired"
                );
            }
        }
    }

    fn inspect(&mut self, buf: &mut PacketBuffer, now: f64) -> Result<(), SkipReason> {
        let ip_start = buf.cursor();

        let ip = Ipv4Header::parse(buf.current()).ok_or(SkipReason::ShortHeader)?;
        if ip.version() != 4 || ip.header_len() != proto::SIZE_IP4 {
            return Err(SkipReason::Unsupported);
        }
        buf.advance(proto::SIZE_IP4);

        let parsed = match ip.protocol {
            proto::IPPROTO_UDP => self.parse_udp(buf)?,
            proto::IPPROTO_TCP => parse_tcp(buf)?,
            _ => return Err(SkipReason::Unsupported),
        };

        let (fwd_key, rev_probe) = flow_keys(&ip, &parsed);
        let handle = match self
            .table
            .lookup(fwd_key)
            .or_else(|| self.table.lookup(rev_probe))
        {
            Some(handle) => handle,
            None => self.create_session(&ip, &parsed, fwd_key)?,
        };

        // Handles come straight from lookup or create; a miss here would
        // mean the key slots and the pool disagree.
        let session = match self.table.get_mut(handle) {
            Some(session) => session,
            None => return Err(SkipReason::RewriteMismatch),
        };

        let dir = Direction::of(parsed.src_port, session.init_src_port);
        let rtt = match (&mut session.estimator, &parsed.l4) {
            (
                Estimator::Tcp(e),
                L4::Tcp {
                    vec,
                    ts,
                    seq,
                    measure: true,
                    ..
                },
            ) => e.update(now, dir, *vec, *ts, *seq),
            (Estimator::Quic(e), L4::Quic { header }) => {
                e.update(now, dir, header.spin, header.packet_number)
            }
            (Estimator::Plus(e), L4::Plus { header }) => {
                e.update(now, dir, header.psn, header.pse)
            }
            _ => None,
        };
        let variant = session.variant;
        if let Some(rtt) = rtt {
            self.stats.record_rtt_sample(variant);
            trace!(rtt_secs = rtt, variant = variant.name(), "rtt sample");
        }

        // The one in-place payload mutation: ahead of the checksum pass so
        // the UDP checksum covers the updated byte.
        if let L4::Plus { header } = &parsed.l4 {
            if header.extended() {
                plus::bump_hop_count(buf.current_mut());
            }
        }

        session.pkt_count = session.pkt_count.wrapping_add(1);
        let pkt_count = session.pkt_count;

        // NAT-like translation: forward traffic is steered to the backend,
        // return traffic gets the address the initiator expects back.
        let (new_src, new_dst) = if ip.src == session.init_src_ip {
            (ip.src, session.new_dst_ip)
        } else if ip.src == session.new_dst_ip {
            (session.orig_dst_ip, session.init_src_ip)
        } else {
            return Err(SkipReason::RewriteMismatch);
        };
        let state = session.state;

        let bytes = buf.bytes_mut();
        bytes[ip_start + 12..ip_start + 16].copy_from_slice(&new_src.to_be_bytes());
        bytes[ip_start + 16..ip_start + 20].copy_from_slice(&new_dst.to_be_bytes());

        let l4_start = ip_start + proto::SIZE_IP4;
        let (min_l4, csum_off) = if ip.protocol == proto::IPPROTO_TCP {
            (tcp::SIZE_TCP, 16)
        } else {
            (proto::SIZE_UDP, 6)
        };
        let l4_end = (ip_start + ip.total_len as usize).clamp(l4_start + min_l4, bytes.len());
        let csum = checksum::l4_checksum(
            new_src,
            new_dst,
            ip.protocol,
            &bytes[l4_start..l4_end],
            csum_off,
        );
        let csum = if ip.protocol == proto::IPPROTO_UDP && csum == 0 {
            0xFFFF
        } else {
            csum
        };
        bytes[l4_start + csum_off..l4_start + csum_off + 2].copy_from_slice(&csum.to_be_bytes());

        let ip_csum = checksum::ipv4_header_checksum(&bytes[ip_start..ip_start + proto::SIZE_IP4]);
        bytes[ip_start + 10..ip_start + 12].copy_from_slice(&ip_csum.to_be_bytes());

        self.stats.record_rewrite();

        match state {
            SessionState::Active => self.wheel.update(handle, self.config.timeout_ticks),
            SessionState::Error => {}
        }

        if buf.is_traced() {
            if let Some(sink) = self.sink.as_deref_mut() {
                sink.record(&TraceRecord {
                    src_port: parsed.src_port,
                    dst_port: parsed.dst_port,
                    new_src_ip: Ipv4Addr::from(new_src),
                    new_dst_ip: Ipv4Addr::from(new_dst),
                    variant,
                    pkt_count,
                });
            }
        }

        Ok(())
    }

    fn parse_udp(&self, buf: &mut PacketBuffer) -> Result<Parsed, SkipReason> {
        let udp = UdpHeader::parse(buf.current()).ok_or(SkipReason::ShortHeader)?;
        buf.advance(proto::SIZE_UDP);

        let l4 = if udp.src_port == self.config.quic_port || udp.dst_port == self.config.quic_port
        {
            let header = quic::parse(buf.current()).map_err(|e| match e {
                quic::QuicParseError::Truncated => SkipReason::ShortHeader,
                quic::QuicParseError::UnknownPacketNumber => SkipReason::Unsupported,
            })?;
            L4::Quic { header }
        } else {
            let header = plus::PlusHeader::parse(buf.current()).ok_or(SkipReason::ShortHeader)?;
            if !header.magic_ok(self.config.plus_magic) {
                // Plain UDP falls through uninspected.
                return Err(SkipReason::Unsupported);
            }
            L4::Plus { header }
        };

        Ok(Parsed {
            src_port: udp.src_port,
            dst_port: udp.dst_port,
            l4,
        })
    }

    fn create_session(
        &mut self,
        ip: &Ipv4Header,
        parsed: &Parsed,
        fwd_key: FlowKey,
    ) -> Result<u32, SkipReason> {
        // A packet with a rejected option area never opens a flow.
        if let L4::Tcp {
            bad_options: true, ..
        } = parsed.l4
        {
            return Err(SkipReason::BadOptions);
        }

        let new_dst_ip = self
            .dst_map
            .get(parsed.dst_port)
            .ok_or(SkipReason::UnknownDestination)?;

        let variant = parsed.variant();
        let handle = self
            .table
            .create(fwd_key, variant)
            .map_err(|_| SkipReason::PoolExhausted)?;

        if let Some(session) = self.table.get_mut(handle) {
            session.init_src_ip = ip.src;
            session.init_src_port = parsed.src_port;
            session.orig_dst_ip = ip.dst;
            session.new_dst_ip = new_dst_ip;
            match (&mut session.estimator, &parsed.l4) {
                (Estimator::Quic(e), L4::Quic { header }) => {
                    e.connection_id = header.connection_id.unwrap_or(0);
                }
                (Estimator::Plus(e), L4::Plus { header }) => {
                    e.cat = header.cat;
                }
                _ => {}
            }
        }

        // Return traffic will come from the backend we steer to; alias the
        // session under the reverse key so it resolves there too.
        let rev_key = match &parsed.l4 {
            L4::Plus { header } => FlowKey::with_cat(
                0,
                new_dst_ip,
                parsed.src_port,
                parsed.dst_port,
                ip.protocol,
                header.cat,
            ),
            _ => FlowKey::new(0, new_dst_ip, parsed.src_port, parsed.dst_port, ip.protocol),
        };
        if self.table.alias(rev_key, handle).is_err() {
            self.table.remove(handle);
            return Err(SkipReason::PoolExhausted);
        }

        self.wheel.start(handle, self.config.timeout_ticks);
        self.stats.record_session_created();
        debug!(
            src = %Ipv4Addr::from(ip.src),
            dst_port = parsed.dst_port,
            backend = %Ipv4Addr::from(new_dst_ip),
            variant = variant.name(),
            "session created"
        );
        Ok(handle)
    }
}

/// Forward key for this packet, and the reverse-form probe that return
/// traffic from the rewritten backend resolves under.
fn flow_keys(ip: &Ipv4Header, parsed: &Parsed) -> (FlowKey, FlowKey) {
    match &parsed.l4 {
        L4::Plus { header } => (
            FlowKey::with_cat(
                ip.src,
                ip.dst,
                parsed.src_port,
                parsed.dst_port,
                ip.protocol,
                header.cat,
            ),
            FlowKey::with_cat(
                0,
                ip.src,
                parsed.dst_port,
                parsed.src_port,
                ip.protocol,
                header.cat,
            ),
        ),
        _ => (
            FlowKey::new(ip.src, ip.dst, parsed.src_port, parsed.dst_port, ip.protocol),
            FlowKey::new(0, ip.src, parsed.dst_port, parsed.src_port, ip.protocol),
        ),
    }
}

fn parse_tcp(buf: &mut PacketBuffer) -> Result<Parsed, SkipReason> {
    let header = tcp::TcpHeader::parse(buf.current()).ok_or(SkipReason::ShortHeader)?;

    let hdr_len = header.header_len();
    let (ts, bad_options) = if hdr_len < tcp::SIZE_TCP || buf.current().len() < hdr_len {
        (None, true)
    } else {
        match tcp::parse_options(&buf.current()[tcp::SIZE_TCP..hdr_len]) {
            Ok(ts) => (ts, false),
            Err(_) => (None, true),
        }
    };
    buf.advance(tcp::SIZE_TCP);

    // SYN+ACK carries no usable VEC.
    let measure = !bad_options && !(header.is_syn() && header.is_ack());

    Ok(Parsed {
        src_port: header.src_port,
        dst_port: header.dst_port,
        l4: L4::Tcp {
            vec: header.vec(),
            ts,
            seq: header.seq,
            measure,
            bad_options,
        },
    })
}
