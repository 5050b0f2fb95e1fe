//! Shard statistics
//!
//! Plain per-shard counters; a shard is single-threaded so there is
//! nothing to synchronize. Counters are observability only and never
//! influence forwarding.

use crate::flow::ProtocolVariant;
use crate::pipeline::SkipReason;

/// Per-shard counters.
#[derive(Debug, Default, Clone)]
pub struct ShardStats {
    /// Packets handed to the pipeline
    pub packets: u64,
    /// Packets that reached the rewrite step
    pub rewritten: u64,
    /// Sessions created
    pub sessions_created: u64,
    /// Sessions expired by the timer wheel
    pub sessions_expired: u64,
    /// RTT samples completed, per protocol
    pub rtt_samples_tcp: u64,
    pub rtt_samples_quic: u64,
    pub rtt_samples_plus: u64,
    /// Packets forwarded uninspected, per skip reason
    pub skip_short_header: u64,
    pub skip_unknown_destination: u64,
    pub skip_unsupported: u64,
    pub skip_bad_options: u64,
    pub skip_rewrite_mismatch: u64,
    pub skip_pool_exhausted: u64,
}

impl ShardStats {
    #[inline(always)]
    pub fn record_packet(&mut self) {
        self.packets += 1;
    }

    #[inline(always)]
    pub fn record_rewrite(&mut self) {
        self.rewritten += 1;
    }

    #[inline(always)]
    pub fn record_session_created(&mut self) {
        self.sessions_created += 1;
    }

    #[inline(always)]
    pub fn record_session_expired(&mut self) {
        self.sessions_expired += 1;
    }

    #[inline(always)]
    pub fn record_rtt_sample(&mut self, variant: ProtocolVariant) {
        match variant {
            ProtocolVariant::Tcp => self.rtt_samples_tcp += 1,
            ProtocolVariant::Quic => self.rtt_samples_quic += 1,
            ProtocolVariant::Plus => self.rtt_samples_plus += 1,
        }
    }

    #[inline(always)]
    pub fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::ShortHeader => self.skip_short_header += 1,
            SkipReason::UnknownDestination => self.skip_unknown_destination += 1,
            SkipReason::Unsupported => self.skip_unsupported += 1,
            SkipReason::BadOptions => self.skip_bad_options += 1,
            SkipReason::RewriteMismatch => self.skip_rewrite_mismatch += 1,
            SkipReason::PoolExhausted => self.skip_pool_exhausted += 1,
        }
    }

    /// Total skipped packets across all reasons.
    pub fn skipped(&self) -> u64 {
        self.skip_short_header
            + self.skip_unknown_destination
            + self.skip_unsupported
            + self.skip_bad_options
            + self.skip_rewrite_mismatch
            + self.skip_pool_exhausted
    }

    /// Total completed RTT samples.
    pub fn rtt_samples(&self) -> u64 {
        self.rtt_samples_tcp + self.rtt_samples_quic + self.rtt_samples_plus
    }
}
