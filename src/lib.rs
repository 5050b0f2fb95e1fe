//! spinpath: passive on-path RTT measurement dataplane
//!
//! An in-path middlebox core that estimates round-trip time on transit
//! flows from per-protocol latency signals, steers each flow to a
//! configured backend with a NAT-like destination rewrite, and forwards
//! every packet.
//!
//! ```text
//!            ┌───────────────────────────────────────────────┐
//!            │                  PIPELINE                     │
//!            │                                               │
//!  frame ──▶ │  parse ──▶ session ──▶ estimate ──▶ rewrite   │ ──▶ ip4-lookup
//!            │  IPv4      lookup/     TCP VEC+TS   dst / src │
//!            │  UDP|TCP   create      QUIC spin    + csums   │
//!            │  QUIC|PLUS   │         PLUS PSN/PSE           │
//!            │              ▼                                │
//!            │        session table ◀── timer wheel          │
//!            │        (dual-key)        (100 ms ticks)       │
//!            └───────────────────────────────────────────────┘
//! ```
//!
//! # Model
//!
//! - **Run to completion.** One packet at a time, no suspension points;
//!   the timer wheel advances at the packet boundary.
//! - **Shard ownership.** Each pipeline instance owns its session table,
//!   pool and wheel outright. Multiple instances require the host to
//!   steer both directions of a flow to the same shard; nothing is shared.
//! - **Never drop.** Every skip condition forwards the packet unchanged
//!   with the read cursor restored.
//!
//! # Signals
//!
//! | Family | Signal | Method |
//! |--------|--------|--------|
//! | TCP  | VEC reserved bits + timestamp option | spin edge / tsecr echo |
//! | QUIC | spin bit (early draft wire image)    | edge reflection |
//! | PLUS | PSN/PSE serial echo                  | serial round trip |

pub mod buffer;
pub mod checksum;
pub mod config;
pub mod flow;
pub mod pipeline;
pub mod proto;
pub mod stats;
pub mod timer;

pub use buffer::PacketBuffer;
pub use config::{DstMap, DstMapEntry, PipelineConfig};
pub use flow::{FlowKey, ProtocolVariant, Session, SessionState, SessionTable};
pub use pipeline::{Pipeline, SkipReason, TraceRecord, TraceSink};
pub use stats::ShardStats;
pub use timer::{TimerWheel, TICK_SECS, WHEEL_SLOTS};
