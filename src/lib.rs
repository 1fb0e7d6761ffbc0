//! cfshare: ephemeral public HTTPS exposure for local ports and files.
//!
//! cfshare turns a local TCP service or a set of files/directories into a
//! temporary public HTTPS endpoint by orchestrating a local origin (reverse
//! proxy or static file server), an external quick-tunnel agent, and a
//! lifetime-bounded session whose state, logs, and audit trail persist
//! locally.
//!
//! # Architecture
//!
//! - **Policy**: typed, clamped policy merged from defaults, runtime config
//!   and `policy.json`, plus a `.gitignore`-semantics path matcher
//! - **Access**: token/basic authorization, path allow-lists, per-IP rate
//!   limiting, enforced at the origin
//! - **Origins**: embedded hyper servers; a reverse proxy for port
//!   exposures, a static file server (explorer, ranges, zip bundles) for
//!   file exposures
//! - **Tunnel**: supervision of the external agent, readiness detection on
//!   its output, bounded retry, TERM/KILL teardown
//! - **Session**: the `ExposureManager` state machine with bring-up, TTL
//!   timers, reaper, quota, and a single guarded terminal transition
//! - **Audit**: append-only JSONL events, live-table snapshots, GC
//!
//! The lifecycle model is fail-closed: any termination cause (TTL, client
//! stop, agent exit, download quota) releases every OS resource the
//! session owns exactly once.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod access;
pub mod audit;
pub mod cli;
pub mod netutil;
pub mod origin;
pub mod policy;
pub mod runtime;
pub mod session;
pub mod tunnel;
pub mod workspace;
