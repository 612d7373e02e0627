#![warn(missing_docs)]
/*! ISO/IEC 14443 Type A protocol engine.

This crate drives a radio front-end (a logic fabric that delivers
demodulated bit samples at the subcarrier clock) so a host can act as a
contactless READER, impersonate a TAG, SNIFF live exchanges, and run the
classic MIFARE Classic nonce attacks (darkside and the reader-attack
collector on the emulated tag).

Everything above the air interface (serial CLI, GUI, USB transport,
firmware plumbing) lives elsewhere; this is only the protocol core.

# Architecture overview

Samples flow from the fabric through one of the two line decoders into the
mode logic, and back out through an encoder and the timed transmitter:

```text
         [ Logic fabric ]
               ↓
        [ Sample stream ]
               ↓
  [ Miller | Manchester decoder ]
               ↓
 [ frame + parity + timestamps ]
               ↓
 [ reader | emulator | sniffer ]
               ↓
  [ reader | tag symbol encoder ]
               ↓
      [ Timed transceiver ]
               ↓
         [ Logic fabric ]
```

The trace logger sits on every frame in and out.

Each mode owns its session objects (decoders, encoder buffer, timing
state); nothing in the core is process-global. The fabric itself is a
trait, so the test suite runs the whole engine against a software fabric
(see [`sim`]).
*/

pub mod arena;
pub mod command;
pub mod crc;
pub mod crypto1;
pub mod darkside;
pub mod dma;
pub mod emulator;
pub mod fabric;
pub mod frame;
pub mod manchester;
pub mod miller;
pub mod parity;
pub mod reader;
pub mod reader_encoder;
pub mod sim;
pub mod sniffer;
pub mod symbols;
pub mod tag_encoder;
pub mod timing;
pub mod trace;
pub mod transceiver;

pub use frame::{Direction, Frame};

/// Why an attack driver gave up, surfaced to the host as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum AttackFailure {
    /// The tag nonces do not repeat on a fixed clock.
    UnpredictablePrng,
    /// Sync was attempted too many times without locking on.
    UnstablePrng,
    /// All 256 parities tried without a single NACK; the card does not leak.
    NoNack,
}

impl std::fmt::Display for AttackFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttackFailure::UnpredictablePrng => write!(f, "unpredictable PRNG"),
            AttackFailure::UnstablePrng => write!(f, "unstable PRNG timing"),
            AttackFailure::NoNack => write!(f, "card never sent a NACK"),
        }
    }
}

/// Protocol engine error.
///
/// Nothing in the core panics; every failure is either recovered locally
/// (decoder desync, collision during anticollision) or surfaced as one of
/// these to the host handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No tag answer within the current frame waiting time.
    #[error("receive timed out")]
    Timeout,
    /// ATQA advertises a proprietary anticollision scheme.
    #[error("tag uses proprietary anticollision")]
    ProprietaryAnticollision,
    /// The peer sent something the protocol state does not allow.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// Field disappeared while emulating.
    #[error("reader field lost")]
    FieldLost,
    /// An attack driver gave up.
    #[error("attack gave up: {0}")]
    AttackGaveUp(AttackFailure),
    /// Circular sample buffer wrapped without consumer progress. Fatal for
    /// the mode; the caller must tear the mode down.
    #[error("sample ring overrun")]
    BufferOverrun,
    /// A bounded arena could not hold what a mode needs at entry.
    #[error("arena exhausted: {0}")]
    ArenaExhausted(&'static str),
    /// Operator pressed the button; the mode returned cleanly.
    #[error("cancelled by button")]
    Cancelled,
}

impl From<std::array::TryFromSliceError> for Error {
    fn from(_: std::array::TryFromSliceError) -> Self {
        Error::Protocol("truncated field")
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
