//! Setu - wire protocol between the hand-held controller and the flight controller
//!
//! Every message is a single text frame: a short uppercase tag followed by
//! zero or more fields, all joined with `|`.
//!
//! ```text
//! CMD|register_ip
//! STAINFO|10.0.0.5|9192
//! RJ|0.25|-0.5
//! ```
//!
//! The separator is never escaped. Callers are responsible for keeping it out
//! of field values ([`Frame::new`] rejects it, [`encode`] does not check).
//!
//! ## Modules
//!
//! - [`frame`]: encode/decode and tag matching
//! - [`vocabulary`]: tag constants and the command table
//! - [`wire`]: stream framing over byte streams (`Line` or legacy `Raw`)

pub mod error;
pub mod frame;
pub mod vocabulary;
pub mod wire;

pub use error::{ProtoError, Result};
pub use frame::{Frame, SEPARATOR, decode, encode, has_tag, status_bit};
pub use vocabulary::{Access, CommandName};
pub use wire::{Framer, Framing, MAX_FRAME_LEN};
