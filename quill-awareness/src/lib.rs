//! # quill-awareness — Presence codec for Quill
//!
//! Binary encoding of ephemeral per-client state (cursors, selections, user
//! profiles) exchanged between editors through the collaboration relay.
//!
//! ## Architecture
//!
//! ```text
//! Editor A                          Editor B
//! ┌────────────┐   update bytes    ┌────────────┐
//! │ Awareness  │ ────────────────► │ Awareness  │
//! │ set_state  │   (via relay)     │ apply      │
//! └─────┬──────┘                   └─────┬──────┘
//!       │ encode_update                  │ decode_update
//!       ▼                                ▼
//!  [count][client clock value]…     keep higher clock
//! ```
//!
//! ## Modules
//!
//! - [`encoding`] — varint / zigzag / fixed-width primitives
//! - [`any`] — marker-tagged dynamic values
//! - [`awareness`] — presence aggregate, update format, rewrite helpers
//!
//! The relay never looks inside states; it only uses [`decode_update`],
//! [`encode_remove_update`] and [`max_clock_for`] to synthesise offline
//! notifications for clients that disconnect.

pub mod any;
pub mod awareness;
pub mod encoding;

pub use any::Any;
pub use awareness::{
    decode_update, encode_entries, encode_remove_update, max_clock_for, modify_update,
    Awareness, AwarenessChanges, AwarenessEntry, ClientId, ClientMeta,
};
pub use encoding::{DecodeError, Decoder, Encoder};
