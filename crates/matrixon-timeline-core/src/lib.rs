//! Matrixon Timeline Core Library
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.11.0-alpha
//!
//! Shared vocabulary of the Matrixon room timeline engine: the event and
//! token types that flow between the engine and its collaborators, the
//! collaborator contracts (transport and decryption), the error taxonomy and
//! the engine configuration.
//!
//! # Features
//! - Timeline events, pagination tokens and sync/page/context payloads
//! - `Transport` and `Decryptor` collaborator traits
//! - `TimelineError` / `TransportError` taxonomy
//! - `TimelineConfig`
//!
//! # Examples
//! ```rust
//! use matrixon_timeline_core::{Direction, Token};
//!
//! let token = Token::new("t42-7");
//! assert_eq!(token.as_str(), "t42-7");
//! assert_eq!(Direction::Backward.reverse(), Direction::Forward);
//! ```

pub mod config;
pub mod error;
pub mod traits;
pub mod types;
pub mod utils;

pub use config::TimelineConfig;
pub use error::{Result, TimelineError, TransportError};
pub use traits::{decrypt_or_mark, Decryptor, NoopDecryptor, Transport};
pub use types::{
    ChunkId, ContextResponse, DecryptionFailure, DiffOrigin, Direction, Ephemeral, Event,
    JoinedRoomUpdate, LocalDraft, PageResponse, Relation, RelationKind, RoomAccountData,
    SendState, StateChange, SyncResponse, TagInfo, TimelineDiff, TimelineSlice, Token,
    Superseded, Unsigned,
};
