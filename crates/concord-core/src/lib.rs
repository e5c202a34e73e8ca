//! # concord-core
//!
//! Core shared library for concord nodes: the frame codec, the message
//! codec built on it, TCP helpers and the mastership ring.

pub mod codec;
pub mod frame;
pub mod net;
pub mod ring;

pub use codec::{MessageReader, MessageWriter};
pub use frame::{FrameReader, FrameWriter};
pub use ring::MasterRing;
