//! SIP session controller: one softphone per configured extension,
//! auto-answered inbound calls, a call-local turn engine, and the takeover
//! swap that replaces the AI audio producer with a bidirectional room bridge
//! while the call stays media-active.
//!
//! The SIP user agent itself is an external collaborator behind the
//! [`stack::SipStack`] contract; its callbacks arrive on foreign threads and
//! are marshaled onto the controller's single event loop through an mpsc
//! queue — nothing here shares mutable session state across threads.

pub mod bridge;
pub mod controller;
pub mod error;
pub mod registration;
pub mod stack;

pub use bridge::AudioBridge;
pub use controller::{CallInfo, SipControllerHandle, SipSessionController};
pub use error::{Result, SipError};
pub use stack::{AccountConfig, AccountId, CallHandle, CallMediaBundle, SipEvent, SipStack};
