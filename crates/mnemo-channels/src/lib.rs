//! Mnemo Channels - Delivery Channel Senders
//!
//! This crate provides the concrete delivery channels behind the core
//! [`ChannelSender`](mnemo_core::ChannelSender) trait:
//! - In-app feed (broadcast to connected clients)
//! - Browser / web push (via an HTTP relay)
//! - Email (via an HTTP mail-relay API)
//!
//! [`GuardedSender`] wraps any sender with a named circuit breaker so a
//! flaky provider is cut off instead of slowing every delivery down.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod email;
pub mod guard;
pub mod in_app;
pub mod webhook;

pub use email::{EmailConfig, EmailSender};
pub use guard::GuardedSender;
pub use in_app::{InAppNotification, InAppSender};
pub use webhook::{WebPushConfig, WebPushSender};
