//! # dotclaw-channels
//!
//! The seam between the host and messaging providers. Defines the
//! [`Provider`] capability trait (send/edit/delete, media, lifecycle,
//! download), the [`ProviderRegistry`] that routes provider-prefixed chat
//! ids, outbound message formatting, and an in-memory mock provider used
//! throughout the host's tests.

pub mod format;
pub mod mock;
pub mod registry;
pub mod traits;

pub use mock::MockProvider;
pub use registry::ProviderRegistry;
pub use traits::{
    MediaPayload, MessageId, OutboundMessage, Provider, ProviderError, ProviderHost,
};
