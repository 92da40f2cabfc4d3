//! Messaging core.
//!
//! ## Architecture
//!
//! ```text
//!            publish / subscribe / send_intent
//!                          │
//!                   ┌──────▼───────┐     ┌───────────────┐
//!                   │  MessageBus  ├────►│ IntentRouter  │
//!                   └──┬────────┬──┘     └───────────────┘
//!        fan-out       │        │  send(message)
//!   ┌──────────────────▼──┐  ┌──▼─────────────┐
//!   │ SubscriptionRegistry│  │   Transport    │ (injected)
//!   └─────────────────────┘  └────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`Message`]: immutable envelope (category, topic, payload, correlation)
//! - [`SubscriptionRegistry`]: ordered handler lists per route
//! - [`MessageBus`]: validation, fan-out, plugins, intents, stats
//! - [`BatchDispatcher`]: parallel and sequential lanes for batches
//! - [`Transport`]: the outbound sink, with [`ChannelTransport`] and [`BusSink`]
//!
//! ## Usage
//!
//! ```ignore
//! use plugbus::messaging::{handler_fn, Category, Message, MessageBus, Route};
//!
//! let bus = MessageBus::new();
//! let sub = bus.subscribe(
//!     Route::topic(Category::Notice, "test.ping"),
//!     handler_fn(|msg| async move {
//!         println!("got {}", msg.topic());
//!         Ok(())
//!     }),
//! );
//!
//! assert_eq!(bus.publish(Message::notice("test.ping", json!({}))).await, 1);
//! sub.unsubscribe();
//! ```

mod batch;
mod bus;
mod subscription;
mod transport;
mod types;

pub use batch::{BatchDispatcher, BatchError, BatchFailure, BatchResult, BatchStats, SAFE_PARALLEL_TOPICS};
pub use bus::{BusBuilder, BusError, BusLink, BusSink, BusStats, MessageBus, Subscription};
pub use subscription::{
    handler_fn, same_handler, ArcHandler, ExportedSubscription, MessageHandler, Route,
    SubscriptionId, SubscriptionOrigin, SubscriptionRegistry,
};
pub use transport::{ChannelReceiver, ChannelTransport, Transport, TransportError};
pub use types::*;
