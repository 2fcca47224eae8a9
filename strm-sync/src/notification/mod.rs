//! Run outcome notifications.
//!
//! Outcomes are queued in the database and delivered by
//! [`NotificationDispatcher`] through the configured channels (Telegram,
//! WeWork, webhook). Each channel renders its own template from
//! [`TemplateConfig`].

pub mod channels;
pub mod events;
pub mod service;
pub mod template;

pub use channels::{ChannelConfig, NotificationChannel};
pub use events::{RunNotification, TemplateType};
pub use service::NotificationDispatcher;
pub use template::TemplateConfig;
