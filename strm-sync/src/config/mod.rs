//! Runtime configuration.
//!
//! Settings live in the `global_config` table and are exposed to services as
//! immutable snapshots that are swapped on every update.

pub mod events;
pub mod service;
pub mod settings;

pub use events::{ConfigEventBroadcaster, ConfigUpdateEvent};
pub use service::{ConfigService, SettingsSubscriber, validate_task};
pub use settings::{
    AppSettings, DEFAULT_PER_PAGE, NotificationSettings, PacingSettings, QueueSettings,
    RemoteSettings, RetentionSettings, SchedulerSettings, StrmSettings,
};
