//! Realtime channels: access-controlled pub/sub, rate limiting, reconnect
//! supervision and hot-reload coordination.

mod bus;
mod hot_reload;
mod message;
mod policy;
mod rate_limit;
mod reconnect;

pub use bus::{
    BusConfig, ChannelBus, MessageHandler, PublishOptions, PublishReceipt, Subscription,
    SubscriptionHandle,
};
pub use hot_reload::{
    BusReloadPublisher, HotReloadConfig, HotReloadCoordinator, HotReloadHandle, RebuildTrigger,
    ReloadPublisher,
};
pub use message::{
    BroadcastMessage, BulkFileChange, ChangeAction, EventPayload, FileBulkUpdate, FileDelete,
    FileUpdate, HotReload, Priority, SessionStatusEvent,
};
pub use policy::{
    Access, AccessPolicySet, ChannelAccessPolicy, Role, Subject, ROLES_HEADER, USER_HEADER,
};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use reconnect::{ConnectionState, ReconnectPolicy, Reconnector};

/// Channel carrying file events for a project.
pub fn files_channel(project_id: &str) -> String {
    format!("project:{project_id}:files")
}

/// Channel carrying reload notifications for a project.
pub fn reload_channel(project_id: &str) -> String {
    format!("project:{project_id}:reload")
}

/// Channel carrying status updates for a session.
pub fn session_channel(session_id: &str) -> String {
    format!("session:{session_id}")
}
