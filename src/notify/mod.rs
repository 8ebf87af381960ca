//! Push notification delivery and click routing.

mod dispatcher;
mod intent;

pub use dispatcher::{ClickOutcome, NotificationDispatcher};
pub use intent::NotificationIntent;
