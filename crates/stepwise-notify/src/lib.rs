pub mod dispatch;
pub mod log;
pub mod telegram;
pub mod util;
pub mod webhook;

pub use dispatch::{build_notifiers, NotifierSet};
pub use log::LogNotifier;
pub use telegram::TelegramNotifier;
pub use webhook::WebhookNotifier;
