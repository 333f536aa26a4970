pub mod fixtures;
pub mod http;
pub mod mock_client;
pub mod notifiers;

pub use fixtures::*;
pub use http::{CaptureServer, CapturedRequest};
pub use mock_client::{MockCompletionClient, MockReply};
pub use notifiers::{FailingNotifier, RecordingNotifier};
