pub mod anthropic;
pub mod command;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use command::CommandClient;
pub use openai::OpenAiClient;
