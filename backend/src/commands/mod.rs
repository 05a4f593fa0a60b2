pub mod chat_commands;
pub mod model_commands;
pub mod project_commands;
