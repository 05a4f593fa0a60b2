pub mod context_service;
pub mod conversation_service;
pub mod fanout_service;
pub mod model_service;
pub mod provider_client;
