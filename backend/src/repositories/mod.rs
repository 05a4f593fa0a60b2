pub mod conversation_repo;
pub mod model_repo;
pub mod project_repo;
pub mod user_repo;
