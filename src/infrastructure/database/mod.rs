pub mod connection;
pub mod db_execution_diffs;
pub mod db_outputs;
pub mod db_schema;
pub mod db_sessions;
pub mod repository;
pub mod timestamps;

pub use connection::Database;
pub use db_execution_diffs::ExecutionDiffMethods;
pub use db_outputs::OutputMethods;
pub use db_schema::initialize_schema;
pub use db_sessions::SessionMethods;
