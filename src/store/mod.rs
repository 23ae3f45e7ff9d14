/// Persistence layer
///
/// SQLite via sqlx for workflow definitions and execution runs. The engine only
/// depends on the `ExecutionRepository` contract.

// Connection pool and schema
pub mod database;

// Workflow definition CRUD
pub mod workflows;

// Execution run repository contract and SQLite implementation
pub mod executions;

pub use database::Database;
pub use executions::{ExecutionRepository, SqliteExecutionStore};
pub use workflows::WorkflowStorage;
