/// PostgreSQL-backed job store implementation.
pub mod postgres;

pub use postgres::PostgresJobStore;
