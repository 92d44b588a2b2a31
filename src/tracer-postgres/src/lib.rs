pub mod bootstrap;
pub mod store;

pub use bootstrap::TableBootstrapper;
pub use store::PgTraceStore;
