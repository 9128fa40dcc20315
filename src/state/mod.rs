// SQLite-backed persistence for instance specs, states and metadata.
pub mod store;

pub use store::StateStore;
