mod repository;

pub use repository::SqliteLocalStore;
