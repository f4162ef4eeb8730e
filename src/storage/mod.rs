mod db;

pub use db::{Database, UnitOfWork, DB_FILE_NAME};
pub(crate) use db::default_data_dir;
