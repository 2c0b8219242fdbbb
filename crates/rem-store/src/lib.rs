pub mod config;
pub mod error;
pub mod schema;
pub mod store;

pub use config::{
    CONFIG_FILE, DATA_DIR_ENV, DB_FILE, default_base_dir, load_config, open_default,
};
pub use error::{Result, StoreError};
pub use store::{Store, StoreStats};
