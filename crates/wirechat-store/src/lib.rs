pub mod calls;
pub mod database;
pub mod friends;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod rooms;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
