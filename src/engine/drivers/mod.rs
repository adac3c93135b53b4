//! Database Drivers
//!
//! One [`Driver`](crate::engine::traits::Driver) per backend kind.

pub mod mongodb;
pub mod postgres;

pub use self::mongodb::{MongoDriver, MongoStore};
pub use self::postgres::{PostgresDriver, PostgresEngine};
