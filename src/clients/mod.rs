pub mod db;
pub mod object_store;

pub use db::*;
pub use object_store::*;
