pub mod binder;
pub mod error;
pub mod models;
pub mod quote_book;
pub mod repository;
pub mod status_machine;

pub use binder::*;
pub use error::*;
pub use models::*;
pub use quote_book::*;
pub use repository::*;
pub use status_machine::*;
