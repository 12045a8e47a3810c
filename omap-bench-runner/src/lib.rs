pub mod aggregate;
pub mod build;
pub mod driver;
pub mod extract;
pub mod store;
pub mod trial;
