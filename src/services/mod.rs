pub mod cache;
pub mod context;
pub mod detector;
pub mod error;
pub mod gateway;
pub mod listing;
pub mod settings;
#[cfg(test)]
pub mod testing;
pub mod versions;
