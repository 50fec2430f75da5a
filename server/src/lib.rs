pub mod config;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod sales;
pub mod services;
pub mod store;
pub mod utils;

#[cfg(test)]
mod testing;
