pub mod auth;
pub mod cli;
pub mod config;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod terminal;

#[cfg(test)]
mod tests;
