// Server collaborator clients
pub mod server_client;

#[cfg(test)]
pub mod testing;

pub use server_client::{HttpNotifier, NoopNotifier, ServerNotifier};
