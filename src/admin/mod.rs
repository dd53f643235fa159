//! Admin HTTP surface: health, Prometheus scrape, ban management and status.

mod routes;
mod server;

pub use routes::{router, AdminError, AdminState};
pub use server::AdminServer;
