//! HTTP surface.

mod migration_routes;
mod state;

pub use migration_routes::create_migration_router;
pub use state::AppState;
