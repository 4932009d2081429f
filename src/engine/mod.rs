mod connection;
pub mod registry;
pub mod server;

pub use registry::{JoinTarget, Joined, SessionRegistry};
pub use server::EngineServer;
