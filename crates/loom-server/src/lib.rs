mod client;
mod emit;
mod export;
mod handlers;
mod server;

pub use client::{ClientHandle, ClientId, ClientRegistry};
pub use emit::emitter_for;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
