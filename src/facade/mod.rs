pub mod http;
pub mod rpc;
pub mod stdio;
pub mod tls;

pub use http::{HttpState, build_router, serve_http};
pub use rpc::McpFacade;
pub use stdio::serve_stdio;
