//! Gateway server implementation

pub mod auth_info;
pub mod chat;
pub mod mcp;
pub mod passthrough;
mod router;
mod server;

pub use auth_info::{AuthInformation, auth_info_middleware, read_auth_information};
pub use chat::{
    ChatCompletionManager, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, CompletionBackend,
    CompletionContext,
};
pub use mcp::RemoteToolClient;
pub use passthrough::{PassThroughBackend, PassThroughTokenManager, UpstreamAuth};
pub use router::{AppState, create_router};
pub use server::Gateway;
