pub mod client;
pub mod interceptor;
pub mod request;

pub use client::{ApiClient, ApiError, ApiResponse, ErrorExtractor};
pub use interceptor::{
    accept_language, user_agent, user_agent_for, ProviderHeaders, RequestInterceptor,
    RetryDecision, SessionState, SharedCredential,
};
pub use request::{Method, ParameterEncoding, RequestContext};
