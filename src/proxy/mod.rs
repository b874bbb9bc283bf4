//! The interception proxy core.
//!
//! Modules, wire-side first:
//! - [`server`]: listeners, dispatcher, lifecycle
//! - [`connect`]: CONNECT tunnels (intercept / transpond)
//! - [`interceptor`]: in-process TLS terminator
//! - [`pipeline`]: the per-flow forward state machine
//! - [`outbound`]: origin dials and the two client paths
//! - [`upstream`]: upstream proxy resolution
//! - [`socks`]: SOCKS5 front-end
//! - [`flow`], [`addon`], [`body`]: the data model addons program against
//!
//! # Example
//!
//! ```ignore
//! use spyglass::{Options, Proxy};
//!
//! let mut proxy = Proxy::new(Options::default())?;
//! proxy.add_addon(std::sync::Arc::new(MyAddon));
//! proxy.run().await?;
//! ```

pub mod addon;
pub mod body;
mod connect;
pub mod flow;
mod interceptor;
mod outbound;
mod pipeline;
pub mod server;
mod socks;
pub mod upstream;

pub use addon::Addon;
pub use body::{BodyReader, ProxyBody};
pub use flow::{ClientConn, ConnContext, Flow, FlowRequest, FlowResponse, RequestUrl};
pub use server::{InterceptFn, Proxy, ProxyHandle};
pub use upstream::{parse_upstream, UpstreamAddr, UpstreamFn};
