//! An event-driven HTTP/1.x server core.
//!
//! One `Runtime` (frozen configuration, phase engine, filter chains, the
//! accept mutex) is shared by a set of `Worker`s; each worker owns a
//! reactor, a connection pool and a timer structure and serves its
//! connections to completion without touching its siblings' state.

pub mod buf;
pub mod config;
pub mod conn;
pub mod error;
pub mod event;
pub mod http;
pub mod listener;
pub mod prelude;
pub mod runtime;
pub mod time;
pub mod worker;

pub use crate::buf::{Buf, BufKind, BufTag, Chain};
pub use crate::config::{
    AppConfig, ErrorPage, EventsConfig, HttpConfig, ListenConfig, LocationConfig,
    LocationModifier, ReturnDirective, RewriteFlag, RewriteRule, ServerConfig, TryFilesConfig,
};
pub use crate::error::{ParseError, Result, ServerError};
pub use crate::http::filter::FilterCode;
pub use crate::http::lifecycle::Fin;
pub use crate::http::phase::{Phase, PhaseCode, PhaseHandlerFn};
pub use crate::http::{Method, Version};
pub use crate::runtime::{spawn_workers, Hooks, Runtime};
pub use crate::worker::{Rid, Worker};
