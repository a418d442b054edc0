pub mod aggregate;
#[cfg(feature = "browser")]
pub mod browser;
pub mod captcha;
pub mod classify;
pub mod config;
pub mod courts;
pub mod crawl;
pub mod extract;
pub mod fetch;
pub mod model;
pub mod portal;
pub mod resume;
pub mod session;
pub mod store;
