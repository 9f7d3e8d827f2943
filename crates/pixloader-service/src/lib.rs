//! The load-coordination core of pixloader.
//!
//! An [`ImageLoader`](loader::ImageLoader) turns a [`Request`](types::Request) for an image URI
//! into a display-ready [`Drawable`](drawable::Drawable), going through the memory cache, the disk
//! cache and finally the network, while making sure that concurrent requests for the same key
//! only do the work once.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod decode;
pub mod drawable;
pub mod fetch;
pub mod loader;
pub mod logging;
pub mod source;
pub mod types;
pub mod utils;
