mod cache;
mod client;
pub mod pagination;
pub mod types;


pub use client::{api_base_url, GitHubClient};
