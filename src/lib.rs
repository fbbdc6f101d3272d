pub mod backend;
pub mod content;
pub mod enrich;
pub mod error;
pub mod filter;
pub mod live;
pub mod mutations;
pub mod notice;
pub mod settings;
pub mod utils;
