pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod request;
pub mod response;
pub mod search;
pub mod selection;
pub mod store;
pub mod transition;
