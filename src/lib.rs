pub mod builder;
pub mod common;
pub mod graph;
pub mod opcache;
pub mod pass;
pub mod pprint;
pub mod taskdef;
