pub mod accounts;
pub mod decrypt;
pub mod feed;
pub mod keys;
pub mod ledger;
pub mod providers;
pub mod sampler;
pub mod scoring;
pub mod similar;
